//! Crate-wide error type.
//!
//! Mirrors the error kinds a session can raise: most of them are session
//! fatal (the dispatcher drops the connection after logging), a few are
//! merely a verdict (handled inside [`crate::exec`] and never surface here),
//! and [`AllKorrectError::FatalConfig`] aborts the whole process at startup.

use std::io;
use std::path::PathBuf;

/// Errors raised anywhere in the daemon outside of the sandboxed-execution
/// verdict path.
#[derive(Debug, thiserror::Error)]
pub enum AllKorrectError {
    /// A client-supplied blob/file name violated the naming alphabet.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// A malformed frame, oversize body, unknown type tag, or truncated
    /// string was read off the wire.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A referenced blob or file does not exist.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// A filesystem syscall failed.
    #[error("io error on {path:?}: {source}")]
    Io {
        /// Path the failing operation concerned, when known.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Socket timeout, peer close, or short write.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// A fork/ptrace/rlimit syscall in the sandboxing engine itself
    /// failed — distinct from a sandboxed child's own verdict.
    #[error("sandbox engine error: {0}")]
    Sandbox(String),

    /// Daemon cannot start: missing nobody/nogroup, cannot bind, cannot
    /// create the cache root.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl AllKorrectError {
    /// Wrap an [`io::Error`] with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AllKorrectError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AllKorrectError>;
