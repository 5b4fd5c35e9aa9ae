//! AllKorrect: a root-privileged sandboxed execution daemon.
//!
//! Clients speak a small framed TCP protocol (see [`frame`]) to stage
//! input files into a blob cache (see [`fs`]), ask the daemon to run an
//! untrusted program against them under `ptrace` (see [`exec`]), and
//! retrieve the resulting output/error blobs. [`session`] dispatches one
//! connection's frames; [`daemon`] accepts connections and owns the
//! process-wide signal and cache-janitor setup.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod codec;
pub mod config;
pub mod daemon;
pub mod error;
pub mod exec;
pub mod fs;
pub mod frame;
mod scope_guard;
pub mod session;

pub use crate::config::Config;
pub use crate::error::{AllKorrectError, Result};
pub use crate::fs::Namespace;
