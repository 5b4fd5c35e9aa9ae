//! The cache/tmp filesystem namespace.
//!
//! Two file classes share one cache root directory:
//!
//! - **blobs** live directly under the cache root, named by the client
//!   (`[0-9A-Za-z._-]+`, never empty). A name starting with `_` is a
//!   tmp-class blob: an output/error sink, eagerly eligible for janitor
//!   deletion.
//! - **files** live under a per-session tmp directory (also under the
//!   cache root, so the same volume, bind mounts, and quotas apply).
//!
//! At rest every blob is mode `0700`. During `EXEC` the three
//! participating blobs move through restricted modes
//! ([`set_read_only`]/[`set_write_only`]) and [`restore`] always returns
//! them to `0700` on every exit path — the caller drives that with
//! [`crate::scope_guard::ScopeGuard`].

pub mod janitor;

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::{AllKorrectError, Result};

const RANDSTR_LEN: usize = 10;
const ALNUM: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Mode a blob or file sits in outside of any in-progress operation.
pub const MODE_AT_REST: u32 = 0o700;
/// Mode an input blob is given for the duration of an exec.
pub const MODE_READ_ONLY: u32 = 0o744;
/// Mode an output/error sink is given for the duration of an exec.
pub const MODE_WRITE_ONLY: u32 = 0o722;
/// Mode a destination briefly holds mid cross-class move/copy.
pub const MODE_ALL_ACCESS: u32 = 0o777;
/// Mode the per-session tmp directory is created with.
pub const MODE_TMP_DIR: u32 = 0o733;
/// Mode the cache root is created with.
pub const MODE_CACHE_ROOT: u32 = 0o711;

/// Validates a client-supplied blob or file name against the naming
/// alphabet. Empty names, path separators, and anything outside
/// `[0-9A-Za-z._-]` are rejected.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AllKorrectError::InvalidName(name.to_string()));
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if !valid {
        return Err(AllKorrectError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Owns the cache root and hands out paths into it and into per-session
/// tmp directories underneath it.
#[derive(Debug, Clone)]
pub struct Namespace {
    root: PathBuf,
}

impl Namespace {
    /// Open (creating if absent) the cache root at `root`. On a fresh
    /// start the root is created at [`MODE_CACHE_ROOT`]; on restart all
    /// sub-directories (stale per-session tmp dirs) are recursively
    /// removed, leaving top-level blob files untouched.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() {
            remove_sub_dirs(&root)?;
            log::info!("using existing cache directory at {}", root.display());
        } else {
            fs::create_dir(&root).map_err(|e| AllKorrectError::io(&root, e))?;
            fs::set_permissions(&root, fs::Permissions::from_mode(MODE_CACHE_ROOT))
                .map_err(|e| AllKorrectError::io(&root, e))?;
            log::info!("cache directory created at {}", root.display());
        }
        Ok(Namespace { root })
    }

    /// Root directory blobs live directly under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the blob named `name` (not checked for existence).
    pub fn blob_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Creates a fresh, randomly named, empty per-session tmp directory
    /// and returns its path.
    pub fn new_tmp_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join(rand_string());
        fs::create_dir(&dir).map_err(|e| AllKorrectError::io(&dir, e))?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(MODE_TMP_DIR))
            .map_err(|e| AllKorrectError::io(&dir, e))?;
        Ok(dir)
    }

    /// Recursively removes a per-session tmp directory and everything in
    /// it. Best-effort: a missing directory is not an error.
    pub fn remove_tmp_dir(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AllKorrectError::io(dir, e)),
        }
    }

    /// Creates an empty blob named `name` at [`MODE_AT_REST`].
    pub fn new_blob(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        let path = self.blob_path(name);
        create_at_rest(&path)?;
        Ok(path)
    }

    /// Writes `bytes` as the full contents of blob `name`, creating it at
    /// [`MODE_AT_REST`] if absent.
    pub fn put_blob(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        check_name(name)?;
        let path = self.blob_path(name);
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(MODE_AT_REST)
            .open(&path)
            .map_err(|e| AllKorrectError::io(&path, e))?;
        f.write_all(bytes).map_err(|e| AllKorrectError::io(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(MODE_AT_REST))
            .map_err(|e| AllKorrectError::io(&path, e))?;
        Ok(path)
    }

    /// Reads the full contents of blob `name`.
    pub fn get_blob(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let path = self.blob_path(name);
        let mut f = fs::File::open(&path).map_err(|e| AllKorrectError::io(&path, e))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).map_err(|e| AllKorrectError::io(&path, e))?;
        Ok(buf)
    }

    /// True if blob `name` exists.
    pub fn has_blob(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        has_path(&self.blob_path(name))
    }

    /// True if `path` (already resolved into a session tmp dir) exists.
    pub fn has_file(&self, path: &Path) -> Result<bool> {
        has_path(path)
    }
}

fn has_path(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AllKorrectError::io(path, e)),
    }
}

fn create_at_rest(path: &Path) -> Result<()> {
    let f = OpenOptions::new()
        .create(true)
        .write(true)
        .mode(MODE_AT_REST)
        .open(path)
        .map_err(|e| AllKorrectError::io(path, e))?;
    drop(f);
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_AT_REST))
        .map_err(|e| AllKorrectError::io(path, e))
}

/// Sets a blob's mode to [`MODE_READ_ONLY`] for the duration of an exec.
pub fn set_read_only(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_READ_ONLY))
        .map_err(|e| AllKorrectError::io(path, e))
}

/// Sets a blob's mode to [`MODE_WRITE_ONLY`] for the duration of an exec.
pub fn set_write_only(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_WRITE_ONLY))
        .map_err(|e| AllKorrectError::io(path, e))
}

/// Briefly widens a destination to [`MODE_ALL_ACCESS`] mid cross-class
/// move/copy, before [`restore`] settles it back to [`MODE_AT_REST`].
pub fn set_all_access(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_ALL_ACCESS))
        .map_err(|e| AllKorrectError::io(path, e))
}

/// Restores a blob to its at-rest mode. Called unconditionally on every
/// exec exit path and after every move/copy into blob space.
pub fn restore(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MODE_AT_REST))
        .map_err(|e| AllKorrectError::io(path, e))
}

/// One of the two file classes a MOVE/COPY endpoint can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Blob,
    File,
}

/// One of the two operations a cross-namespace transfer can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Move,
    Copy,
}

/// Performs one of the eight MOVE/COPY variants named in the protocol,
/// resolved to this single generic function by `(op, from_class,
/// to_class)` rather than eight near-duplicate implementations.
///
/// Move is a rename; copy is a byte-wise read-then-write (never shells
/// out to `cp`). The destination's permission is set to match its
/// class's invariant: `0700` if landing in blob space, `0777` if landing
/// in file space (files are session-private and have no standing
/// permission discipline of their own beyond "writable").
pub fn transfer(op: Op, from: &Path, to: &Path, to_class: Class) -> Result<()> {
    match op {
        Op::Move => {
            fs::rename(from, to).map_err(|e| AllKorrectError::io(to, e))?;
        }
        Op::Copy => {
            let mut src = fs::File::open(from).map_err(|e| AllKorrectError::io(from, e))?;
            let mut dst = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(MODE_AT_REST)
                .open(to)
                .map_err(|e| AllKorrectError::io(to, e))?;
            std::io::copy(&mut src, &mut dst).map_err(|e| AllKorrectError::io(to, e))?;
        }
    }
    match to_class {
        Class::Blob => restore(to),
        Class::File => set_all_access(to),
    }
}

fn remove_sub_dirs(root: &Path) -> Result<()> {
    let entries = fs::read_dir(root).map_err(|e| AllKorrectError::io(root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| AllKorrectError::io(root, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| AllKorrectError::io(&path, e))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| AllKorrectError::io(&path, e))?;
        }
    }
    Ok(())
}

/// `_` followed by 10 random alphanumerics — the leading underscore
/// marks tmp-class blobs.
pub fn rand_string() -> String {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(RANDSTR_LEN + 1);
    s.push('_');
    for _ in 0..RANDSTR_LEN {
        let idx = rng.gen_range(0..ALNUM.len());
        s.push(ALNUM[idx] as char);
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    fn ns() -> (TempDir, Namespace) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        let ns = Namespace::init(&root).unwrap();
        (dir, ns)
    }

    #[test]
    fn rejects_bad_names() {
        assert!(check_name("").is_err());
        assert!(check_name("a/b").is_err());
        assert!(check_name("a b").is_err());
        assert!(check_name("a$b").is_err());
        assert!(check_name("valid-Name_1.2").is_ok());
    }

    #[test]
    fn rand_string_has_underscore_prefix_and_length() {
        let s = rand_string();
        assert!(s.starts_with('_'));
        assert_eq!(s.len(), RANDSTR_LEN + 1);
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, ns) = ns();
        ns.put_blob("a", b"hello world").unwrap();
        assert_eq!(ns.get_blob("a").unwrap(), b"hello world");
    }

    #[test]
    fn blob_is_mode_0700_at_rest() {
        let (_dir, ns) = ns();
        let path = ns.put_blob("a", b"x").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, MODE_AT_REST);
    }

    #[test]
    fn has_blob_false_when_absent() {
        let (_dir, ns) = ns();
        assert!(!ns.has_blob("missing").unwrap());
    }

    #[test]
    fn move_blob_to_file_restores_all_access_mode() {
        let (_dir, ns) = ns();
        ns.put_blob("a", b"data").unwrap();
        let tmp = ns.new_tmp_dir().unwrap();
        let dest = tmp.join("out");
        transfer(Op::Move, &ns.blob_path("a"), &dest, Class::File).unwrap();
        assert!(!ns.has_blob("a").unwrap());
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, MODE_ALL_ACCESS);
    }

    #[test]
    fn copy_file_to_blob_restores_at_rest_mode_and_keeps_source() {
        let (_dir, ns) = ns();
        let tmp = ns.new_tmp_dir().unwrap();
        let src = tmp.join("in");
        fs::write(&src, b"payload").unwrap();
        let dest = ns.blob_path("b");
        transfer(Op::Copy, &src, &dest, Class::Blob).unwrap();
        assert!(src.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, MODE_AT_REST);
    }

    #[test]
    fn init_on_restart_clears_sub_dirs_but_keeps_blobs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("cache");
        {
            let ns = Namespace::init(&root).unwrap();
            ns.put_blob("kept", b"x").unwrap();
            ns.new_tmp_dir().unwrap();
        }
        let ns = Namespace::init(&root).unwrap();
        assert!(ns.has_blob("kept").unwrap());
        let remaining_dirs = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .count();
        assert_eq!(remaining_dirs, 0);
    }
}
