//! Background cache sweeper.
//!
//! A non-recursive scan of the cache root's top-level regular files,
//! splitting them into tmp-class (leading `_`, always deleted) and
//! cache-class (deleted smallest-first once the total exceeds
//! [`MAX_CACHE_SIZE`]) once they've sat untouched for longer than
//! [`MIN_DELETION_TIME`].

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{AllKorrectError, Result};
use crate::fs::Namespace;

/// A file must be untouched (by atime, ctime, and mtime) this long before
/// the janitor will consider deleting it.
pub const MIN_DELETION_TIME: Duration = Duration::from_secs(600);
/// Total bytes of cache-class blobs the janitor tries to stay under.
pub const MAX_CACHE_SIZE: u64 = 500 * 1024 * 1024;
/// How often the background thread wakes up to sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the background sweeper thread: fire-and-forget, runs for the
/// process lifetime, never joined.
pub fn spawn(namespace: Namespace) {
    std::thread::spawn(move || loop {
        if let Err(e) = sweep(&namespace) {
            log::error!("cache sweep failed: {e}");
        }
        std::thread::sleep(SWEEP_INTERVAL);
    });
}

struct Candidate {
    path: std::path::PathBuf,
    size: u64,
}

/// Runs one sweep of the cache root. Public so tests (and a manual
/// operator trigger, if ever wanted) can call it without waiting on the
/// background thread's sleep.
pub fn sweep(namespace: &Namespace) -> Result<()> {
    let root = namespace.root();
    let now = SystemTime::now();

    let mut tmp = Vec::new();
    let mut cache = Vec::new();
    let mut cache_total: u64 = 0;

    for entry in fs::read_dir(root).map_err(|e| AllKorrectError::io(root, e))? {
        let entry = entry.map_err(|e| AllKorrectError::io(root, e))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| AllKorrectError::io(&path, e))?;
        if !file_type.is_file() {
            continue;
        }
        let meta = fs::metadata(&path).map_err(|e| AllKorrectError::io(&path, e))?;
        if age(&meta, now) < MIN_DELETION_TIME {
            continue;
        }
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('_'))
            .unwrap_or(false);
        let size = meta.len();
        if is_tmp {
            tmp.push(Candidate { path, size });
        } else {
            cache_total += size;
            cache.push(Candidate { path, size });
        }
    }

    let mut deleted = 0u32;

    for c in &tmp {
        if try_delete(&c.path) {
            deleted += 1;
        }
    }

    if cache_total > MAX_CACHE_SIZE {
        cache.sort_by_key(|c| c.size);
        for c in &cache {
            if try_delete(&c.path) {
                cache_total = cache_total.saturating_sub(c.size);
                deleted += 1;
            }
            if cache_total <= MAX_CACHE_SIZE {
                break;
            }
        }
    }

    if deleted > 0 {
        log::info!("cleaned {deleted} blobs");
    }
    Ok(())
}

/// `max(atime, ctime, mtime)`, per spec — `ctime` (inode change time) is
/// not exposed through the portable `Metadata` API, so it's read via
/// `MetadataExt::ctime`/`ctime_nsec`.
fn age(meta: &fs::Metadata, now: SystemTime) -> Duration {
    let mtime = meta.modified().unwrap_or(now);
    let atime = meta.accessed().unwrap_or(mtime);
    let ctime = UNIX_EPOCH
        + Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32);
    let newest = mtime.max(atime).max(ctime);
    now.duration_since(newest).unwrap_or(Duration::ZERO)
}

fn try_delete(path: &Path) -> bool {
    fs::remove_file(path).is_ok()
}
