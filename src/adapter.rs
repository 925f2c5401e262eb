//! Translates passthrough-layer callbacks into dedup engine operations,
//! with the retry and blacklist policy spec.md section 4.5 assigns to
//! this layer. Grounded on `sha1fs.py`'s `afterRelease`/`afterUnlink`/
//! `afterRename` hooks.

use crate::dedup::DedupEngine;
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Paths containing this substring are never checksummed. Matches the
/// original blacklist, which exists so that files swept into a desktop
/// trash can (themselves often already-deduped hard links bound for
/// deletion) don't churn the index on their way out.
const BLACKLIST_SUBSTRING: &str = ".Trash";

const MAX_RELEASE_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Binds a `DedupEngine` to the absolute backing root and exposes the
/// three callbacks the passthrough daemon drives.
pub struct FsEventAdapter {
    engine: DedupEngine,
    backing_root: PathBuf,
}

impl FsEventAdapter {
    pub fn new(engine: DedupEngine, backing_root: PathBuf) -> Self {
        FsEventAdapter { engine, backing_root }
    }

    pub fn engine(&self) -> &DedupEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut DedupEngine {
        &mut self.engine
    }

    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    /// Composes a mount-relative path (as delivered by the FUSE layer)
    /// with the backing root, as every callback below expects.
    pub fn backing_path(&self, mount_relative: &Path) -> PathBuf {
        let relative = mount_relative.strip_prefix("/").unwrap_or(mount_relative);
        if relative.as_os_str().is_empty() {
            self.backing_root.clone()
        } else {
            self.backing_root.join(relative)
        }
    }

    fn is_blacklisted(path: &Path) -> bool {
        path.to_string_lossy().contains(BLACKLIST_SUBSTRING)
    }

    /// Called after a file handle on `backing_path` is released (closed).
    /// Retries `update_checksum` up to `MAX_RELEASE_ATTEMPTS` times, linearly
    /// spaced, never propagating failure to the caller: a release that
    /// can't get the checksum updated logs and moves on, since blocking the
    /// filesystem's `close()` on index housekeeping would be a much worse
    /// user-visible failure than a stale checksum.
    pub fn after_release(&mut self, backing_path: &Path) {
        if Self::is_blacklisted(backing_path) {
            return;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.engine.update_checksum(backing_path) {
                Ok(()) => return,
                Err(e) if attempt < MAX_RELEASE_ATTEMPTS && e.is_retryable() => {
                    log::warn!(
                        "after_release: update_checksum({}) attempt {attempt} failed ({e}), retrying",
                        backing_path.display()
                    );
                    thread::sleep(RETRY_DELAY * attempt);
                },
                Err(e) => {
                    log::error!(
                        "after_release: update_checksum({}) failed after {attempt} attempt(s): {e}",
                        backing_path.display()
                    );
                    return;
                },
            }
        }
    }

    /// Called after `backing_path` is unlinked.
    pub fn after_unlink(&mut self, backing_path: &Path) -> Result<()> {
        self.engine.remove(backing_path)
    }

    /// Called after a rename from `old_backing_path` to `new_backing_path`.
    pub fn after_rename(&mut self, old_backing_path: &Path, new_backing_path: &Path) -> Result<()> {
        let old = old_backing_path.to_string_lossy().into_owned();
        let new = new_backing_path.to_string_lossy().into_owned();
        self.engine.update_path(&old, &new)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;
    use crate::index::ChecksumIndex;
    use std::fs;
    use tempfile::tempdir;

    fn adapter(dir: &Path) -> FsEventAdapter {
        let index = ChecksumIndex::open(dir.join("index.db"), Algorithm::Sha1).unwrap();
        FsEventAdapter::new(DedupEngine::new(index), dir.join("backing"))
    }

    #[test]
    fn backing_path_composes_root_and_relative() {
        let dir = tempdir().unwrap();
        let adapter = adapter(dir.path());
        let composed = adapter.backing_path(Path::new("/a/b.txt"));
        assert_eq!(composed, dir.path().join("backing/a/b.txt"));
    }

    #[test]
    fn backing_path_of_root_is_backing_root() {
        let dir = tempdir().unwrap();
        let adapter = adapter(dir.path());
        assert_eq!(adapter.backing_path(Path::new("/")), dir.path().join("backing"));
    }

    #[test]
    fn after_release_indexes_file() {
        let dir = tempdir().unwrap();
        let mut adapter = adapter(dir.path());
        fs::create_dir_all(dir.path().join("backing")).unwrap();
        let file = dir.path().join("backing/a.txt");
        fs::write(&file, b"hello").unwrap();

        adapter.after_release(&file);

        assert!(adapter.engine().index().get(&file).unwrap().is_some());
    }

    #[test]
    fn after_release_skips_blacklisted_path() {
        let dir = tempdir().unwrap();
        let mut adapter = adapter(dir.path());
        fs::create_dir_all(dir.path().join("backing/.Trash")).unwrap();
        let file = dir.path().join("backing/.Trash/a.txt");
        fs::write(&file, b"hello").unwrap();

        adapter.after_release(&file);

        assert!(adapter.engine().index().get(&file).unwrap().is_none());
    }

    #[test]
    fn after_unlink_removes_row() {
        let dir = tempdir().unwrap();
        let mut adapter = adapter(dir.path());
        fs::create_dir_all(dir.path().join("backing")).unwrap();
        let file = dir.path().join("backing/a.txt");
        fs::write(&file, b"hello").unwrap();
        adapter.after_release(&file);

        adapter.after_unlink(&file).unwrap();

        assert!(adapter.engine().index().get(&file).unwrap().is_none());
    }

    #[test]
    fn after_rename_rewrites_prefix() {
        let dir = tempdir().unwrap();
        let mut adapter = adapter(dir.path());
        adapter.engine_mut().index().upsert(Path::new("/backing/old.txt"), "aaaa", false).unwrap();

        adapter.after_rename(Path::new("/backing/old.txt"), Path::new("/backing/new.txt")).unwrap();

        assert!(adapter.engine().index().get(Path::new("/backing/new.txt")).unwrap().is_some());
        assert!(adapter.engine().index().get(Path::new("/backing/old.txt")).unwrap().is_none());
    }
}
