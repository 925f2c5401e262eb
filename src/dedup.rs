//! The dedup engine: keeps the checksum index in sync with the backing
//! tree and collapses same-content files into hard links, online and
//! offline.
//!
//! Grounded on `sha1db.py`'s `Sha1DB` methods (`_updateChecksumAndLink`,
//! `_hardlinkDup`, `updateAllChecksums`, `updatePath`, `removeChecksum`,
//! `dedup`, `vacuum`) and on `fusesha1util.py`'s `moveFile`.

use crate::digest;
use crate::error::{CoreError, Result};
use crate::index::{self, ChecksumIndex};
use crate::path_utils::{self, inode_identity};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct DedupEngine {
    index: ChecksumIndex,
}

impl DedupEngine {
    pub fn new(index: ChecksumIndex) -> Self {
        DedupEngine { index }
    }

    pub fn index(&self) -> &ChecksumIndex {
        &self.index
    }

    pub fn into_index(self) -> ChecksumIndex {
        self.index
    }

    /// Recomputes the digest for `path` and online-dedups it against its
    /// peers. A no-op (not an error) if `path` no longer exists -- a racing
    /// unlink between the triggering event and this call is expected, not
    /// exceptional.
    ///
    /// The digest is computed outside any transaction (it can be slow for
    /// large files and doesn't need one); the upsert, peer lookup, and
    /// relink marks run inside a single transaction together with the
    /// hard-link syscalls they authorize, so a mid-sequence failure -- most
    /// notably a cross-device link -- rolls the index back to its
    /// pre-update state instead of claiming a relink that never happened.
    pub fn update_checksum(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            log::debug!("update_checksum: {} no longer exists, skipping", path.display());
            return Ok(());
        }

        let algorithm = self.index.algorithm();
        let content_digest = digest::digest(path, algorithm)?;
        let is_symlink = path_utils::is_symlink_flag(path) == 1;

        let txn = self.index.transaction()?;
        index::upsert_conn(&txn, path, &content_digest, is_symlink)?;

        if !is_symlink {
            let path_inode = inode_identity(path)?;
            let peers = index::peers_by_digest_conn(&txn, &content_digest, path)?;
            let differing_from_path: Vec<PathBuf> =
                peers.into_iter().filter(|p| inode_identity(p).map(|i| i != path_inode).unwrap_or(true)).collect();

            if let Some((canonical, rest)) = differing_from_path.split_first() {
                let canonical = canonical.clone();
                let canonical_inode = inode_identity(&canonical)?;

                let mut candidates: Vec<PathBuf> = rest.to_vec();
                candidates.push(path.to_path_buf());
                let targets: Vec<PathBuf> =
                    candidates.into_iter().filter(|p| inode_identity(p).map(|i| i != canonical_inode).unwrap_or(true)).collect();

                for target in &targets {
                    index::set_is_symlink_conn(&txn, target, true)?;
                }
                for target in &targets {
                    path_utils::hard_link(&canonical, target)?;
                }
            }
        }

        txn.commit().map_err(CoreError::from)
    }

    /// Walks `backing_root` depth-first and updates the checksum of every
    /// regular file under it. Matches `updateAllChecksums`'s full-tree
    /// rescan, used at mount time when `--rescan` is passed.
    pub fn update_all(&mut self, backing_root: &Path) -> Result<()> {
        let mut stack = vec![backing_root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("update_all: skipping unreadable directory {}: {e}", dir.display());
                    continue;
                },
            };
            for entry in entries {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                } else {
                    self.update_checksum(&path)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites every indexed path under `old_prefix` to live under
    /// `new_prefix`, following an external rename of a whole subtree.
    pub fn update_path(&mut self, old_prefix: &str, new_prefix: &str) -> Result<usize> {
        self.index.rewrite_prefix(old_prefix, new_prefix)
    }

    /// Removes `path` from the index, following an unlink.
    pub fn remove(&mut self, path: &Path) -> Result<()> {
        self.index.delete(path)
    }

    /// Offline pass: retains the first member of every duplicate set at its
    /// original path as that digest's canonical copy, and moves every other
    /// member into `dupdir`, preserving the portion of each path not shared
    /// with `dupdir` (via `subtree_destination`). The canonical's row is
    /// left untouched. When `do_symlink` is true, each moved path is
    /// replaced with a symlink back to the retained canonical, and its row
    /// is kept (marked via the overloaded symlink flag); otherwise the row
    /// is deleted once the file is moved. Refuses to run if `dupdir`
    /// already contains anything, to avoid silently interleaving with a
    /// previous quarantine.
    ///
    /// Grounded on `sha1db.py`'s `dedup` (its query excludes the canonical
    /// via `link = 1`; this is the equivalent under our single overloaded
    /// `symlink` column: skip the first member, act on the rest).
    pub fn dedup(&mut self, dupdir: &Path, do_symlink: bool) -> Result<()> {
        if dupdir.exists() {
            let has_entries = fs::read_dir(dupdir)?.next().is_some();
            if has_entries {
                return Err(CoreError::Config(format!("{} is not empty", dupdir.display())));
            }
        }

        let rows = self.index.duplicate_non_symlink_paths()?;
        let mut groups: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for (digest, path, _is_symlink) in rows {
            groups.entry(digest).or_default().push(path);
        }

        for (_digest, paths) in groups {
            let mut members = paths.into_iter().filter(|p| path_utils::is_symlink_flag(p) == 0);
            let Some(canonical) = members.next() else {
                continue;
            };

            for path in members {
                if !path.exists() {
                    log::warn!("dedup: {} vanished before it could be quarantined, skipping", path.display());
                    continue;
                }
                let dst = path_utils::subtree_destination(&path, dupdir)?;
                move_file(&path, &dst, !do_symlink)?;

                if do_symlink {
                    self.index.set_is_symlink(&path, true)?;
                    path_utils::symlink(&canonical, &path)?;
                } else {
                    self.index.delete(&path)?;
                }
            }
        }

        Ok(())
    }

    /// Offline pass: drops every indexed row whose backing path no longer
    /// has anything at it on disk.
    pub fn vacuum(&mut self) -> Result<usize> {
        let mut removed = 0;
        for path in self.index.all_paths()? {
            if fs::symlink_metadata(&path).is_err() {
                self.index.delete(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Renames `src` to `dst`, creating `dst`'s parent directories first, and
/// optionally removes `src`'s now-possibly-empty parent directory.
/// Grounded on `fusesha1util.py`'s `moveFile`.
fn move_file(src: &Path, dst: &Path, rm_empty_dirs: bool) -> Result<()> {
    path_utils::safe_make_parents(dst)?;
    fs::rename(src, dst)?;

    if rm_empty_dirs {
        if let Some(parent) = src.parent() {
            if let Ok(mut entries) = fs::read_dir(parent) {
                if entries.next().is_none() {
                    let _ = fs::remove_dir(parent);
                }
            }
        }
    }

    Ok(())
}
