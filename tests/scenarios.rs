//! End-to-end seed scenarios driving `ChecksumIndex` and `DedupEngine`
//! together against a real backing tree, in the spirit of the teacher's
//! `tests/scantest.rs` full-scan integration test (as opposed to the
//! per-method unit tests living in each `src/*.rs` module).

use csumfs::digest::Algorithm;
use csumfs::index::ChecksumIndex;
use csumfs::dedup::DedupEngine;
use std::fs;
use tempfile::tempdir;

fn engine(db_dir: &std::path::Path) -> DedupEngine {
    let index = ChecksumIndex::open(db_dir.join("index.db"), Algorithm::Sha1).unwrap();
    DedupEngine::new(index)
}

#[test]
fn fresh_mount_with_two_identical_files_converges_to_one_inode() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    fs::create_dir_all(&backing).unwrap();
    let a = backing.join("a.bin");
    let b = backing.join("b.bin");
    fs::write(&a, b"seed content").unwrap();
    fs::write(&b, b"seed content").unwrap();

    let mut engine = engine(dir.path());
    engine.update_checksum(&a).unwrap();
    engine.update_checksum(&b).unwrap();

    let row_a = engine.index().get(&a).unwrap().unwrap();
    let row_b = engine.index().get(&b).unwrap().unwrap();
    assert_eq!(row_a.digest, row_b.digest);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(fs::metadata(&a).unwrap().ino(), fs::metadata(&b).unwrap().ino());
    }
}

#[test]
fn divergent_rewrite_breaks_the_relink() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    fs::create_dir_all(&backing).unwrap();
    let a = backing.join("a.bin");
    let b = backing.join("b.bin");
    fs::write(&a, b"shared").unwrap();
    fs::write(&b, b"shared").unwrap();

    let mut engine = engine(dir.path());
    engine.update_checksum(&a).unwrap();
    engine.update_checksum(&b).unwrap();

    // a.bin is rewritten with new content and released again; b.bin still
    // holds the old bytes and was never touched again.
    fs::write(&a, b"rewritten").unwrap();
    engine.update_checksum(&a).unwrap();

    let row_a = engine.index().get(&a).unwrap().unwrap();
    let row_b = engine.index().get(&b).unwrap().unwrap();
    assert_ne!(row_a.digest, row_b.digest);

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_ne!(fs::metadata(&a).unwrap().ino(), fs::metadata(&b).unwrap().ino());
    }
}

#[test]
fn subtree_rename_rewrites_every_row_under_the_old_prefix() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    let dir_a = backing.join("dirA");
    fs::create_dir_all(dir_a.join("nested")).unwrap();
    fs::write(dir_a.join("top.bin"), b"one").unwrap();
    fs::write(dir_a.join("nested/deep.bin"), b"two").unwrap();

    let mut engine = engine(dir.path());
    engine.update_all(&backing).unwrap();

    let dir_b = backing.join("dirB");
    fs::rename(&dir_a, &dir_b).unwrap();
    let old_prefix = dir_a.to_string_lossy().into_owned() + "/";
    let new_prefix = dir_b.to_string_lossy().into_owned() + "/";
    engine.update_path(&old_prefix, &new_prefix).unwrap();

    let all = engine.index().all_paths().unwrap();
    assert!(all.iter().any(|p| p == &dir_b.join("top.bin")));
    assert!(all.iter().any(|p| p == &dir_b.join("nested/deep.bin")));
    assert!(!all.iter().any(|p| p.starts_with(&dir_a)));
}

#[test]
fn vacuum_prunes_rows_for_files_deleted_outside_the_mount() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    fs::create_dir_all(&backing).unwrap();
    let gone = backing.join("gone.bin");
    fs::write(&gone, b"will be deleted behind the mount's back").unwrap();

    let mut engine = engine(dir.path());
    engine.update_checksum(&gone).unwrap();
    assert!(engine.index().get(&gone).unwrap().is_some());

    fs::remove_file(&gone).unwrap();
    assert!(engine.index().get(&gone).unwrap().is_some(), "row persists until vacuum runs");

    let removed = engine.vacuum().unwrap();
    assert_eq!(removed, 1);
    assert!(engine.index().get(&gone).unwrap().is_none());
}

#[test]
fn offline_dedup_without_symlink_leaves_one_survivor_under_dupdir() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    fs::create_dir_all(backing.join("sub")).unwrap();
    let a = backing.join("a.bin");
    let b = backing.join("sub/b.bin");
    fs::write(&a, b"quarantine me").unwrap();
    fs::write(&b, b"quarantine me").unwrap();

    // Seed the duplicate rows directly rather than through `update_all`:
    // the online path would already hard-link and relink the second file,
    // marking its row with the overloaded symlink flag and excluding it
    // from `duplicate_non_symlink_paths`, leaving nothing for the offline
    // pass to do.
    let mut engine = engine(dir.path());
    engine.index().upsert(&a, "same", false).unwrap();
    engine.index().upsert(&b, "same", false).unwrap();

    let dupdir = dir.path().join("dupdir");
    engine.dedup(&dupdir, false).unwrap();

    // a.bin is the first (canonical) member of the duplicate set and is
    // retained at its original path; only b.bin is quarantined.
    assert!(a.exists());
    assert!(!b.exists());
    assert!(engine.index().get(&a).unwrap().is_some());
    assert!(engine.index().get(&b).unwrap().is_none());

    let moved: Vec<_> = walk(&dupdir);
    assert_eq!(moved.len(), 1);
}

#[test]
fn broken_symlink_is_logged_and_skipped_not_fatal() {
    let dir = tempdir().unwrap();
    let backing = dir.path().join("backing");
    fs::create_dir_all(&backing).unwrap();
    let link = backing.join("dangling");
    #[cfg(unix)]
    std::os::unix::fs::symlink(backing.join("never-existed"), &link).unwrap();

    let mut engine = engine(dir.path());
    #[cfg(unix)]
    {
        engine.update_checksum(&link).unwrap();
        assert!(engine.index().get(&link).unwrap().is_none());
    }
}

fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = fs::read_dir(&d) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}
