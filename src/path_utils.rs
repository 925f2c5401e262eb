//! Path manipulation helpers shared by the dedup engine and the offline
//! maintenance passes: computing quarantine destinations, and idempotent
//! mkdir/unlink/link/symlink primitives.
//!
//! Grounded on the original `fusesha1util.py` (`dstWithSubdirectory`,
//! `safeMakedirs`, `safeUnlink`, `linkFile`, `symlinkFile`), with the
//! `subtree_destination` prefix computation redesigned per spec.md section 4.1
//! to always terminate the shared prefix at a path separator.

use crate::error::{CoreError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Absolutizes a path lexically (no symlink resolution, no filesystem
/// access beyond reading the current directory), so it works for paths that
/// don't exist yet.
fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("path must not be empty".into()));
    }
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            },
            Component::CurDir => {},
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Computes where `src` should be placed inside `dstdir`, preserving the
/// portion of `src`'s absolute path that is not shared with `dstdir`.
///
/// The shared prefix is a *string* prefix of the two absolutized paths,
/// extended forward to the next `/` if it doesn't already land on one, so a
/// partial path-component never gets torn in half (spec.md section 4.1,
/// section 8 P6/B1-B3).
pub fn subtree_destination(src: impl AsRef<Path>, dstdir: impl AsRef<Path>) -> Result<PathBuf> {
    let src = src.as_ref();
    let dstdir = dstdir.as_ref();
    if src.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("src must not be empty".into()));
    }
    if dstdir.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("dstdir must not be empty".into()));
    }

    let abs_src = absolutize(src)?;
    let abs_dstdir = absolutize(dstdir)?;
    let src_str = abs_src.to_string_lossy().into_owned();
    let dst_str = abs_dstdir.to_string_lossy().into_owned();

    let raw_len = src_str
        .bytes()
        .zip(dst_str.bytes())
        .take_while(|(a, b)| a == b)
        .count();

    let prefix_len = if src_str.as_bytes().get(raw_len.wrapping_sub(1)) == Some(&b'/') || raw_len == 0 {
        raw_len
    } else {
        match src_str[raw_len..].find('/') {
            Some(offset) => raw_len + offset + 1,
            None => raw_len,
        }
    };

    let prefix = &src_str[..prefix_len];
    let suffix = src_str.strip_prefix(prefix).unwrap_or(&src_str[raw_len..]);
    let suffix = suffix.trim_start_matches('/');

    let newdst = if suffix.is_empty() { abs_dstdir.clone() } else { abs_dstdir.join(suffix) };

    if newdst == abs_src {
        return Err(CoreError::InvalidArgument(format!(
            "{} already lies under {}",
            abs_src.display(),
            abs_dstdir.display()
        )));
    }

    Ok(newdst)
}

/// Ensures the parent directory of `path` exists, creating intermediates.
/// Returns the parent.
pub fn safe_make_parents(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("path must not be empty".into()));
    }
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    if !parent.as_os_str().is_empty() && !parent.exists() {
        fs::create_dir_all(&parent)?;
    }
    Ok(parent)
}

/// Unlinks `path` if it exists; absence is not an error.
pub fn safe_unlink(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("path must not be empty".into()));
    }
    match fs::symlink_metadata(path) {
        Ok(_) => fs::remove_file(path).map_err(CoreError::from),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoreError::from(e)),
    }
}

#[cfg(unix)]
fn same_inode(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_inode(_a: &Path, _b: &Path) -> bool {
    false
}

/// `(dev, ino)` identity of `path`, following symlinks. Used by the dedup
/// engine to tell apart files that merely share a digest from files that
/// are already the same inode.
#[cfg(unix)]
pub(crate) fn inode_identity(path: &Path) -> Result<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
pub(crate) fn inode_identity(_path: &Path) -> Result<(u64, u64)> {
    Err(CoreError::Io(std::io::Error::new(std::io::ErrorKind::Unsupported, "inode identity requires a unix target")))
}

/// Idempotently hard-links `link` to `target`. A no-op if `link` already
/// points at `target`'s inode; otherwise removes any existing `link` and
/// creates a fresh hard link, making parent directories as needed.
pub fn hard_link(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let link = link.as_ref();
    if link.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("link must not be empty".into()));
    }
    if !target.exists() {
        return Err(CoreError::NotFound(target.to_path_buf()));
    }

    if link.exists() && same_inode(target, link) {
        return Ok(());
    }

    safe_make_parents(link)?;
    safe_unlink(link)?;
    fs::hard_link(target, link).map_err(|e| match e.raw_os_error() {
        Some(code) if code == libc::EXDEV => CoreError::CrossDevice { from: target.to_path_buf(), to: link.to_path_buf() },
        _ => CoreError::from(e),
    })
}

/// Creates a symlink at `link` pointing to `target`. `target` must exist at
/// call time (stricter than POSIX `symlink(2)`, preserved per spec.md section
/// 9 Q3). `link` is unlinked first if it already exists.
pub fn symlink(target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let link = link.as_ref();
    if link.as_os_str().is_empty() {
        return Err(CoreError::InvalidArgument("link must not be empty".into()));
    }
    if !target.exists() {
        return Err(CoreError::NotFound(target.to_path_buf()));
    }

    safe_make_parents(link)?;
    safe_unlink(link)?;
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link).map_err(CoreError::from)
    }
    #[cfg(not(unix))]
    {
        Err(CoreError::Io(std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks require a unix target")))
    }
}

/// Returns 1 if `path` is a symlink, 0 otherwise (including if it doesn't
/// exist). Integer form used directly for storage in the index.
pub fn is_symlink_flag(path: impl AsRef<Path>) -> i64 {
    fs::symlink_metadata(path.as_ref()).map(|m| m.file_type().is_symlink()).unwrap_or(false) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn subtree_destination_rejects_nested_src() {
        let err = subtree_destination("/media/cdrom/test.txt", "/media/cdrom").unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn subtree_destination_no_common_prefix() {
        let dst = subtree_destination("/usr/local/test.txt", "/media/cdrom").unwrap();
        assert_eq!(dst, PathBuf::from("/media/cdrom/usr/local/test.txt"));
    }

    #[test]
    fn subtree_destination_partial_common_prefix() {
        let dst = subtree_destination("/media/cdrom/othersubdir/test.txt", "/media/cdrom/subdir").unwrap();
        assert_eq!(dst, PathBuf::from("/media/cdrom/subdir/othersubdir/test.txt"));
    }

    #[test]
    fn subtree_destination_rejects_empty_inputs() {
        assert!(subtree_destination("", "").is_err());
        assert!(subtree_destination("", "subdir").is_err());
        assert!(subtree_destination("something", "").is_err());
    }

    #[test]
    fn safe_make_parents_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c/file.txt");
        let parent1 = safe_make_parents(&target).unwrap();
        let parent2 = safe_make_parents(&target).unwrap();
        assert_eq!(parent1, parent2);
        assert!(parent1.is_dir());
    }

    #[test]
    fn safe_unlink_tolerates_missing() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        safe_unlink(&missing).unwrap();
    }

    #[test]
    fn hard_link_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a");
        let link = dir.path().join("b");
        fs::write(&target, b"hello").unwrap();

        hard_link(&target, &link).unwrap();
        hard_link(&target, &link).unwrap();

        assert!(same_inode(&target, &link));
    }

    #[test]
    fn hard_link_requires_existing_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("missing");
        let link = dir.path().join("link");
        let err = hard_link(&target, &link).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn symlink_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a");
        let link = dir.path().join("b");
        fs::write(&target, b"hello").unwrap();

        symlink(&target, &link).unwrap();
        symlink(&target, &link).unwrap();

        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn symlink_requires_existing_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("missing");
        let link = dir.path().join("link");
        let err = symlink(&target, &link).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn is_symlink_flag_detects_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a");
        let link = dir.path().join("b");
        fs::write(&target, b"hello").unwrap();
        symlink(&target, &link).unwrap();

        assert_eq!(is_symlink_flag(&target), 0);
        assert_eq!(is_symlink_flag(&link), 1);
        assert_eq!(is_symlink_flag(dir.path().join("nonexistent")), 0);
    }
}
