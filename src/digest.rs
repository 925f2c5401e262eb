//! Streamed content digests, grounded on `fusesha1util.py`'s `fileChecksum`
//! (stream in chunks of `128 * block_size` bytes) but using the RustCrypto
//! `sha1`/`md-5` crates instead of hand-rolled hashing.

use crate::error::{CoreError, Result};
use md5::Md5;
use sha1::Sha1;
use sha1::Digest as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// The two checksum algorithms a database may be created with. Fixed at
/// database creation time (spec.md invariant I2); never mixed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Sha1,
    Md5,
}

impl Algorithm {
    /// The string stored in the `versioning` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Md5 => "md5",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha1" => Ok(Algorithm::Sha1),
            "md5" => Ok(Algorithm::Md5),
            other => Err(CoreError::Config(format!("unknown checksum algorithm {other:?} in versioning table"))),
        }
    }

    /// Hex digest length for this algorithm (spec.md section 3: 40 for sha1, 32 for md5).
    pub fn hex_len(self) -> usize {
        match self {
            Algorithm::Sha1 => 40,
            Algorithm::Md5 => 32,
        }
    }

    /// Streaming block size, matching hashlib's `block_size` (64 bytes for
    /// both SHA-1 and MD5) multiplied by the original 128x chunking factor.
    fn chunk_size(self) -> usize {
        128 * 64
    }
}

/// Streams the file at `path` and returns its lowercase hex digest under
/// `algorithm`. Fails with an I/O error for absent or unreadable paths.
pub fn digest(path: impl AsRef<Path>, algorithm: Algorithm) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; algorithm.chunk_size()];

    let hex = match algorithm {
        Algorithm::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        },
        Algorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hex::encode(hasher.finalize())
        },
    };

    debug_assert_eq!(hex.len(), algorithm.hex_len());
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    // Fixture content and digests computed independently with `sha1sum`/`md5sum`;
    // the original fixture referenced by the source this spec was distilled
    // from does not ship with it (see SPEC_FULL.md section 8).
    const FIXTURE: &[u8] = b"Hello, World!";
    const FIXTURE_SHA1: &str = "0a0a9f2a6772942557ab5355d76af442f8f65e01";
    const FIXTURE_MD5: &str = "65a8e27d8879283831b664bd8b7f0ad4";

    #[test]
    fn sha1_fixed_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, FIXTURE).unwrap();
        assert_eq!(digest(&path, Algorithm::Sha1).unwrap(), FIXTURE_SHA1);
    }

    #[test]
    fn md5_fixed_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture.txt");
        fs::write(&path, FIXTURE).unwrap();
        assert_eq!(digest(&path, Algorithm::Md5).unwrap(), FIXTURE_MD5);
    }

    #[test]
    fn digest_length_matches_algorithm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"arbitrary content spanning multiple chunks".repeat(1000)).unwrap();
        assert_eq!(digest(&path, Algorithm::Sha1).unwrap().len(), 40);
        assert_eq!(digest(&path, Algorithm::Md5).unwrap().len(), 32);
    }

    #[test]
    fn digest_missing_path_is_io_error() {
        let err = digest("/nonexistent/does/not/exist", Algorithm::Sha1).unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn digest_is_stable_across_chunk_boundary() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big");
        // Exceeds the 8192-byte streaming chunk size so multiple reads happen.
        let content = vec![0x42u8; 8192 * 3 + 17];
        fs::write(&path, &content).unwrap();
        let a = digest(&path, Algorithm::Sha1).unwrap();
        let b = digest(&path, Algorithm::Sha1).unwrap();
        assert_eq!(a, b);
    }
}
