use std::path::PathBuf;

/// Unified error taxonomy for the checksum index and dedup engine.
///
/// Every fallible core operation returns one of these variants so callers
/// (the FS event adapter, the maintenance tool, the mount daemon) can apply
/// the retry/skip/propagate policy the specification assigns to each kind.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Null/empty paths, or `src` already living under `dstdir`.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing file vanished mid-operation (broken symlink, racing unlink).
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Any I/O failure: digest read, rename, link, database file access.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A hard link could not be created because source and destination live
    /// on different filesystems.
    #[error("cross-device link: {} -> {}", .from.display(), .to.display())]
    CrossDevice { from: PathBuf, to: PathBuf },

    /// The index's transactional store could not be acquired within its
    /// busy timeout.
    #[error("database busy: {0}")]
    Concurrency(String),

    /// Algorithm mismatch against the Versioning Record, or a `dedup` pass
    /// refused because `dupdir` is non-empty.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database-layer failure that doesn't map to one of the above kinds.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// True for errors the FS Event Adapter should retry on release
    /// (busy timeouts and plain I/O hiccups), per spec.md Section 5 and 7.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Io(_) | CoreError::Concurrency(_) | CoreError::Database(_))
    }
}
