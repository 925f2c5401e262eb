//! The durable checksum index: a single-writer SQLite table mapping backing
//! path to digest, secondary-indexed on digest.
//!
//! Grounded on the original `sha1db.py`'s `Sha1DB` (schema, SQL text, busy
//! timeout, read-algorithm-on-open semantics) and on this pack's rusqlite
//! usage patterns (transactional batching, `BEGIN`/`COMMIT` discipline) seen
//! in the FTS5 indexer reference file. The exact SQL fragments below are
//! stable per spec.md section 6 and may be asserted on by tests.

use crate::digest::Algorithm;
use crate::error::{CoreError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub const UPSERT_SQL: &str = "INSERT OR REPLACE INTO files(path, chksum, symlink) VALUES(?, ?, ?)";
pub const MARK_SYMLINK_SQL: &str = "UPDATE files SET symlink = 1 WHERE path = ?";
pub const PREFIX_REWRITE_SQL: &str = "UPDATE files SET path = replace(path, ?, ?) WHERE path LIKE ?";
pub const DELETE_SQL: &str = "DELETE FROM files WHERE path = ?";
pub const DUPLICATE_SCAN_SQL: &str = "
SELECT chksum, path, symlink
FROM files
WHERE chksum IN (
  SELECT chksum FROM files WHERE symlink = 0 GROUP BY chksum HAVING COUNT(chksum) > 1
) AND symlink = 0
ORDER BY chksum";

/// A single row of the checksum table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub digest: String,
    pub is_symlink: bool,
}

/// The durable table `(path PK, digest, is_symlink)` plus a secondary index
/// on digest and a single-row versioning table. One writer at a time,
/// enforced by SQLite's own locking plus a generous busy timeout.
pub struct ChecksumIndex {
    conn: Connection,
    algorithm: Algorithm,
}

impl ChecksumIndex {
    /// Opens (or creates) the index at `database`. If the file does not
    /// exist, creates the schema and records `requested_algorithm` in the
    /// versioning table. If it exists, the algorithm is read back from the
    /// database and `requested_algorithm` is ignored (spec.md invariant I2).
    pub fn open(database: impl AsRef<Path>, requested_algorithm: Algorithm) -> Result<Self> {
        let database = database.as_ref();
        let existed = database.exists();

        let conn = Connection::open(database)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let algorithm = if existed {
            let stored: String = conn.query_row("SELECT chksum_type FROM versioning", [], |row| row.get(0))?;
            Algorithm::from_str(&stored)?
        } else {
            conn.execute(
                "CREATE TABLE files(
                    path    TEXT NOT NULL PRIMARY KEY,
                    chksum  TEXT NOT NULL,
                    symlink BOOLEAN DEFAULT 0
                )",
                [],
            )?;
            conn.execute("CREATE INDEX csum_idx ON files(chksum)", [])?;
            conn.execute("CREATE TABLE versioning(chksum_type TEXT NOT NULL)", [])?;
            conn.execute("INSERT INTO versioning(chksum_type) VALUES(?)", params![requested_algorithm.as_str()])?;
            requested_algorithm
        };

        Ok(ChecksumIndex { conn, algorithm })
    }

    /// The algorithm recorded at database creation. Never changes across
    /// the database's lifetime (spec.md invariant I2, testable property P5).
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Inserts or replaces the row for `path`.
    pub fn upsert(&self, path: &Path, digest: &str, is_symlink: bool) -> Result<()> {
        upsert_conn(&self.conn, path, digest, is_symlink)
    }

    /// Marks a row as (non-)symlink without touching its digest. Also used,
    /// per spec.md section 9, to flag a row as "has been relinked" during
    /// online dedup -- the overloaded meaning of this column is intentional
    /// and documented, not split into two booleans. Setting `flag = true`
    /// executes exactly the canonical `MARK_SYMLINK_SQL` fragment.
    pub fn set_is_symlink(&self, path: &Path, flag: bool) -> Result<()> {
        set_is_symlink_conn(&self.conn, path, flag)
    }

    /// Removes the row for `path`.
    pub fn delete(&self, path: &Path) -> Result<()> {
        delete_conn(&self.conn, path)
    }

    /// For every row whose path begins with `old_prefix`, replaces that
    /// prefix with `new_prefix`. A single bulk update bounded by a `LIKE
    /// old_prefix || '%'` predicate (spec.md section 6).
    pub fn rewrite_prefix(&self, old_prefix: &str, new_prefix: &str) -> Result<usize> {
        let like_pattern = format!("{old_prefix}%");
        self.conn
            .execute(PREFIX_REWRITE_SQL, params![old_prefix, new_prefix, like_pattern])
            .map_err(CoreError::from)
    }

    /// Every stored path, used by `vacuum`.
    pub fn all_paths(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self.conn.prepare("SELECT path FROM files")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(PathBuf::from(row?));
        }
        Ok(out)
    }

    /// `(digest, path, is_symlink)` rows for non-symlink entries whose
    /// digest appears more than once, ordered by digest. Used by the
    /// offline `dedup` pass.
    pub fn duplicate_non_symlink_paths(&self) -> Result<Vec<(String, PathBuf, bool)>> {
        let mut stmt = self.conn.prepare(DUPLICATE_SCAN_SQL)?;
        let rows = stmt.query_map([], |row| {
            let digest: String = row.get(0)?;
            let path: String = row.get(1)?;
            let is_symlink: bool = row.get(2)?;
            Ok((digest, PathBuf::from(path), is_symlink))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Non-symlink paths sharing `digest`, other than `excluding`. Used by
    /// the online dedup step.
    pub fn peers_by_digest(&self, digest: &str, excluding: &Path) -> Result<Vec<PathBuf>> {
        peers_by_digest_conn(&self.conn, digest, excluding)
    }

    /// Fetches the stored row for `path`, if any. Not part of the original
    /// SQL surface in spec.md section 6, but useful for tests and for the
    /// maintenance driver's reporting.
    pub fn get(&self, path: &Path) -> Result<Option<IndexEntry>> {
        self.conn
            .query_row("SELECT path, chksum, symlink FROM files WHERE path = ?", params![path_str(path)?], |row| {
                Ok(IndexEntry { path: PathBuf::from(row.get::<_, String>(0)?), digest: row.get(1)?, is_symlink: row.get(2)? })
            })
            .optional()
            .map_err(CoreError::from)
    }

    /// Runs `f` inside a single transaction, committing on success and
    /// rolling back on any error (spec.md section 4.3/4.4: every operation
    /// either fully commits or fully rolls back).
    pub fn with_transaction<T>(&mut self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>) -> Result<T> {
        let txn = self.conn.transaction().map_err(CoreError::from)?;
        let result = f(&txn)?;
        txn.commit().map_err(CoreError::from)?;
        Ok(result)
    }

    /// Opens a new transaction on the underlying connection. Used by the
    /// dedup engine to bundle the upsert/peer-lookup/relink-mark sequence
    /// of an online checksum update into one atomic unit that also covers
    /// the hard-link syscalls it triggers (spec.md section 4.4: a failed
    /// relink must not leave the index claiming work that didn't happen).
    pub(crate) fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        self.conn.transaction().map_err(CoreError::from)
    }
}

/// These take `&Connection` so they work unchanged against a plain
/// connection or against an open `rusqlite::Transaction` (which derefs to
/// `Connection`), letting the dedup engine reuse the exact same SQL whether
/// or not the call is part of a larger atomic sequence.
pub(crate) fn upsert_conn(conn: &Connection, path: &Path, digest: &str, is_symlink: bool) -> Result<()> {
    conn.execute(UPSERT_SQL, params![path_str(path)?, digest, is_symlink]).map(|_| ()).map_err(CoreError::from)
}

pub(crate) fn set_is_symlink_conn(conn: &Connection, path: &Path, flag: bool) -> Result<()> {
    if flag {
        conn.execute(MARK_SYMLINK_SQL, params![path_str(path)?]).map(|_| ()).map_err(CoreError::from)
    } else {
        conn.execute("UPDATE files SET symlink = 0 WHERE path = ?", params![path_str(path)?]).map(|_| ()).map_err(CoreError::from)
    }
}

pub(crate) fn delete_conn(conn: &Connection, path: &Path) -> Result<()> {
    conn.execute(DELETE_SQL, params![path_str(path)?]).map(|_| ()).map_err(CoreError::from)
}

pub(crate) fn peers_by_digest_conn(conn: &Connection, digest: &str, excluding: &Path) -> Result<Vec<PathBuf>> {
    let mut stmt = conn.prepare("SELECT path FROM files WHERE chksum = ?1 AND path != ?2 AND symlink = 0")?;
    let rows = stmt.query_map(params![digest, path_str(excluding)?], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(PathBuf::from(row?));
    }
    Ok(out)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| CoreError::InvalidArgument(format!("non-utf8 path: {}", path.display())))
}
