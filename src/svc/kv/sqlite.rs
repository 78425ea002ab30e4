//! SQLite-backed key-value store.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tracing::{debug, warn};

use super::{KvOp, KvStore, aggregate};
use crate::NsError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS hashes (
    key TEXT NOT NULL,
    field TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key, field)
);
";

/// [`KvStore`] persisted in one SQLite database. Every batch runs in its own
/// transaction.
pub struct SqliteKvStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NsError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening sqlite store");
        let conn = Connection::open(path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "cannot open sqlite store");
            NsError::from(e)
        })?;
        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, NsError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, NsError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Database file, `None` for an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn execute(tx: &Transaction<'_>, op: &KvOp) -> rusqlite::Result<usize> {
        match op {
            KvOp::Set { key, value } => tx.execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                params![key, value],
            ),
            KvOp::Delete { key } => {
                tx.execute("DELETE FROM records WHERE key = ?1", params![key])
            }
            KvOp::HSet { key, field, value } => tx.execute(
                "INSERT OR REPLACE INTO hashes (key, field, value) VALUES (?1, ?2, ?3)",
                params![key, field, value],
            ),
            KvOp::HDel { key, field } => tx.execute(
                "DELETE FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
            ),
            KvOp::HClear { key } => tx.execute("DELETE FROM hashes WHERE key = ?1", params![key]),
        }
    }
}

impl std::fmt::Debug for SqliteKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKvStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, NsError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, NsError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, NsError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT field, value FROM hashes WHERE key = ?1 ORDER BY field")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count_prefix(&self, prefix: &str) -> Result<u64, NsError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn apply(&self, batch: &[KvOp]) -> Result<(), NsError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let failures: Vec<String> = batch
            .iter()
            .filter_map(|op| {
                Self::execute(&tx, op)
                    .err()
                    .map(|e| format!("{}: {e}", op.key()))
            })
            .collect();
        if !failures.is_empty() {
            warn!(failed = failures.len(), total = batch.len(), "rolling back batch");
            // Dropping the transaction rolls it back.
            drop(tx);
            return aggregate("apply", failures);
        }
        tx.commit()?;
        Ok(())
    }
}
