//! SQLite-backed derived state: ref heads plus the replay checkpoint.

use crate::chain::GENESIS_COMMIT;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

const CHECKPOINT_KEY: &str = "last_processed_block";

/// Largest block index the checkpoint column can hold (SQLite integers are i64).
pub const MAX_BLOCK_INDEX: u64 = i64::MAX as u64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("checkpoint would move from {current} to {requested}")]
    CheckpointRegression { current: u64, requested: u64 },
    #[error("block index {0} exceeds the storable maximum {max}", max = MAX_BLOCK_INDEX)]
    IndexOutOfRange(u64),
}

/// One row of the ref table; also the argument of an upsert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRow {
    pub repo_id: String,
    pub ref_name: String,
    pub commit_hash: String,
    /// Timestamp (epoch seconds) of the block that carried the accepted attestation.
    pub updated_at: i64,
}

/// Durable `(repo_id, ref_name) -> (commit_hash, updated_at)` map and checkpoint.
///
/// A missing ref reads as [`GENESIS_COMMIT`]. Rows are never deleted.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create the store at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER
            );
            CREATE TABLE IF NOT EXISTS refs (
                repo_id TEXT NOT NULL,
                ref_name TEXT NOT NULL,
                commit_hash TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (repo_id, ref_name)
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, 0)",
            [CHECKPOINT_KEY],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Current head of `(repo_id, ref_name)`, or GENESIS if never set.
    pub fn get_head(&self, repo_id: &str, ref_name: &str) -> Result<String, StoreError> {
        Ok(self
            .get_ref(repo_id, ref_name)?
            .map(|r| r.commit_hash)
            .unwrap_or_else(|| GENESIS_COMMIT.to_string()))
    }

    pub fn get_ref(&self, repo_id: &str, ref_name: &str) -> Result<Option<RefRow>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT repo_id, ref_name, commit_hash, updated_at FROM refs
                 WHERE repo_id = ?1 AND ref_name = ?2",
                params![repo_id, ref_name],
                row_to_ref,
            )
            .optional()?;
        Ok(row)
    }

    /// Upsert a single ref. Applying the same row twice is a no-op the second time.
    pub fn apply(&self, update: &RefRow) -> Result<(), StoreError> {
        let conn = self.lock()?;
        upsert_ref(&conn, update)?;
        Ok(())
    }

    pub fn get_checkpoint(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        read_checkpoint(&conn)
    }

    /// Set the checkpoint. Moving it backwards is refused.
    pub fn set_checkpoint(&self, index: u64) -> Result<(), StoreError> {
        if index > MAX_BLOCK_INDEX {
            return Err(StoreError::IndexOutOfRange(index));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = read_checkpoint(&tx)?;
        if index < current {
            return Err(StoreError::CheckpointRegression {
                current,
                requested: index,
            });
        }
        write_checkpoint(&tx, index)?;
        tx.commit()?;
        Ok(())
    }

    /// Apply all ref updates of one block and advance the checkpoint to
    /// `block_index` in a single SQLite transaction.
    ///
    /// On error nothing from this block is visible; the checkpoint must
    /// strictly advance.
    pub fn commit_block(&self, updates: &[RefRow], block_index: u64) -> Result<(), StoreError> {
        if block_index > MAX_BLOCK_INDEX {
            return Err(StoreError::IndexOutOfRange(block_index));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = read_checkpoint(&tx)?;
        if block_index <= current {
            return Err(StoreError::CheckpointRegression {
                current,
                requested: block_index,
            });
        }
        for update in updates {
            upsert_ref(&tx, update)?;
        }
        write_checkpoint(&tx, block_index)?;
        tx.commit()?;
        debug!(block = block_index, updates = updates.len(), "block committed");
        Ok(())
    }

    /// All derived refs ordered by `(repo_id, ref_name)`, optionally for one repo.
    pub fn list_refs(&self, repo_filter: Option<&str>) -> Result<Vec<RefRow>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT repo_id, ref_name, commit_hash, updated_at FROM refs
             WHERE ?1 IS NULL OR repo_id = ?1
             ORDER BY repo_id, ref_name",
        )?;
        let rows = stmt
            .query_map([repo_filter], row_to_ref)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub(crate) fn exec_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_ref(r: &rusqlite::Row<'_>) -> rusqlite::Result<RefRow> {
    Ok(RefRow {
        repo_id: r.get(0)?,
        ref_name: r.get(1)?,
        commit_hash: r.get(2)?,
        updated_at: r.get(3)?,
    })
}

fn upsert_ref(conn: &Connection, update: &RefRow) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO refs (repo_id, ref_name, commit_hash, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (repo_id, ref_name)
         DO UPDATE SET commit_hash = excluded.commit_hash, updated_at = excluded.updated_at",
        params![
            update.repo_id,
            update.ref_name,
            update.commit_hash,
            update.updated_at
        ],
    )
}

fn read_checkpoint(conn: &Connection) -> Result<u64, StoreError> {
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [CHECKPOINT_KEY],
            |r| r.get::<_, Option<u64>>(0),
        )
        .optional()?;
    Ok(value.flatten().unwrap_or(0))
}

fn write_checkpoint(conn: &Connection, index: u64) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![CHECKPOINT_KEY, index],
    )
}
