//! Durable storage for the work item collection.
//!
//! The contract is whole-collection: [`Store::load`] returns every item and
//! [`Store::save`] replaces every item. Callers never patch single rows; the
//! [`crate::ledger::Ledger`] serialises load-modify-save cycles on top.

use chrono::SecondsFormat;
use rusqlite::{Connection, params};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::*;

/// Persistence backend for work items.
pub trait Store: Send {
    /// Read the whole collection in the order it was last saved.
    fn load(&self) -> Result<Vec<WorkItem>>;

    /// Replace the whole collection atomically.
    fn save(&mut self, items: &[WorkItem]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite-backed store. Survives process restarts.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS work_items (
                id                  TEXT PRIMARY KEY,
                position            INTEGER NOT NULL DEFAULT 0,
                code                TEXT NOT NULL,
                mode                TEXT NOT NULL,
                state               TEXT NOT NULL,
                lease_id            TEXT,
                lease_started_at    TEXT,
                retry_count         INTEGER NOT NULL DEFAULT 0,
                last_error          TEXT,
                created_at          TEXT NOT NULL,
                completed_at        TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_state ON work_items(state);
            ",
        )?;

        // Databases written before `position` existed load by creation time.
        let has_position = self
            .conn
            .prepare("SELECT 1 FROM pragma_table_info('work_items') WHERE name = 'position'")?
            .exists([])?;
        if !has_position {
            self.conn.execute_batch(
                "ALTER TABLE work_items ADD COLUMN position INTEGER NOT NULL DEFAULT 0;",
            )?;
        }

        Ok(())
    }
}

impl Store for SqliteStore {
    fn load(&self) -> Result<Vec<WorkItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, code, mode, state, lease_id, lease_started_at, retry_count,
                    last_error, created_at, completed_at
             FROM work_items ORDER BY position ASC, created_at ASC, id ASC",
        )?;

        let rows = stmt
            .query_map([], |row| Ok(row_to_work_item(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row.map_err(|e| Error::Other(format!("failed to parse work item: {e}")))?);
        }
        Ok(items)
    }

    fn save(&mut self, items: &[WorkItem]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM work_items", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO work_items (
                    id, code, mode, state, lease_id, lease_started_at, retry_count,
                    last_error, created_at, completed_at, position
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for (position, item) in items.iter().enumerate() {
                insert.execute(params![
                    item.id.0.to_string(),
                    item.code,
                    item.mode.to_string(),
                    item.state.to_string(),
                    item.lease_id.map(|id| id.0.to_string()),
                    item.lease_started_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Nanos, true)),
                    item.retry_count,
                    item.last_error,
                    item.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    item.completed_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Nanos, true)),
                    position as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Volatile store. Everything is lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Vec<WorkItem>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing collection, e.g. state left by a crashed run.
    pub fn with_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Vec<WorkItem>> {
        Ok(self
            .items
            .lock()
            .map_err(|_| Error::Other("memory store poisoned".to_string()))?
            .clone())
    }

    fn save(&mut self, items: &[WorkItem]) -> Result<()> {
        *self
            .items
            .get_mut()
            .map_err(|_| Error::Other("memory store poisoned".to_string()))? = items.to_vec();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn row_to_work_item(row: &rusqlite::Row) -> std::result::Result<WorkItem, String> {
    let id_str: String = row.get(0).map_err(|e| e.to_string())?;
    let mode_str: String = row.get(2).map_err(|e| e.to_string())?;
    let state_str: String = row.get(3).map_err(|e| e.to_string())?;
    let lease_str: Option<String> = row.get(4).map_err(|e| e.to_string())?;
    let lease_started_str: Option<String> = row.get(5).map_err(|e| e.to_string())?;
    let created_str: String = row.get(8).map_err(|e| e.to_string())?;
    let completed_str: Option<String> = row.get(9).map_err(|e| e.to_string())?;

    Ok(WorkItem {
        id: WorkId(id_str.parse().map_err(|e: uuid::Error| e.to_string())?),
        code: row.get(1).map_err(|e| e.to_string())?,
        mode: mode_str.parse().map_err(|e: Error| e.to_string())?,
        state: state_str.parse().map_err(|e: Error| e.to_string())?,
        lease_id: lease_str
            .map(|s| s.parse().map(LeaseId))
            .transpose()
            .map_err(|e: uuid::Error| e.to_string())?,
        lease_started_at: lease_started_str
            .map(|s| s.parse::<chrono::DateTime<chrono::Utc>>())
            .transpose()
            .map_err(|_| "invalid lease_started_at".to_string())?,
        retry_count: row.get(6).map_err(|e| e.to_string())?,
        last_error: row.get(7).map_err(|e| e.to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        completed_at: completed_str
            .map(|s| s.parse::<chrono::DateTime<chrono::Utc>>())
            .transpose()
            .map_err(|_| "invalid completed_at".to_string())?,
    })
}
