use std::future::Future;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rowcast_core::{OffsetRecord, OffsetStore};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS offsets (
    source TEXT PRIMARY KEY,
    offset_token TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// SQLite-backed offset store.
///
/// Runs in WAL mode with `synchronous = FULL`, so a committed offset survives
/// power loss once `set_offset` returns.
pub struct SqliteOffsetStore {
    conn: Mutex<Connection>,
}

impl SqliteOffsetStore {
    /// Open or create an offset store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StateResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening offset store");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    /// Create an in-memory offset store (for testing).
    pub fn in_memory() -> StateResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StateResult<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StateResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }

    pub fn read_offset(&self, source: &str) -> StateResult<Option<String>> {
        let conn = self.conn()?;
        let offset = conn
            .query_row(
                "SELECT offset_token FROM offsets WHERE source = ?1",
                [source],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(offset)
    }

    pub fn write_offset(&self, source: &str, offset: &str) -> StateResult<()> {
        if offset.is_empty() {
            return Err(StateError::InvalidOffset {
                source_id: source.to_string(),
                message: "offset must not be empty".into(),
            });
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO offsets (source, offset_token, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(source) DO UPDATE SET
                offset_token = ?2,
                updated_at = CURRENT_TIMESTAMP",
            rusqlite::params![source, offset],
        )?;
        debug!(source, offset, "Offset stored");
        Ok(())
    }

    /// Every stored offset, ordered by source.
    pub fn list_offsets(&self) -> StateResult<Vec<OffsetRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT source, offset_token, updated_at FROM offsets ORDER BY source")?;

        let rows = stmt.query_map([], |row| {
            Ok(OffsetRecord {
                source: row.get(0)?,
                offset: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

impl OffsetStore for SqliteOffsetStore {
    fn get_offset(
        &self,
        source: &str,
    ) -> impl Future<Output = rowcast_core::Result<Option<String>>> + Send {
        let result: rowcast_core::Result<Option<String>> =
            self.read_offset(source).map_err(Into::into);
        async move { result }
    }

    fn set_offset(
        &self,
        source: &str,
        offset: &str,
    ) -> impl Future<Output = rowcast_core::Result<()>> + Send {
        let result: rowcast_core::Result<()> =
            self.write_offset(source, offset).map_err(Into::into);
        async move { result }
    }
}
