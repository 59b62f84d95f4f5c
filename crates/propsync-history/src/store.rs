//! `SQLite` history store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use propsync_core::{HistoryEntry, HistoryError, HistoryLog};

/// Default window, in seconds, during which a channel's open entry keeps
/// absorbing updates before it is sealed.
pub const DEFAULT_ROLLOVER_SECS: i64 = 600;

/// `SQLite`-backed history log.
///
/// The connection sits behind a mutex so the store can be shared as an
/// `Arc<dyn HistoryLog>`; every operation is a short transaction.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    rollover_secs: i64,
}

impl SqliteHistory {
    /// Open or create a history database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Replace the rollover window.
    #[must_use]
    pub fn with_rollover(mut self, secs: i64) -> Self {
        self.rollover_secs = secs;
        self
    }

    fn with_connection(conn: Connection) -> Result<Self, HistoryError> {
        let store = Self {
            conn: Mutex::new(conn),
            rollover_secs: DEFAULT_ROLLOVER_SECS,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        self.conn()
            .execute_batch(
                r"
                -- One open entry per channel
                CREATE TABLE IF NOT EXISTS channel_state (
                    channel TEXT PRIMARY KEY,
                    time INTEGER NOT NULL,
                    fields TEXT NOT NULL
                );

                -- Sealed series
                CREATE TABLE IF NOT EXISTS entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel TEXT NOT NULL,
                    time INTEGER NOT NULL,
                    fields TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_entries_channel_time
                    ON entries(channel, time);
                ",
            )
            .map_err(store_err)
    }

    /// Sealed entries for a channel with `time >= since`, oldest first,
    /// at most `limit` of them when one is given.
    ///
    /// The open entry is not included; it is still subject to merging.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or an entry cannot be decoded.
    pub fn sealed_entries(
        &self,
        channel: &str,
        since: i64,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                r"
                SELECT time, fields FROM entries
                WHERE channel = ?1 AND time >= ?2
                ORDER BY time ASC
                LIMIT ?3
                ",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map((channel, since, limit), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(time, fields)| decode_entry(time, &fields))
            .collect()
    }

    /// Delete sealed entries with `time < before`. Returns how many were
    /// removed. The open entry is never pruned.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn prune_before(&self, channel: &str, before: i64) -> Result<usize, HistoryError> {
        self.conn()
            .execute(
                r"
                DELETE FROM entries
                WHERE channel = ?1 AND time < ?2
                ",
                (channel, before),
            )
            .map_err(store_err)
    }

    fn current_entry_sync(&self, channel: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        let row = self
            .conn()
            .query_row(
                "SELECT time, fields FROM channel_state WHERE channel = ?1",
                [channel],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(time, fields)| decode_entry(time, &fields)).transpose()
    }

    fn append_or_update_sync(
        &self,
        channel: &str,
        entry: &HistoryEntry,
    ) -> Result<(), HistoryError> {
        let fields = serde_json::to_string(&entry.fields).map_err(encode_err)?;

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(store_err)?;

        let open = tx
            .query_row(
                "SELECT time, fields FROM channel_state WHERE channel = ?1",
                [channel],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        if let Some((open_time, open_fields)) = open {
            if entry.time - open_time >= self.rollover_secs {
                tx.execute(
                    "INSERT INTO entries (channel, time, fields) VALUES (?1, ?2, ?3)",
                    (channel, open_time, open_fields.as_str()),
                )
                .map_err(store_err)?;
                tracing::debug!(channel, sealed_time = open_time, "Sealed history entry");
            }
        }

        tx.execute(
            r"
            INSERT OR REPLACE INTO channel_state (channel, time, fields)
            VALUES (?1, ?2, ?3)
            ",
            (channel, entry.time, fields.as_str()),
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HistoryLog for SqliteHistory {
    async fn current_entry(&self, channel: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        self.current_entry_sync(channel)
    }

    async fn append_or_update(
        &self,
        channel: &str,
        entry: &HistoryEntry,
    ) -> Result<(), HistoryError> {
        self.append_or_update_sync(channel, entry)
    }
}

fn decode_entry(time: i64, fields: &str) -> Result<HistoryEntry, HistoryError> {
    let fields: BTreeMap<String, i64> = serde_json::from_str(fields).map_err(encode_err)?;
    Ok(HistoryEntry { time, fields })
}

fn store_err(e: rusqlite::Error) -> HistoryError {
    HistoryError::Store(e.to_string())
}

fn encode_err(e: serde_json::Error) -> HistoryError {
    HistoryError::Encode(e.to_string())
}
