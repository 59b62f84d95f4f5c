//! # History Log
//!
//! Opportunistic time-series recording. Each channel is one series of
//! [`HistoryEntry`] values; readings taken close together in time are
//! merged into a single entry so that, for example, a climate channel fed
//! by separate temperature and humidity bindings still produces one row
//! per poll cycle.
//!
//! Merge policy belongs to the log implementation: the engine only ever
//! asks for the channel's open entry, folds the cycle's fields into it,
//! and hands it back.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One row of a channel's time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// Field values, e.g. `{"humidity": 47, "temp": 21}`.
    pub fields: BTreeMap<String, i64>,
}

impl HistoryEntry {
    /// An empty entry stamped at `time`.
    #[must_use]
    pub fn new(time: i64) -> Self {
        Self {
            time,
            fields: BTreeMap::new(),
        }
    }

    /// Sets one field, replacing any earlier value.
    pub fn set_field(&mut self, field: impl Into<String>, value: i64) {
        self.fields.insert(field.into(), value);
    }
}

/// Per-channel append-mostly storage for merged readings.
#[async_trait]
pub trait HistoryLog: Send + Sync {
    /// The channel's open entry: the most recent one, still eligible for
    /// merging. `None` when the channel has no entries yet.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be read.
    async fn current_entry(&self, channel: &str) -> Result<Option<HistoryEntry>, HistoryError>;

    /// Stores `entry` as the channel's open entry. Implementations decide
    /// when the previous open entry is sealed into the series instead of
    /// being replaced.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be written.
    async fn append_or_update(&self, channel: &str, entry: &HistoryEntry)
        -> Result<(), HistoryError>;
}

/// Failure in the history log.
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    /// The backing store failed.
    #[error("history store error: {0}")]
    Store(String),

    /// An entry could not be encoded or decoded.
    #[error("history encoding error: {0}")]
    Encode(String),
}
