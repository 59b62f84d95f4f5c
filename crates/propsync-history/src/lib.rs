//! # propsync History
//!
//! `SQLite`-backed [`propsync_core::HistoryLog`] implementation.
//!
//! Each channel keeps one *open* entry that absorbs updates arriving
//! within the rollover window; once an update lands outside the window,
//! the open entry is sealed into the channel's series and the new entry
//! takes its place. Sealed entries are what history consumers page
//! through; the open entry is working state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod store;

pub use store::SqliteHistory;
