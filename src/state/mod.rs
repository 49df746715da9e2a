//! Persistent sync state.
//!
//! SQLite-backed storage for a subject's listening history:
//! - `tracks`: one row per listen, keyed by `(subject, timestamp)`
//! - `coverage`: the spans of history already fully retrieved
//! - `sync_runs`: bookkeeping for status reporting

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{CoverageStore, RecordStore, SqliteStateDb, StateDb};
pub use error::StateError;
pub use types::{SyncRunStats, SyncSummary, TrackRecord};
