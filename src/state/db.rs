//! State database traits and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{SyncRunStats, SyncSummary, TrackRecord};
use crate::sync::intervals::{Interval, IntervalSet};

/// Upsert-by-key store for parsed listen records.
///
/// Object-safe so it can be shared as `Arc<dyn RecordStore>`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite records keyed by `(subject, key)`.
    ///
    /// All-or-nothing: on error no record of the batch is visible.
    /// Returns the number of records written.
    async fn upsert_tracks(&self, subject: &str, records: &[TrackRecord])
        -> Result<u64, StateError>;

    /// Records whose key falls inside `span`, newest first.
    async fn tracks_in_range(
        &self,
        subject: &str,
        span: Interval,
        limit: Option<u32>,
    ) -> Result<Vec<TrackRecord>, StateError>;

    async fn count_tracks(&self, subject: &str) -> Result<u64, StateError>;
}

/// Persistence for one subject's coverage, replaced wholesale on save.
#[async_trait]
pub trait CoverageStore: Send + Sync {
    /// Load coverage, or an empty set if the subject has none.
    async fn load_coverage(&self, subject: &str) -> Result<IntervalSet, StateError>;

    /// Atomically replace the subject's coverage.
    async fn save_coverage(&self, subject: &str, coverage: &IntervalSet)
        -> Result<(), StateError>;
}

/// Full state database: records, coverage, and run bookkeeping.
#[async_trait]
pub trait StateDb: RecordStore + CoverageStore {
    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self, subject: &str, span: Interval) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats)
        -> Result<(), StateError>;

    /// Get a summary of the database state for one subject.
    async fn get_summary(&self, subject: &str) -> Result<SyncSummary, StateError>;

    /// Subjects with any stored tracks, coverage, or runs.
    async fn list_subjects(&self) -> Result<Vec<String>, StateError>;

    /// Delete everything stored for a subject. Returns the number of tracks removed.
    async fn clear_subject(&self, subject: &str) -> Result<u64, StateError>;
}

/// SQLite implementation of the state database.
pub struct SqliteStateDb {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL keeps readers (status, tracks) unblocked during a sync.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

/// Run `body` inside a transaction, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, StateError>,
) -> Result<T, StateError> {
    conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
        .map_err(StateError::query)?;

    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StateError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

fn timestamp_opt(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

#[async_trait]
impl RecordStore for SqliteStateDb {
    async fn upsert_tracks(
        &self,
        subject: &str,
        records: &[TrackRecord],
    ) -> Result<u64, StateError> {
        if records.is_empty() {
            return Ok(0);
        }

        let stored_at = Utc::now().timestamp();
        let conn = self.lock()?;

        in_transaction(&conn, |conn| {
            let mut stmt = conn
                .prepare_cached(
                    r#"
                    INSERT INTO tracks (subject, listened_at, name, url, artist, album, loved, stored_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT(subject, listened_at) DO UPDATE SET
                        name = excluded.name,
                        url = excluded.url,
                        artist = excluded.artist,
                        album = excluded.album,
                        loved = excluded.loved
                    "#,
                )
                .map_err(StateError::query)?;

            for record in records {
                stmt.execute(rusqlite::params![
                    subject,
                    record.key,
                    record.name,
                    record.url,
                    record.artist,
                    record.album,
                    record.loved,
                    stored_at,
                ])
                .map_err(StateError::query)?;
            }

            Ok(records.len() as u64)
        })
    }

    async fn tracks_in_range(
        &self,
        subject: &str,
        span: Interval,
        limit: Option<u32>,
    ) -> Result<Vec<TrackRecord>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT listened_at, name, url, artist, album, loved FROM tracks \
                 WHERE subject = ?1 AND listened_at BETWEEN ?2 AND ?3 \
                 ORDER BY listened_at DESC LIMIT ?4",
            )
            .map_err(StateError::query)?;

        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, i64::from);
        let records = stmt
            .query_map(
                rusqlite::params![subject, span.start(), span.end(), limit],
                row_to_track_record,
            )
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records.into_iter().flatten().collect())
    }

    async fn count_tracks(&self, subject: &str) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM tracks WHERE subject = ?1",
                [subject],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl CoverageStore for SqliteStateDb {
    async fn load_coverage(&self, subject: &str) -> Result<IntervalSet, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT start_ts, end_ts FROM coverage WHERE subject = ?1 ORDER BY start_ts",
            )
            .map_err(StateError::query)?;

        let rows = stmt
            .query_map([subject], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        let intervals = rows
            .into_iter()
            .map(|(start, end)| {
                Interval::new(start, end).map_err(|_| StateError::CorruptCoverage {
                    subject: subject.to_string(),
                    start,
                    end,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(IntervalSet::from_intervals(intervals))
    }

    async fn save_coverage(
        &self,
        subject: &str,
        coverage: &IntervalSet,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;

        in_transaction(&conn, |conn| {
            conn.execute("DELETE FROM coverage WHERE subject = ?1", [subject])
                .map_err(StateError::query)?;

            let mut stmt = conn
                .prepare_cached(
                    "INSERT INTO coverage (subject, start_ts, end_ts) VALUES (?1, ?2, ?3)",
                )
                .map_err(StateError::query)?;
            for interval in coverage {
                stmt.execute(rusqlite::params![subject, interval.start(), interval.end()])
                    .map_err(StateError::query)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn start_sync_run(&self, subject: &str, span: Interval) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO sync_runs (subject, requested_start, requested_end, started_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![subject, span.start(), span.end(), started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(
        &self,
        run_id: i64,
        stats: &SyncRunStats,
    ) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, records_stored = ?2, gaps_committed = ?3, gaps_failed = ?4, interrupted = ?5 WHERE id = ?6",
            rusqlite::params![
                completed_at,
                stats.records_stored as i64,
                stats.gaps_committed as i64,
                stats.gaps_failed as i64,
                stats.interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn get_summary(&self, subject: &str) -> Result<SyncSummary, StateError> {
        let conn = self.lock()?;

        let (total_tracks, loved_tracks, oldest, newest): (i64, i64, Option<i64>, Option<i64>) =
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(loved), 0), MIN(listened_at), MAX(listened_at) FROM tracks WHERE subject = ?1",
                [subject],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(StateError::query)?;

        let (covered_intervals, covered_seconds): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(end_ts - start_ts + 1), 0) FROM coverage WHERE subject = ?1",
                [subject],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StateError::query)?;

        let last_sync: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs WHERE subject = ?1 ORDER BY id DESC LIMIT 1",
                [subject],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (timestamp_opt(started), timestamp_opt(completed)),
            None => (None, None),
        };

        Ok(SyncSummary {
            total_tracks: total_tracks as u64,
            loved_tracks: loved_tracks as u64,
            covered_intervals: covered_intervals as u64,
            covered_seconds: covered_seconds as u64,
            oldest_listen: timestamp_opt(oldest),
            newest_listen: timestamp_opt(newest),
            last_sync_started,
            last_sync_completed,
        })
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT subject FROM tracks UNION SELECT subject FROM coverage \
                 UNION SELECT subject FROM sync_runs ORDER BY 1",
            )
            .map_err(StateError::query)?;

        let subjects = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(subjects)
    }

    async fn clear_subject(&self, subject: &str) -> Result<u64, StateError> {
        let conn = self.lock()?;

        in_transaction(&conn, |conn| {
            let tracks = conn
                .execute("DELETE FROM tracks WHERE subject = ?1", [subject])
                .map_err(StateError::query)?;
            conn.execute("DELETE FROM coverage WHERE subject = ?1", [subject])
                .map_err(StateError::query)?;
            conn.execute("DELETE FROM sync_runs WHERE subject = ?1", [subject])
                .map_err(StateError::query)?;
            Ok(tracks as u64)
        })
    }
}

/// Convert a `tracks` row into a record, skipping rows with an
/// unrepresentable timestamp.
fn row_to_track_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<TrackRecord>> {
    let key: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let url: String = row.get(2)?;
    let artist: Option<String> = row.get(3)?;
    let album: Option<String> = row.get(4)?;
    let loved: bool = row.get(5)?;

    let record = TrackRecord::new(key, name, url).map(|r| {
        r.with_artist(artist)
            .with_album(album)
            .with_loved(loved)
    });
    if record.is_none() {
        tracing::warn!(key, "Skipping stored track with out-of-range timestamp");
    }
    Ok(record)
}
