//! Database schema definitions and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Schema DDL for version 1.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS tracks (
    subject TEXT NOT NULL,
    listened_at INTEGER NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    artist TEXT,
    album TEXT,
    loved INTEGER NOT NULL DEFAULT 0,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (subject, listened_at)
);

CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(subject, artist);
CREATE INDEX IF NOT EXISTS idx_tracks_loved ON tracks(subject, loved);

CREATE TABLE IF NOT EXISTS coverage (
    subject TEXT NOT NULL,
    start_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    PRIMARY KEY (subject, start_ts)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    requested_start INTEGER NOT NULL,
    requested_end INTEGER NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    records_stored INTEGER DEFAULT 0,
    gaps_committed INTEGER DEFAULT 0,
    gaps_failed INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_subject ON sync_runs(subject);
"#;

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the database schema.
///
/// Idempotent: safe to call on both new and existing databases.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(SCHEMA_V1)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
    } else {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    match version {
        1 => conn.execute_batch(SCHEMA_V1)?,
        _ => tracing::warn!("No migration registered for schema version {}", version),
    }
    set_schema_version(conn, version)?;
    tracing::info!("Migrated database to schema version {}", version);
    Ok(())
}
