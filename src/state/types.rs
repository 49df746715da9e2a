//! Types for the state tracking module.

use chrono::{DateTime, Utc};

/// One listen event as stored in the database.
///
/// `key` is the listen's unix timestamp in seconds and is unique per
/// subject: re-storing a record with an existing key overwrites it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRecord {
    pub name: String,
    pub url: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub key: i64,
    pub loved: bool,
}

impl TrackRecord {
    /// Build a record from a unix timestamp, or `None` if chrono can't
    /// represent it.
    pub fn new(key: i64, name: String, url: String) -> Option<Self> {
        let timestamp = DateTime::from_timestamp(key, 0)?;
        Some(Self {
            name,
            url,
            artist: None,
            album: None,
            timestamp,
            key,
            loved: false,
        })
    }

    pub fn with_artist(mut self, artist: Option<String>) -> Self {
        self.artist = artist;
        self
    }

    pub fn with_album(mut self, album: Option<String>) -> Self {
        self.album = album;
        self
    }

    pub fn with_loved(mut self, loved: bool) -> Self {
        self.loved = loved;
        self
    }
}

/// Statistics recorded when a sync run completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRunStats {
    pub records_stored: u64,
    pub gaps_committed: u64,
    pub gaps_failed: u64,
    pub interrupted: bool,
}

/// Per-subject summary of the state database.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub total_tracks: u64,
    pub loved_tracks: u64,
    pub covered_intervals: u64,
    pub covered_seconds: u64,
    pub oldest_listen: Option<DateTime<Utc>>,
    pub newest_listen: Option<DateTime<Utc>>,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_derives_timestamp_from_key() {
        let record = TrackRecord::new(1_700_000_000, "Song".into(), "https://x".into()).unwrap();
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);
        assert!(!record.loved);
        assert!(record.artist.is_none());
    }

    #[test]
    fn test_new_rejects_unrepresentable_timestamp() {
        assert!(TrackRecord::new(i64::MAX, "Song".into(), String::new()).is_none());
    }

    #[test]
    fn test_builders() {
        let record = TrackRecord::new(1, "Song".into(), String::new())
            .unwrap()
            .with_artist(Some("Artist".into()))
            .with_album(Some("Album".into()))
            .with_loved(true);
        assert_eq!(record.artist.as_deref(), Some("Artist"));
        assert_eq!(record.album.as_deref(), Some("Album"));
        assert!(record.loved);
    }
}
