//! Parsing of raw source entries into [`TrackRecord`]s.
//!
//! Entries arrive as loosely-typed JSON so that one malformed entry can be
//! skipped without discarding the rest of its page.

use serde::Deserialize;
use serde_json::Value;

use super::error::SyncError;
use crate::state::TrackRecord;

/// Result of parsing one page entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEntry {
    /// The "currently playing" marker. Has no timestamp and is never stored.
    NowPlaying,
    Track(TrackRecord),
}

#[derive(Debug, Deserialize)]
struct RawTrack {
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    loved: Option<FlagValue>,
    #[serde(default)]
    date: Option<RawDate>,
    #[serde(default)]
    artist: Option<RawNamed>,
    #[serde(default)]
    album: Option<RawNamed>,
    #[serde(rename = "@attr", default)]
    attr: Option<RawAttr>,
}

#[derive(Debug, Deserialize)]
struct RawDate {
    uts: FlagValue,
}

/// `{"#text": ...}` in the compact format, `{"name": ...}` in the extended one.
#[derive(Debug, Deserialize)]
struct RawNamed {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "#text", default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAttr {
    #[serde(default)]
    nowplaying: Option<FlagValue>,
}

/// The API sends numbers and booleans as strings, but not always.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl FlagValue {
    fn as_bool(&self) -> bool {
        match self {
            FlagValue::Text(s) => matches!(s.as_str(), "1" | "true"),
            FlagValue::Int(n) => *n != 0,
            FlagValue::Bool(b) => *b,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            FlagValue::Text(s) => s.trim().parse().ok(),
            FlagValue::Int(n) => Some(*n),
            FlagValue::Bool(_) => None,
        }
    }
}

impl RawNamed {
    fn into_name(self) -> Option<String> {
        self.name
            .or(self.text)
            .filter(|s| !s.trim().is_empty())
    }
}

/// Parse one page entry.
///
/// Returns [`SyncError::Parse`] for entries without a usable timestamp or
/// with the wrong shape.
pub fn parse_entry(entry: &Value) -> Result<ParsedEntry, SyncError> {
    let raw = RawTrack::deserialize(entry).map_err(|e| SyncError::Parse(e.to_string()))?;

    if raw
        .attr
        .as_ref()
        .and_then(|a| a.nowplaying.as_ref())
        .is_some_and(FlagValue::as_bool)
    {
        return Ok(ParsedEntry::NowPlaying);
    }

    let date = raw
        .date
        .ok_or_else(|| SyncError::Parse(format!("track '{}' has no date", raw.name)))?;
    let uts = date
        .uts
        .as_i64()
        .ok_or_else(|| SyncError::Parse(format!("track '{}' has a non-numeric date", raw.name)))?;

    let loved = raw.loved.as_ref().is_some_and(FlagValue::as_bool);
    let artist = raw.artist.and_then(RawNamed::into_name);
    let album = raw.album.and_then(RawNamed::into_name);

    let record = TrackRecord::new(uts, raw.name, raw.url)
        .ok_or_else(|| SyncError::Parse(format!("timestamp {} out of range", uts)))?
        .with_artist(artist)
        .with_album(album)
        .with_loved(loved);

    Ok(ParsedEntry::Track(record))
}
