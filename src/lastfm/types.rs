//! Response shapes for `user.getrecenttracks`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::error::LastfmError;
use crate::sync::SourcePage;

#[derive(Debug, Deserialize)]
struct RecentTracksResponse {
    recenttracks: RecentTracks,
}

#[derive(Debug, Deserialize)]
struct RecentTracks {
    #[serde(default)]
    track: OneOrMany,
    #[serde(rename = "@attr")]
    attr: PageAttr,
}

/// A single track is sent as a bare object instead of a one-element array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Value>),
    One(Value),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<Value> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(Value::Null) => Vec::new(),
            OneOrMany::One(v) => vec![v],
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageAttr {
    #[serde(rename = "totalPages", deserialize_with = "lenient_u32")]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: i64,
    #[serde(default)]
    message: String,
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Num(u32),
        Str(String),
    }

    match StrOrNum::deserialize(deserializer)? {
        StrOrNum::Num(n) => Ok(n),
        StrOrNum::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// The API's own error, if `value` is an error body.
fn api_error(value: &Value) -> Option<LastfmError> {
    value.get("error")?;
    let body = ApiErrorBody::deserialize(value).ok()?;
    Some(LastfmError::Api {
        code: body.error,
        message: body.message,
    })
}

/// Decode a `user.getrecenttracks` response body into a page.
pub(crate) fn decode_recent_tracks(body: &str) -> Result<SourcePage, LastfmError> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(err) = api_error(&value) {
        return Err(err);
    }
    let response = RecentTracksResponse::deserialize(value)?;
    Ok(SourcePage {
        entries: response.recenttracks.track.into_vec(),
        total_pages: response.recenttracks.attr.total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_track_array() {
        let body = r#"{"recenttracks": {
            "track": [
                {"name": "A", "date": {"uts": "200"}},
                {"name": "B", "date": {"uts": "100"}}
            ],
            "@attr": {"user": "alice", "totalPages": "3", "page": "1", "perPage": "2", "total": "6"}
        }}"#;
        let page = decode_recent_tracks(body).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.entries[0]["name"], "A");
    }

    #[test]
    fn test_decode_single_track_object() {
        let body = r#"{"recenttracks": {
            "track": {"name": "Only", "date": {"uts": "100"}},
            "@attr": {"totalPages": "1"}
        }}"#;
        let page = decode_recent_tracks(body).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0]["name"], "Only");
    }

    #[test]
    fn test_decode_empty_history() {
        let body = r#"{"recenttracks": {"track": [], "@attr": {"totalPages": "0", "total": "0"}}}"#;
        let page = decode_recent_tracks(body).unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.total_pages, 0);

        let missing = r#"{"recenttracks": {"@attr": {"totalPages": 0}}}"#;
        assert!(decode_recent_tracks(missing).unwrap().entries.is_empty());
    }

    #[test]
    fn test_decode_numeric_total_pages() {
        let body = r#"{"recenttracks": {"track": [], "@attr": {"totalPages": 12}}}"#;
        assert_eq!(decode_recent_tracks(body).unwrap().total_pages, 12);
    }

    #[test]
    fn test_decode_api_error() {
        let body = r#"{"error": 29, "message": "Rate Limit Exceeded"}"#;
        match decode_recent_tracks(body) {
            Err(LastfmError::Api { code, message }) => {
                assert_eq!(code, 29);
                assert_eq!(message, "Rate Limit Exceeded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_recent_tracks("<html>502</html>"),
            Err(LastfmError::Decode(_))
        ));
        assert!(matches!(
            decode_recent_tracks(r#"{"recenttracks": {"@attr": {"totalPages": "many"}}}"#),
            Err(LastfmError::Decode(_))
        ));
    }
}
