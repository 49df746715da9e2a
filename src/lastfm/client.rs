use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::error::LastfmError;
use super::types::decode_recent_tracks;
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::sync::{Interval, SourceFetcher, SourcePage};

pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

const DEFAULT_USER_AGENT: &str = concat!("lastfm-backup/", env!("CARGO_PKG_VERSION"));

const RECENT_TRACKS_METHOD: &str = "user.getrecenttracks";

/// Connection settings for [`LastfmClient`].
#[derive(Clone)]
pub struct LastfmConfig {
    pub api_key: String,
    pub base_url: String,
    pub user_agent: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

impl LastfmConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl std::fmt::Debug for LastfmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LastfmConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Last.fm web service client for reading a user's scrobbles.
#[derive(Debug)]
pub struct LastfmClient {
    http: Client,
    config: LastfmConfig,
}

impl LastfmClient {
    pub fn new(config: LastfmConfig) -> Result<Self, LastfmError> {
        if config.api_key.trim().is_empty() {
            return Err(LastfmError::Config("API key is empty".into()));
        }
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// One `user.getrecenttracks` request, no retries.
    async fn recent_tracks(
        &self,
        user: &str,
        span: Interval,
        limit: u32,
        page: u32,
    ) -> Result<SourcePage, LastfmError> {
        let params = recent_tracks_params(&self.config.api_key, user, span, limit, page);
        let response = self
            .http
            .get(&self.config.base_url)
            .query(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        // Error bodies come with 4xx/5xx statuses; the API code is more specific.
        match decode_recent_tracks(&body) {
            Err(e @ LastfmError::Api { .. }) => Err(e),
            _ if !status.is_success() => Err(LastfmError::HttpStatus {
                status: status.as_u16(),
            }),
            decoded => decoded,
        }
    }
}

fn recent_tracks_params(
    api_key: &str,
    user: &str,
    span: Interval,
    limit: u32,
    page: u32,
) -> Vec<(&'static str, String)> {
    vec![
        ("method", RECENT_TRACKS_METHOD.to_string()),
        ("user", user.to_string()),
        ("limit", limit.to_string()),
        ("page", page.to_string()),
        ("from", span.start().to_string()),
        ("to", span.end().to_string()),
        ("extended", "1".to_string()),
        ("format", "json".to_string()),
        ("api_key", api_key.to_string()),
    ]
}

#[async_trait]
impl SourceFetcher for LastfmClient {
    async fn fetch_page(
        &self,
        subject: &str,
        span: Interval,
        page_size: u32,
        page_number: u32,
    ) -> anyhow::Result<SourcePage> {
        let page = retry_with_backoff(
            &self.config.retry,
            |e: &LastfmError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.recent_tracks(subject, span, page_size, page_number),
        )
        .await?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SpanSpec};
    use crate::state::{RecordStore as _, SqliteStateDb};
    use crate::sync::SyncCoordinator;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `responses` in order, one per connection, and records request lines.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        serve_slow(
            responses
                .into_iter()
                .map(|(status, body)| (status, body, Duration::ZERO))
                .collect(),
        )
        .await
    }

    /// Like [`serve`], but waits the given time before each reply.
    async fn serve_slow(
        responses: Vec<(u16, &'static str, Duration)>,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            for (status, body, delay) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let request = String::from_utf8_lossy(&buf);
                let line = request.lines().next().unwrap_or_default().to_string();
                seen.lock().unwrap().push(line);
                tokio::time::sleep(delay).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });
        (format!("http://{}/2.0/", addr), requests)
    }

    fn client(base_url: String, max_retries: u32) -> LastfmClient {
        let mut config = LastfmConfig::new("secret-key");
        config.base_url = base_url;
        config.timeout = Duration::from_secs(5);
        config.retry = RetryConfig {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        LastfmClient::new(config).unwrap()
    }

    const PAGE: &str = r#"{"recenttracks": {"track": [{"name": "A", "date": {"uts": "150"}}], "@attr": {"totalPages": "1"}}}"#;

    #[test]
    fn test_params_cover_span_and_paging() {
        let span = Interval::new(100, 200).unwrap();
        let params = recent_tracks_params("k", "alice", span, 300, 2);
        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("method"), Some("user.getrecenttracks"));
        assert_eq!(get("user"), Some("alice"));
        assert_eq!(get("limit"), Some("300"));
        assert_eq!(get("page"), Some("2"));
        assert_eq!(get("from"), Some("100"));
        assert_eq!(get("to"), Some("200"));
        assert_eq!(get("extended"), Some("1"));
        assert_eq!(get("format"), Some("json"));
        assert_eq!(get("api_key"), Some("k"));
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(matches!(
            LastfmClient::new(LastfmConfig::new("  ")),
            Err(LastfmError::Config(_))
        ));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let debug = format!("{:?}", LastfmConfig::new("secret-key"));
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_fetch_page_sends_query_and_decodes() {
        let (url, requests) = serve(vec![(200, PAGE)]).await;
        let client = client(url, 0);

        let page = client
            .fetch_page("alice", Interval::new(100, 200).unwrap(), 100, 1)
            .await
            .unwrap();

        assert_eq!(page.total_pages, 1);
        assert_eq!(page.entries.len(), 1);
        let line = requests.lock().unwrap()[0].clone();
        assert!(line.starts_with("GET /2.0/?"), "{}", line);
        assert!(line.contains("user=alice"));
        assert!(line.contains("from=100"));
        assert!(line.contains("to=200"));
    }

    #[tokio::test]
    async fn test_transient_api_error_is_retried() {
        let (url, requests) = serve(vec![
            (200, r#"{"error": 29, "message": "Rate Limit Exceeded"}"#),
            (503, "service unavailable"),
            (200, PAGE),
        ])
        .await;
        let client = client(url, 3);

        let page = client
            .fetch_page("alice", Interval::new(100, 200).unwrap(), 100, 1)
            .await
            .unwrap();

        assert_eq!(page.entries.len(), 1);
        assert_eq!(requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_api_error_is_not_retried() {
        let (url, requests) = serve(vec![
            (403, r#"{"error": 10, "message": "Invalid API key"}"#),
            (200, PAGE),
        ])
        .await;
        let client = client(url, 3);

        let err = client
            .fetch_page("alice", Interval::new(100, 200).unwrap(), 100, 1)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Invalid API key"), "{}", err);
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_status_without_api_body() {
        let (url, _) = serve(vec![(404, "not found")]).await;
        let client = client(url, 3);

        let err = client
            .recent_tracks("alice", Interval::new(100, 200).unwrap(), 100, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, LastfmError::HttpStatus { status: 404 }));
    }

    #[tokio::test]
    async fn test_slow_transient_failure_is_retried_within_page_budget() {
        let (url, requests) = serve_slow(vec![
            (503, "service unavailable", Duration::from_millis(700)),
            (200, PAGE, Duration::ZERO),
        ])
        .await;
        let config = Config {
            username: "alice".into(),
            api_key: "secret-key".into(),
            db_path: PathBuf::from("history.db"),
            span: SpanSpec::from_args(None, None, None).unwrap(),
            request_interval: Duration::ZERO,
            request_timeout: Duration::from_secs(1),
            watch_with_interval: None,
            retry_delay_secs: 1,
            max_retries: 3,
            max_parse_failures: 10,
            max_concurrent_gaps: 1,
            no_progress_bar: true,
        };
        let mut lastfm = config.lastfm_config();
        lastfm.base_url = url;

        let db = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let coordinator = SyncCoordinator::new(
            Arc::new(LastfmClient::new(lastfm).unwrap()),
            db.clone(),
            db.clone(),
            config.sync_config(),
        );
        let span = Interval::new(100, 200).unwrap();

        let result = coordinator
            .sync("alice", span, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_complete(), "{:?}", result.failed);
        assert_eq!(result.committed, vec![span]);
        assert_eq!(requests.lock().unwrap().len(), 2);
        assert_eq!(db.count_tracks("alice").await.unwrap(), 1);
    }
}
