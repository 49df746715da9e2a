use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};

use crate::lastfm::LastfmConfig;
use crate::retry::RetryConfig;
use crate::sync::{Interval, SyncConfig, SyncError};
use crate::types::Period;

const DATABASE_FILE: &str = "history.db";

/// Configuration for the `sync` command.
pub struct Config {
    pub username: String,
    pub api_key: String,
    pub db_path: PathBuf,
    pub span: SpanSpec,

    pub request_interval: Duration,
    /// Limit for a single HTTP request; a page may take several.
    pub request_timeout: Duration,
    pub watch_with_interval: Option<u64>,
    pub retry_delay_secs: u64,

    pub max_retries: u32,
    pub max_parse_failures: u32,
    pub max_concurrent_gaps: u16,

    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("api_key", &"<redacted>")
            .field("db_path", &self.db_path)
            .field("span", &self.span)
            .field("max_concurrent_gaps", &self.max_concurrent_gaps)
            .finish_non_exhaustive()
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Location of the backup database inside `data_directory`.
pub fn database_path(data_directory: &str) -> PathBuf {
    expand_tilde(data_directory).join(DATABASE_FILE)
}

impl Config {
    pub fn from_cli(data_directory: &str, args: crate::cli::SyncArgs) -> anyhow::Result<Self> {
        let span = SpanSpec::from_args(
            args.period.as_deref(),
            args.from.as_deref(),
            args.to.as_deref(),
        )?;
        // Fail on an inverted span now rather than on the first cycle.
        span.resolve(Local::now())?;

        Ok(Self {
            username: args.subject.username,
            api_key: args.api_key,
            db_path: database_path(data_directory),
            span,
            request_interval: Duration::from_millis(args.request_interval_ms),
            request_timeout: Duration::from_secs(args.page_timeout_secs),
            watch_with_interval: args.watch_with_interval,
            retry_delay_secs: args.retry_delay,
            max_retries: args.max_retries,
            max_parse_failures: args.max_parse_failures,
            max_concurrent_gaps: args.max_concurrent_gaps,
            no_progress_bar: args.no_progress_bar,
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            max_concurrent_gaps: usize::from(self.max_concurrent_gaps.max(1)),
            request_interval: self.request_interval,
            page_timeout: self.page_budget(),
            max_parse_failures: self.max_parse_failures,
            no_progress_bar: self.no_progress_bar,
        }
    }

    pub fn lastfm_config(&self) -> LastfmConfig {
        let mut config = LastfmConfig::new(self.api_key.clone());
        config.timeout = self.request_timeout;
        config.retry = self.retry_config();
        config
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_delay_secs),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Time a page may take in the coordinator: every attempt the client
    /// makes, each up to the request timeout, plus the longest backoff.
    fn page_budget(&self) -> Duration {
        self.request_timeout
            .saturating_mul(self.max_retries.saturating_add(1))
            .saturating_add(self.retry_config().max_total_delay())
    }
}

/// A point in time given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeArg {
    At(DateTime<Local>),
    /// Relative to when the span is resolved, so each watch cycle moves it.
    DaysAgo(i64),
}

impl TimeArg {
    pub fn resolve(&self, now: DateTime<Local>) -> Result<DateTime<Local>, SyncError> {
        match self {
            TimeArg::At(dt) => Ok(*dt),
            TimeArg::DaysAgo(days) => TimeDelta::try_days(*days)
                .and_then(|delta| now.checked_sub_signed(delta))
                .ok_or_else(|| {
                    SyncError::InvalidRange(format!("{} days ago is out of range", days))
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStart {
    Period(Period),
    At(TimeArg),
}

/// Requested span, resolved against the clock at the start of each sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanSpec {
    pub start: SpanStart,
    pub end: Option<TimeArg>,
}

impl SpanSpec {
    pub fn from_args(
        period: Option<&str>,
        from: Option<&str>,
        to: Option<&str>,
    ) -> anyhow::Result<Self> {
        let start = match (period, from) {
            (Some(p), _) => SpanStart::Period(p.parse()?),
            (None, Some(f)) => SpanStart::At(parse_time_arg(f)?),
            (None, None) => SpanStart::Period(Period::Overall),
        };
        let end = to.map(parse_time_arg).transpose()?;
        Ok(Self { start, end })
    }

    /// Concrete `[start, end]` in unix seconds. The start is moved back to
    /// local midnight so whole days are fetched.
    pub fn resolve(&self, now: DateTime<Local>) -> Result<Interval, SyncError> {
        let start = match self.start {
            SpanStart::Period(period) => period.start_from(now),
            SpanStart::At(arg) => arg.resolve(now)?,
        };
        let start = start_of_day(start);
        let end = match self.end {
            Some(arg) => arg.resolve(now)?,
            None => now,
        };
        Interval::new(start.timestamp(), end.timestamp())
    }
}

fn start_of_day(dt: DateTime<Local>) -> DateTime<Local> {
    dt.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or(dt)
}

/// Parse a command-line time.
///
/// Accepts:
/// - Relative interval: `"20d"` (20 days before the sync starts)
/// - ISO date: `"2025-01-02"` (midnight local time)
/// - ISO datetime: `"2025-01-02T14:30:00"` (local time)
/// - Unix seconds: `"1700000000"`
pub(crate) fn parse_time_arg(s: &str) -> anyhow::Result<TimeArg> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            if days >= 0 {
                return Ok(TimeArg::DaysAgo(days));
            }
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            if let Some(dt) = naive_dt.and_local_timezone(Local).earliest() {
                return Ok(TimeArg::At(dt));
            }
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        if let Some(local) = dt.and_local_timezone(Local).earliest() {
            return Ok(TimeArg::At(local));
        }
    }
    if let Ok(secs) = s.parse::<i64>() {
        if let Some(utc) = DateTime::from_timestamp(secs, 0) {
            return Ok(TimeArg::At(utc.with_timezone(&Local)));
        }
    }
    anyhow::bail!(
        "Cannot parse '{}' as a time. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), unix seconds (1700000000), or interval (20d)",
        s
    )
}
