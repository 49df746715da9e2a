use clap::{Args, Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "lastfm-backup",
    version,
    about = "Incrementally back up Last.fm listening history to SQLite"
)]
pub struct Cli {
    /// Log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Directory holding the backup database
    #[arg(long, default_value = "~/.lastfm-backup", global = true)]
    pub data_directory: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch every part of the requested span not yet backed up
    Sync(SyncArgs),
    /// Show what is stored for a user
    Status(SubjectArgs),
    /// List the time spans already backed up for a user
    Coverage(CoverageArgs),
    /// Print stored tracks, newest first
    Tracks(TracksArgs),
    /// Delete stored state for one user, or the whole database
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SubjectArgs {
    /// Last.fm username
    #[arg(short = 'u', long)]
    pub username: String,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub subject: SubjectArgs,

    /// Last.fm API key.
    /// WARNING: passing via --api-key is visible in process listings.
    /// Prefer the LASTFM_API_KEY environment variable instead.
    #[arg(long, env = "LASTFM_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Relative span ending now: overall, 7day, 1month, 3month, 6month, 12month
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub period: Option<String>,

    /// Start of the span: ISO date (2024-01-02), datetime (2024-01-02T14:30:00),
    /// unix seconds, or interval (20d). Defaults to the start of "overall".
    #[arg(long)]
    pub from: Option<String>,

    /// End of the span, same formats as --from. Defaults to now.
    #[arg(long)]
    pub to: Option<String>,

    /// Number of gaps fetched concurrently
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_concurrent_gaps: u16,

    /// Minimum delay between page requests, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub request_interval_ms: u64,

    /// Timeout for each page request, in seconds. Retries get a fresh one
    #[arg(long, default_value_t = 30)]
    pub page_timeout_secs: u64,

    /// Retries for transient request failures
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay between retries, in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    /// Malformed records tolerated per gap before it fails
    #[arg(long, default_value_t = 10)]
    pub max_parse_failures: u32,

    /// Disable progress bar
    #[arg(long)]
    pub no_progress_bar: bool,

    /// Run continuously, waiting N seconds between runs
    #[arg(long)]
    pub watch_with_interval: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct CoverageArgs {
    #[command(flatten)]
    pub subject: SubjectArgs,

    /// Print spans as a JSON list of [start, end] unix-second pairs
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TracksArgs {
    #[command(flatten)]
    pub subject: SubjectArgs,

    /// Only tracks listened at or after this time (same formats as sync --from)
    #[arg(long)]
    pub from: Option<String>,

    /// Only tracks listened at or before this time
    #[arg(long)]
    pub to: Option<String>,

    /// Maximum number of tracks to print
    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Only clear this user's tracks and coverage
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}
