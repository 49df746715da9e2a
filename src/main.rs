//! lastfm-backup: incremental backup of Last.fm listening history.
//!
//! Listens are fetched from the Last.fm web service into a local SQLite
//! database. The database also records which time spans are already fully
//! backed up, so each run only requests the gaps and an interrupted run
//! resumes exactly where it stopped.

#![warn(clippy::all)]

mod cli;
mod config;
mod lastfm;
pub mod retry;
mod shutdown;
mod state;
mod sync;
mod types;

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::Command;
use state::{CoverageStore, RecordStore, StateDb, SyncRunStats};
use sync::{Interval, SyncCoordinator};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Open an existing database, or explain that there is none yet.
async fn open_existing(db_path: &Path) -> anyhow::Result<Option<state::SqliteStateDb>> {
    if !db_path.exists() {
        println!("No backup database found at {}", db_path.display());
        println!("Run a sync first to create the database.");
        return Ok(None);
    }
    Ok(Some(state::SqliteStateDb::open(db_path).await?))
}

/// Run the status command.
async fn run_status(db_path: &Path, args: cli::SubjectArgs) -> anyhow::Result<()> {
    let Some(db) = open_existing(db_path).await? else {
        return Ok(());
    };
    let summary = db.get_summary(&args.username).await?;

    println!("Backup database: {}", db.path().display());
    println!("User:            {}", args.username);
    println!();
    println!("Tracks:");
    println!("  Total:  {}", summary.total_tracks);
    println!("  Loved:  {}", summary.loved_tracks);
    if let Some(oldest) = &summary.oldest_listen {
        println!("  Oldest: {}", oldest.format(DATETIME_FORMAT));
    }
    if let Some(newest) = &summary.newest_listen {
        println!("  Newest: {}", newest.format(DATETIME_FORMAT));
    }
    println!();
    println!("Coverage:");
    println!("  Spans:   {}", summary.covered_intervals);
    println!("  Days:    {:.1}", summary.covered_seconds as f64 / 86_400.0);
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!("Last sync started:   {}", started.format(DATETIME_FORMAT));
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!("Last sync completed: {}", completed.format(DATETIME_FORMAT));
    }

    let others: Vec<String> = db
        .list_subjects()
        .await?
        .into_iter()
        .filter(|s| s != &args.username)
        .collect();
    if !others.is_empty() {
        println!();
        println!("Other users in this database: {}", others.join(", "));
    }

    Ok(())
}

/// Run the coverage command.
async fn run_coverage(db_path: &Path, args: cli::CoverageArgs) -> anyhow::Result<()> {
    let Some(db) = open_existing(db_path).await? else {
        return Ok(());
    };
    let username = &args.subject.username;
    let coverage = db.load_coverage(username).await?;

    if args.json {
        println!("{}", serde_json::to_string(&coverage)?);
        return Ok(());
    }
    if coverage.is_empty() {
        println!("Nothing backed up yet for {}", username);
        return Ok(());
    }

    println!("Backed up spans for {}:", username);
    for interval in coverage.iter() {
        println!(
            "  {} .. {}",
            format_timestamp(interval.start()),
            format_timestamp(interval.end())
        );
    }
    println!();
    println!(
        "{} spans, {:.1} days in total",
        coverage.len(),
        coverage.total_covered_length() as f64 / 86_400.0
    );
    Ok(())
}

/// Run the tracks command.
async fn run_tracks(db_path: &Path, args: cli::TracksArgs) -> anyhow::Result<()> {
    let Some(db) = open_existing(db_path).await? else {
        return Ok(());
    };
    let now = Local::now();
    let start = match args.from.as_deref() {
        Some(s) => config::parse_time_arg(s)?.resolve(now)?.timestamp(),
        None => i64::MIN,
    };
    let end = match args.to.as_deref() {
        Some(s) => config::parse_time_arg(s)?.resolve(now)?.timestamp(),
        None => i64::MAX,
    };
    let span = Interval::new(start, end)?;

    let tracks = db
        .tracks_in_range(&args.subject.username, span, Some(args.limit))
        .await?;
    for track in &tracks {
        println!(
            "{}  {}{} - {}",
            track.timestamp.format(DATETIME_FORMAT),
            if track.loved { "♥ " } else { "" },
            track.artist.as_deref().unwrap_or("?"),
            track.name
        );
    }
    if tracks.is_empty() {
        println!("No tracks stored in that span.");
    }
    Ok(())
}

fn format_timestamp(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.format(DATETIME_FORMAT).to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// Run the reset-state command.
async fn run_reset_state(db_path: &Path, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    if !db_path.exists() {
        println!("No backup database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        match &args.username {
            Some(username) => println!("This will delete all stored tracks and coverage for {}", username),
            None => {
                println!("This will delete the backup database at:");
                println!("  {}", db_path.display());
            }
        }
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if let Some(username) = &args.username {
        let db = state::SqliteStateDb::open(db_path).await?;
        let removed = db.clear_subject(username).await?;
        println!("Removed {} tracks and all coverage for {}.", removed, username);
        return Ok(());
    }

    std::fs::remove_file(db_path)?;
    println!("Backup database deleted.");

    // Also remove WAL and SHM files if they exist
    let wal_path = db_path.with_extension("db-wal");
    let shm_path = db_path.with_extension("db-shm");
    let _ = std::fs::remove_file(&wal_path);
    let _ = std::fs::remove_file(&shm_path);

    Ok(())
}

/// One sync over `span`, bracketed by a `sync_runs` row. Returns the number
/// of gaps left uncommitted.
async fn sync_once(
    coordinator: &SyncCoordinator,
    db: &dyn StateDb,
    subject: &str,
    span: Interval,
    shutdown_token: &CancellationToken,
) -> anyhow::Result<usize> {
    let run_id = db.start_sync_run(subject, span).await?;
    let outcome = coordinator.sync(subject, span, shutdown_token).await;

    let stats = match &outcome {
        Ok(result) => SyncRunStats {
            records_stored: result.stored.len() as u64,
            gaps_committed: result.committed.len() as u64,
            gaps_failed: result.failed.len() as u64,
            interrupted: result.was_cancelled(),
        },
        Err(_) => SyncRunStats::default(),
    };
    if let Err(e) = db.complete_sync_run(run_id, &stats).await {
        tracing::warn!(run_id, error = %e, "Failed to record sync run completion");
    }

    let result = outcome?;
    tracing::info!(
        subject,
        span = %span,
        records = result.stored.len(),
        committed = result.committed.len(),
        failed = result.failed.len(),
        covered_spans = result.coverage.len(),
        "Sync finished"
    );
    Ok(result.failed.len())
}

/// Run the sync command, once or in watch mode.
async fn run_sync(config: config::Config) -> anyhow::Result<()> {
    tracing::debug!(?config, "Resolved configuration");

    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let db = Arc::new(state::SqliteStateDb::open(&config.db_path).await?);
    tracing::debug!("Backup database opened at {}", config.db_path.display());

    let client = Arc::new(lastfm::LastfmClient::new(config.lastfm_config())?);
    let records: Arc<dyn RecordStore> = db.clone();
    let coverage: Arc<dyn CoverageStore> = db.clone();
    let coordinator = SyncCoordinator::new(client, records, coverage, config.sync_config());

    let shutdown_token = shutdown::install_signal_handler()?;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let span = config.span.resolve(Local::now())?;
        let failed = sync_once(
            &coordinator,
            db.as_ref(),
            &config.username,
            span,
            &shutdown_token,
        )
        .await?;

        let Some(interval) = config.watch_with_interval else {
            if failed > 0 {
                anyhow::bail!(
                    "{} gaps were not backed up; run sync again to retry them",
                    failed
                );
            }
            break;
        };

        if failed > 0 {
            tracing::warn!(failed, "Some gaps were not backed up, retrying next cycle");
        }
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }
        tracing::info!("Waiting {} seconds...", interval);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let db_path = config::database_path(&cli.data_directory);
    match cli.command {
        Command::Sync(args) => {
            let config = config::Config::from_cli(&cli.data_directory, args)?;
            tracing::info!(subject = %config.username, "Starting lastfm-backup");
            run_sync(config).await
        }
        Command::Status(args) => run_status(&db_path, args).await,
        Command::Coverage(args) => run_coverage(&db_path, args).await,
        Command::Tracks(args) => run_tracks(&db_path, args).await,
        Command::ResetState(args) => run_reset_state(&db_path, args).await,
    }
}
