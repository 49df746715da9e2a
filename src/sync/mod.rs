//! Incremental range synchronization.
//!
//! Given a requested span of a subject's history, the coordinator loads the
//! spans already retrieved, computes the gaps, fetches each gap page by page,
//! deduplicates and stores the records, and only then commits the gap to the
//! subject's coverage. A gap that fails anywhere before its commit leaves
//! coverage untouched, so calling [`SyncCoordinator::sync`] again over the
//! same span retries exactly the missing gaps.

pub mod error;
pub mod intervals;
pub mod record;
pub mod source;
pub mod throttle;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use error::SyncError;
pub use intervals::{Interval, IntervalSet};
pub use source::{SourceFetcher, SourcePage};

use crate::state::{CoverageStore, RecordStore, TrackRecord};
use record::ParsedEntry;
use throttle::Throttle;

/// Length of a "month" when sizing pages (31 days).
pub const SECONDS_PER_MONTH: u64 = 2_678_400;

/// Largest page the source accepts.
pub const MAX_PAGE_SIZE: u32 = 1000;

const PAGE_SIZE_STEP: u32 = 100;

/// Page size for a gap: 100 per month of history, between 100 and 1000.
pub fn page_size_for(gap: Interval) -> u32 {
    let months = gap.duration_secs() / SECONDS_PER_MONTH;
    let steps = months.clamp(1, u64::from(MAX_PAGE_SIZE / PAGE_SIZE_STEP));
    steps as u32 * PAGE_SIZE_STEP
}

/// Tuning for the sync engine. Decoupled from CLI parsing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) max_concurrent_gaps: usize,
    pub(crate) request_interval: Duration,
    pub(crate) page_timeout: Duration,
    pub(crate) max_parse_failures: u32,
    pub(crate) no_progress_bar: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_gaps: 1,
            request_interval: Duration::from_millis(250),
            page_timeout: Duration::from_secs(30),
            max_parse_failures: 10,
            no_progress_bar: false,
        }
    }
}

/// A gap that was not committed, and why.
#[derive(Debug)]
pub struct FailedGap {
    pub gap: Interval,
    pub error: SyncError,
}

/// Outcome of one [`SyncCoordinator::sync`] call.
#[derive(Debug, Default)]
pub struct SyncResult {
    /// Records stored by this call, newest first.
    pub stored: Vec<TrackRecord>,
    /// Gaps committed to coverage by this call, ascending.
    pub committed: Vec<Interval>,
    /// Gaps left uncommitted, ascending.
    pub failed: Vec<FailedGap>,
    /// Coverage after this call.
    pub coverage: IntervalSet,
}

impl SyncResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        self.failed
            .iter()
            .any(|f| matches!(f.error, SyncError::Cancelled))
    }
}

/// Orchestrates gap computation, retrieval, storage and coverage commits.
pub struct SyncCoordinator {
    source: Arc<dyn SourceFetcher>,
    records: Arc<dyn RecordStore>,
    coverage: Arc<dyn CoverageStore>,
    config: SyncConfig,
    throttle: Throttle,
    /// One lock per subject; held for a whole `sync` call.
    subject_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(
        source: Arc<dyn SourceFetcher>,
        records: Arc<dyn RecordStore>,
        coverage: Arc<dyn CoverageStore>,
        config: SyncConfig,
    ) -> Self {
        let throttle = Throttle::new(config.request_interval);
        Self {
            source,
            records,
            coverage,
            config,
            throttle,
            subject_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Bring `span` of `subject`'s history into the local store.
    ///
    /// Returns `Err` only when coverage can't be loaded; per-gap failures
    /// are reported in [`SyncResult::failed`] and never affect other gaps.
    pub async fn sync(
        &self,
        subject: &str,
        span: Interval,
        shutdown: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let subject_lock = self.subject_lock(subject);
        let result = {
            let _guard = subject_lock.lock().await;
            self.sync_locked(subject, span, shutdown).await
        };
        self.release_subject_lock(subject, subject_lock);
        result
    }

    /// Body of [`Self::sync`], run while holding the subject's lock.
    async fn sync_locked(
        &self,
        subject: &str,
        span: Interval,
        shutdown: &CancellationToken,
    ) -> Result<SyncResult, SyncError> {
        let coverage = self.coverage.load_coverage(subject).await?;
        if coverage.contains(span) {
            tracing::info!(subject, span = %span, "Requested span already backed up");
            return Ok(SyncResult {
                coverage,
                ..SyncResult::default()
            });
        }

        let gaps = coverage.complement(span);
        let covered_secs: u64 = coverage.intersect(span).iter().map(Interval::len).sum();
        tracing::info!(
            subject,
            span = %span,
            gaps = gaps.len(),
            covered_secs,
            "Fetching uncovered gaps"
        );

        let pb = create_progress_bar(self.config.no_progress_bar, gaps.len() as u64);
        let coverage = Mutex::new(coverage);
        let coverage_ref = &coverage;
        let pb_ref = &pb;

        let outcomes: Vec<(Interval, Result<Vec<TrackRecord>, SyncError>)> = stream::iter(gaps)
            .map(|gap| async move {
                let result = self.sync_gap(subject, gap, coverage_ref, shutdown).await;
                pb_ref.inc(1);
                (gap, result)
            })
            .buffer_unordered(self.config.max_concurrent_gaps.max(1))
            .collect()
            .await;
        pb.finish_and_clear();

        let mut result = SyncResult {
            coverage: coverage.into_inner(),
            ..SyncResult::default()
        };
        for (gap, outcome) in outcomes {
            match outcome {
                Ok(records) => {
                    result.committed.push(gap);
                    result.stored.extend(records);
                }
                Err(error) => {
                    tracing::error!(
                        subject,
                        gap = %gap,
                        error = %error,
                        retryable = error.is_retryable(),
                        "Gap not committed"
                    );
                    result.failed.push(FailedGap { gap, error });
                }
            }
        }
        result.committed.sort_unstable();
        result.failed.sort_by_key(|f| f.gap);
        result.stored.sort_by(|a, b| b.key.cmp(&a.key));

        Ok(result)
    }

    fn subject_lock(&self, subject: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .subject_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(subject.to_string()).or_default().clone()
    }

    /// Drop the map entry once no other call holds or waits on it. Clones
    /// are only taken under the map lock, so the count can't race.
    fn release_subject_lock(&self, subject: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .subject_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(subject);
        }
    }

    /// Retrieve, store and commit one gap.
    async fn sync_gap(
        &self,
        subject: &str,
        gap: Interval,
        coverage: &Mutex<IntervalSet>,
        shutdown: &CancellationToken,
    ) -> Result<Vec<TrackRecord>, SyncError> {
        if shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let page_size = page_size_for(gap);
        tracing::debug!(subject, gap = %gap, page_size, "Fetching gap");

        let first = self.fetch_page(subject, gap, page_size, 1, shutdown).await?;
        let total_pages = first.total_pages;
        let mut collector = GapCollector::new(gap, self.config.max_parse_failures);
        collector.push_page(first.entries)?;

        for page in 2..=total_pages {
            let next = self
                .fetch_page(subject, gap, page_size, page, shutdown)
                .await?;
            collector.push_page(next.entries)?;
        }

        if shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let records = collector.into_records();
        if records.is_empty() {
            tracing::debug!(subject, gap = %gap, "No listens in gap");
        } else {
            self.records.upsert_tracks(subject, &records).await?;
        }

        self.commit(subject, gap, coverage).await?;
        tracing::info!(
            subject,
            gap = %gap,
            pages = total_pages,
            records = records.len(),
            "Gap committed"
        );
        Ok(records)
    }

    /// Add `gap` to coverage and persist it. The in-memory set only changes
    /// once the save succeeded.
    async fn commit(
        &self,
        subject: &str,
        gap: Interval,
        coverage: &Mutex<IntervalSet>,
    ) -> Result<(), SyncError> {
        let mut current = coverage.lock().await;
        let mut updated = current.clone();
        updated.add([gap]);
        self.coverage.save_coverage(subject, &updated).await?;
        *current = updated;
        Ok(())
    }

    /// One throttled, time-limited, cancellable page request.
    async fn fetch_page(
        &self,
        subject: &str,
        gap: Interval,
        page_size: u32,
        page: u32,
        shutdown: &CancellationToken,
    ) -> Result<SourcePage, SyncError> {
        let request = async {
            self.throttle.wait().await;
            tracing::debug!(subject, gap = %gap, page, "Requesting page");
            tokio::time::timeout(
                self.config.page_timeout,
                self.source.fetch_page(subject, gap, page_size, page),
            )
            .await
        };

        tokio::select! {
            _ = shutdown.cancelled() => Err(SyncError::Cancelled),
            outcome = request => match outcome {
                Ok(Ok(page)) => Ok(page),
                Ok(Err(e)) => Err(SyncError::SourceUnavailable(format!("page {}: {:#}", page, e))),
                Err(_) => Err(SyncError::SourceUnavailable(format!(
                    "page {} timed out after {}s",
                    page,
                    self.config.page_timeout.as_secs_f64()
                ))),
            },
        }
    }
}

/// Accumulates the records of one gap across its pages.
struct GapCollector {
    gap: Interval,
    max_parse_failures: u32,
    parse_failures: u32,
    last_key: Option<i64>,
    records: Vec<TrackRecord>,
}

impl GapCollector {
    fn new(gap: Interval, max_parse_failures: u32) -> Self {
        Self {
            gap,
            max_parse_failures,
            parse_failures: 0,
            last_key: None,
            records: Vec::new(),
        }
    }

    /// Parse and filter one page. Pages must be pushed in order, since a
    /// record repeated across a page boundary is dropped by comparing with
    /// the previous key.
    fn push_page(&mut self, entries: Vec<Value>) -> Result<(), SyncError> {
        for entry in &entries {
            match record::parse_entry(entry) {
                Ok(ParsedEntry::NowPlaying) => {}
                Ok(ParsedEntry::Track(track)) => {
                    // Boundary pages can reach past either end of the gap.
                    if track.key < self.gap.start() || track.key > self.gap.end() {
                        continue;
                    }
                    if self.last_key == Some(track.key) {
                        tracing::trace!(key = track.key, "Skipping repeated record");
                        continue;
                    }
                    self.last_key = Some(track.key);
                    self.records.push(track);
                }
                Err(e) => {
                    self.parse_failures += 1;
                    tracing::warn!(gap = %self.gap, error = %e, "Skipping malformed record");
                    if self.parse_failures > self.max_parse_failures {
                        return Err(SyncError::SourceUnavailable(format!(
                            "{} malformed records in gap {}, limit is {}",
                            self.parse_failures, self.gap, self.max_parse_failures
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn into_records(self) -> Vec<TrackRecord> {
        self.records
    }
}

/// Create a progress bar over gaps.
///
/// Hidden when disabled or when stdout is not a TTY (cron, pipes).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} gaps ({eta})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ");
    pb.set_style(style);
    pb
}
