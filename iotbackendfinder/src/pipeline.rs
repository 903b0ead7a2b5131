//! Provider run orchestration.
//!
//! Each provider is processed by its own tokio task that owns a fetcher, a
//! cursor and a rate-limit budget. Only the catalog is shared. A run walks
//! `Idle -> Fetching -> Extracting -> ChasingCnames -> Filtering -> Done` and
//! may stop in `Failed` or `Cancelled`; in every case the matches gathered so
//! far are filtered and returned.

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::bulk::{BulkExportReader, BulkStats};
use crate::catalog::PatternCatalog;
use crate::chase::CnameChaser;
use crate::checkpoint::{Checkpoint, ProviderProgress, ResumePoint};
use crate::config::{AppConfig, QuerySelection, RateLimitConfig};
use crate::extract::RecordExtractor;
use crate::fetch::{FetchError, PageSource, PaginationCursor, Query, RateLimitedFetcher};
use crate::postprocess::PostProcessor;
use crate::record::{ExtractionWarning, Match, MatchSet};

/// Cooperative cancellation shared by every provider task
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a provider run failed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// Retries exhausted; a later run can continue from `cursor`
    Transient { query: Query, cursor: PaginationCursor },
    /// Credential rejected or quota used up
    Quota { query: Query, status: u16 },
}

impl From<&FetchError> for FailureKind {
    fn from(error: &FetchError) -> Self {
        match error {
            FetchError::Transient { query, cursor, .. } => FailureKind::Transient {
                query: query.clone(),
                cursor: *cursor,
            },
            FetchError::QuotaExhausted { query, status, .. } => FailureKind::Quota {
                query: query.clone(),
                status: *status,
            },
        }
    }
}

/// State of a single provider run
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    Fetching,
    Extracting,
    ChasingCnames,
    Filtering,
    Done,
    Failed(FailureKind),
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_) | RunState::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Fetching => write!(f, "fetching"),
            RunState::Extracting => write!(f, "extracting"),
            RunState::ChasingCnames => write!(f, "chasing cnames"),
            RunState::Filtering => write!(f, "filtering"),
            RunState::Done => write!(f, "done"),
            RunState::Failed(FailureKind::Transient { query, cursor }) => {
                write!(f, "failed (transient, {} at {})", query, cursor)
            }
            RunState::Failed(FailureKind::Quota { query, status }) => {
                write!(f, "failed (quota, HTTP {} on {})", status, query)
            }
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-run knobs taken from the configuration
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub selection: QuerySelection,
    pub max_chase_depth: u32,
    pub chase_rrtype: String,
    pub page_size: u32,
    pub concurrency: usize,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            selection: config.dnsdb.query_selection,
            max_chase_depth: config.analysis.max_chase_depth,
            chase_rrtype: config.dnsdb.chase_rrtype.clone(),
            page_size: config.dnsdb.page_size,
            concurrency: config.analysis.concurrency.max(1),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Result of one provider run
#[derive(Debug, Clone)]
pub struct ProviderReport {
    pub provider: String,
    pub state: RunState,
    /// Matches before post filtering
    pub raw_matches: usize,
    /// Matches that passed the provider's filters
    pub matches: Vec<Match>,
    pub warnings: Vec<ExtractionWarning>,
    pub error: Option<FetchError>,
    /// Progress to persist for a later resume
    pub progress: ProviderProgress,
    /// Seed queries fetched during this run
    pub queries_run: usize,
    pub duration: Duration,
}

impl ProviderReport {
    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Tracks and logs state transitions of one provider run
struct StateTracker<'a> {
    provider: &'a str,
    state: RunState,
}

impl<'a> StateTracker<'a> {
    fn new(provider: &'a str) -> Self {
        Self {
            provider,
            state: RunState::Idle,
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("[{}] {} -> {}", self.provider, self.state, next);
            self.state = next;
        }
    }
}

/// Run every seed query of `provider`, chase aliases and filter the result.
///
/// `previous` is the provider's saved progress: completed queries are skipped,
/// a stored resume point restarts its query at the saved cursor, and saved
/// matches are carried over.
pub async fn run_provider(
    provider: &str,
    fetcher: &RateLimitedFetcher,
    extractor: &RecordExtractor,
    postprocessor: &PostProcessor,
    settings: &RunSettings,
    previous: Option<ProviderProgress>,
    cancel: &CancelFlag,
) -> ProviderReport {
    let started = Instant::now();
    let mut tracker = StateTracker::new(provider);
    let mut progress = previous.unwrap_or_default();
    let mut matches: MatchSet = progress.matches.drain(..).collect();
    let mut warnings: Vec<ExtractionWarning> = Vec::new();
    let mut error: Option<FetchError> = None;
    let mut queries_run = 0usize;

    if progress.done {
        info!("[{}] Already completed in a previous run", provider);
    } else {
        let queries: Vec<Query> = extractor
            .catalog()
            .provider(provider)
            .map(|p| p.seed_queries(settings.selection).cloned().collect())
            .unwrap_or_default();
        let mut resume_point = progress.resume_point.take();

        'queries: for query in queries {
            if progress.is_query_completed(&query) {
                debug!("[{}] Skipping completed query {}", provider, query);
                continue;
            }

            let mut stream = match resume_point.take() {
                Some(point) if point.query == query => {
                    info!("[{}] Resuming {} at {}", provider, query, point.cursor);
                    fetcher.resume(query.clone(), point.cursor)
                }
                other => {
                    resume_point = other;
                    fetcher.fetch(query.clone())
                }
            };
            queries_run += 1;
            tracker.transition(RunState::Fetching);

            loop {
                if cancel.is_cancelled() {
                    progress.resume_point = Some(ResumePoint {
                        query: query.clone(),
                        cursor: stream.cursor(),
                    });
                    warnings.extend(stream.take_warnings());
                    tracker.transition(RunState::Cancelled);
                    break 'queries;
                }

                match stream.next_page().await {
                    Ok(Some(records)) => {
                        tracker.transition(RunState::Extracting);
                        let added = matches
                            .extend_preferring(extractor.extract(provider, records), |m| extractor.accepts(m));
                        debug!("[{}] {} new matches from {}", provider, added, query);
                        tracker.transition(RunState::Fetching);
                    }
                    Ok(None) => {
                        progress.completed_queries.insert(query.key());
                        warnings.extend(stream.take_warnings());
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] {}", provider, e);
                        progress.resume_point = Some(ResumePoint {
                            query: query.clone(),
                            cursor: e.cursor(),
                        });
                        warnings.extend(stream.take_warnings());
                        tracker.transition(RunState::Failed(FailureKind::from(&e)));
                        error = Some(e);
                        break 'queries;
                    }
                }
            }
        }

        if !tracker.state.is_terminal() {
            tracker.transition(RunState::ChasingCnames);
            let outcome = CnameChaser::new(fetcher, extractor)
                .with_max_depth(settings.max_chase_depth)
                .with_rrtype(settings.chase_rrtype.clone())
                .with_cancel(cancel.clone())
                .chase(provider, matches.iter())
                .await;
            warnings.extend(outcome.warnings);
            matches.merge_preferring(outcome.matches, |m| extractor.accepts(m));
            if let Some(e) = outcome.error {
                tracker.transition(RunState::Failed(FailureKind::from(&e)));
                error = Some(e);
            } else if outcome.cancelled {
                tracker.transition(RunState::Cancelled);
            }
        }
    }

    let final_state = match &tracker.state {
        state if state.is_terminal() => state.clone(),
        _ => RunState::Done,
    };
    tracker.transition(RunState::Filtering);

    let raw_matches = matches.len();
    let filtered = postprocessor.filter(provider, matches.iter().cloned());
    progress.matches = matches.into_vec();
    if final_state == RunState::Done {
        progress.done = true;
        progress.resume_point = None;
    }
    tracker.transition(final_state);

    info!(
        "[{}] {}: {} raw matches, {} kept, {} warnings",
        provider,
        tracker.state,
        raw_matches,
        filtered.len(),
        warnings.len()
    );

    ProviderReport {
        provider: provider.to_string(),
        state: tracker.state,
        raw_matches,
        matches: filtered,
        warnings,
        error,
        progress,
        queries_run,
        duration: started.elapsed(),
    }
}

/// Everything a run produced
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub reports: Vec<ProviderReport>,
    /// Present for bulk runs
    pub bulk_stats: Option<BulkStats>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl RunOutcome {
    /// Filtered matches of every provider, keyed by (provider, value)
    pub fn matches(&self) -> MatchSet {
        let mut set = MatchSet::new();
        for report in &self.reports {
            set.extend(report.matches.iter().cloned());
        }
        set
    }

    pub fn warning_count(&self) -> usize {
        let bulk = self.bulk_stats.as_ref().map(|s| s.warnings.len()).unwrap_or(0);
        self.reports.iter().map(|r| r.warnings.len()).sum::<usize>() + bulk
    }

    pub fn failed(&self) -> impl Iterator<Item = &ProviderReport> {
        self.reports.iter().filter(|r| matches!(r.state, RunState::Failed(_)))
    }

    /// True when every provider reached `Done`
    pub fn is_complete(&self) -> bool {
        self.reports.iter().all(ProviderReport::is_done)
    }

    /// Checkpoint holding every provider's progress
    pub fn to_checkpoint(&self, catalog_version: &str, settings_hash: &str) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(catalog_version.to_string(), settings_hash.to_string());
        for report in &self.reports {
            checkpoint.record_progress(&report.provider, report.progress.clone());
        }
        checkpoint
    }
}

/// Drives provider runs over the remote API or over bulk export files
pub struct Pipeline {
    extractor: RecordExtractor,
    postprocessor: PostProcessor,
    rate_limit: RateLimitConfig,
    settings: RunSettings,
    cancel: CancelFlag,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<PatternCatalog>,
        rate_limit: RateLimitConfig,
        settings: RunSettings,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            extractor: RecordExtractor::new(catalog.clone()),
            postprocessor: PostProcessor::new(catalog),
            rate_limit,
            settings,
            cancel,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Run `providers` against the remote API, `settings.concurrency` at a time.
    ///
    /// Reports come back in the order of `providers`.
    pub async fn run_remote(
        &self,
        providers: &[String],
        source: Arc<dyn PageSource>,
        checkpoint: Option<&Checkpoint>,
        progress_bar: Option<ProgressBar>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        info!(
            "Querying {} providers via {} ({} concurrent)",
            providers.len(),
            source.name(),
            self.settings.concurrency
        );

        let mut handles = Vec::with_capacity(providers.len());
        for provider in providers {
            let provider = provider.clone();
            let previous = checkpoint.and_then(|c| c.progress(&provider)).cloned();
            let semaphore = semaphore.clone();
            let source = source.clone();
            let extractor = self.extractor.clone();
            let postprocessor = self.postprocessor.clone();
            let rate_limit = self.rate_limit.clone();
            let settings = self.settings.clone();
            let cancel = self.cancel.clone();
            let bar = progress_bar.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Provider semaphore closed")?;
                if let Some(bar) = &bar {
                    bar.set_message(format!("querying {}", provider));
                }
                let fetcher = RateLimitedFetcher::new(source, &rate_limit, settings.page_size);
                let report = run_provider(
                    &provider,
                    &fetcher,
                    &extractor,
                    &postprocessor,
                    &settings,
                    previous,
                    &cancel,
                )
                .await;
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                Ok::<ProviderReport, anyhow::Error>(report)
            }));
        }

        let mut outcome = RunOutcome::default();
        for handle in handles {
            let report = handle.await.context("Provider task panicked")??;
            outcome.reports.push(report);
        }
        outcome.cancelled = self.cancel.is_cancelled();
        outcome.duration = started.elapsed();
        Ok(outcome)
    }

    /// Extract every provider from local export files, `workers` files at a time.
    ///
    /// Per-file match sets are merged in file order, so the result does not
    /// depend on which worker finishes first.
    pub async fn run_bulk(
        &self,
        files: Vec<PathBuf>,
        providers: &[String],
        workers: usize,
        progress_bar: Option<ProgressBar>,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let providers = Arc::new(providers.to_vec());
        info!("Reading {} export files with {} workers", files.len(), workers.max(1));

        let mut handles = Vec::with_capacity(files.len());
        for path in files {
            let semaphore = semaphore.clone();
            let extractor = self.extractor.clone();
            let providers = providers.clone();
            let cancel = self.cancel.clone();
            let bar = progress_bar.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Bulk worker semaphore closed")?;
                if cancel.is_cancelled() {
                    debug!("Skipping {} after cancellation", path.display());
                    return Ok::<Option<(MatchSet, BulkStats)>, anyhow::Error>(None);
                }
                if let Some(bar) = &bar {
                    bar.set_message(format!("reading {}", path.display()));
                }
                let result = tokio::task::spawn_blocking(move || {
                    let mut set = MatchSet::new();
                    let stats = BulkExportReader::read_records(&path, |record| {
                        for provider in providers.iter() {
                            set.extend_preferring(extractor.extract_record(provider, &record), |m| {
                                extractor.accepts(m)
                            });
                        }
                    })?;
                    info!(
                        "{}: {} records, {} matches, {} malformed lines",
                        path.display(),
                        stats.records,
                        set.len(),
                        stats.malformed
                    );
                    Ok::<(MatchSet, BulkStats), anyhow::Error>((set, stats))
                })
                .await
                .context("Bulk worker panicked")??;
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                Ok(Some(result))
            }));
        }

        let mut merged = MatchSet::new();
        let mut stats = BulkStats::default();
        for handle in handles {
            if let Some((set, file_stats)) = handle.await.context("Bulk task panicked")?? {
                merged.merge_preferring(set, |m| self.extractor.accepts(m));
                stats.merge(file_stats);
            }
        }

        let cancelled = self.cancel.is_cancelled();
        let mut outcome = RunOutcome {
            cancelled,
            ..RunOutcome::default()
        };
        for provider in providers.iter() {
            let mut tracker = StateTracker::new(provider);
            tracker.transition(RunState::Extracting);
            let raw: Vec<Match> = merged.for_provider(provider).cloned().collect();
            tracker.transition(RunState::Filtering);
            let kept = self.postprocessor.filter(provider, raw.iter().cloned());
            tracker.transition(if cancelled { RunState::Cancelled } else { RunState::Done });
            info!("[{}] {} raw matches, {} kept", provider, raw.len(), kept.len());

            outcome.reports.push(ProviderReport {
                provider: provider.clone(),
                state: tracker.state,
                raw_matches: raw.len(),
                matches: kept,
                warnings: Vec::new(),
                error: None,
                progress: ProviderProgress::default(),
                queries_run: 0,
                duration: started.elapsed(),
            });
        }
        outcome.bulk_stats = Some(stats);
        outcome.duration = started.elapsed();
        Ok(outcome)
    }
}
