//! The continual-ingestion loop.
//!
//! [`Harvester`] is an explicit state machine:
//!
//! ```text
//! Waiting --(tick due)--> Refreshing --(credential)--> Fetching --> Idle --> Waiting
//!                              \--(auth error)---------------------/
//! any state --(shutdown)--> Stopped
//! ```
//!
//! The coordinating task owns [`ScheduleState`]. During `Fetching` every mode
//! runs in its own task (bounded by a semaphore); within a mode, artifacts are
//! fetched and published one at a time. Shutdown is cooperative: it is
//! observed while waiting and before each fetch, and never interrupts a
//! request or a rename that has already started.

mod schedule;
mod summary;

pub use schedule::{DEFAULT_TIMETABLE_EVERY, ScheduleState, TimetablePolicy};
pub use summary::{ArtifactOutcome, ArtifactStatus, CycleSummary};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::Clock;
use crate::error::HarvestError;
use crate::modes::{ArtifactKind, ModeTable};
use crate::publish::SnapshotWriter;
use crate::report::CycleReport;
use crate::services::feed_api::ModeFetcher;
use crate::services::token_api::TokenSource;
use crate::token::{Credential, TokenManager};

/// How often a waiting loop re-checks the clock and the stop signal.
pub const POLL_GRANULARITY: Duration = Duration::from_millis(500);

/// Refresh margin as a multiple of the poll interval.
pub const DEFAULT_MARGIN_FACTOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Waiting,
    Refreshing,
    Fetching,
    Idle,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub interval: Duration,
    /// Refresh the token when it expires sooner than this.
    pub refresh_margin: Duration,
    pub timetable: TimetablePolicy,
    /// Modes fetched at the same time.
    pub concurrency: usize,
    /// Pause between consecutive requests for the same mode.
    pub request_spacing: Duration,
}

impl HarvestConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            refresh_margin: interval
                .checked_mul(DEFAULT_MARGIN_FACTOR)
                .unwrap_or(Duration::MAX),
            timetable: TimetablePolicy::default(),
            concurrency: usize::MAX,
            request_spacing: Duration::ZERO,
        }
    }
}

pub struct Harvester<S, F> {
    config: HarvestConfig,
    modes: ModeTable,
    tokens: TokenManager<S>,
    fetcher: Arc<F>,
    writer: Arc<SnapshotWriter>,
    clock: Arc<dyn Clock>,
    report: Option<CycleReport>,
    credential: Option<Arc<Credential>>,
    schedule: ScheduleState,
    state: LoopState,
}

impl<S, F> Harvester<S, F>
where
    S: TokenSource,
    F: ModeFetcher + 'static,
{
    pub fn new(
        config: HarvestConfig,
        modes: ModeTable,
        tokens: TokenManager<S>,
        fetcher: Arc<F>,
        writer: SnapshotWriter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schedule = ScheduleState::new(clock.now());
        Self {
            config,
            modes,
            tokens,
            fetcher,
            writer: Arc::new(writer),
            clock,
            report: None,
            credential: None,
            schedule,
            state: LoopState::Waiting,
        }
    }

    pub fn with_report(mut self, report: CycleReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn schedule(&self) -> &ScheduleState {
        &self.schedule
    }

    pub fn credential(&self) -> Option<&Arc<Credential>> {
        self.credential.as_ref()
    }

    /// Runs cycles until `shutdown` is cancelled. Always ends in [`LoopState::Stopped`].
    pub async fn run(&mut self, shutdown: CancellationToken) -> LoopState {
        info!(
            modes = self.modes.len(),
            interval_secs = self.config.interval.as_secs(),
            refresh_margin_secs = self.config.refresh_margin.as_secs(),
            timetable = ?self.config.timetable,
            output_dir = %self.writer.output_dir().display(),
            "Harvester starting"
        );

        loop {
            self.state = LoopState::Waiting;
            if !self.wait_for_tick(&shutdown).await {
                break;
            }
            self.run_cycle(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
        }

        self.state = LoopState::Stopped;
        info!(cycles = self.schedule.cycles_run, "Harvester stopped");
        self.state
    }

    /// Sleeps in short steps until the next tick. Returns `false` if stopped first.
    async fn wait_for_tick(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            let now = self.clock.now();
            if self.schedule.is_due(now) {
                return true;
            }
            let nap = self.schedule.remaining(now).min(POLL_GRANULARITY);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = self.clock.sleep(nap) => {}
            }
        }
    }

    /// One full cycle: Refreshing, Fetching, Idle, then schedules the next tick.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> CycleSummary {
        self.state = LoopState::Refreshing;
        let loop_start = self.clock.now();
        let cycle = self.schedule.cycles_run;
        info!(cycle, cycle_count = self.schedule.cycle_count, "Starting cycle");

        let mut auth_error = None;
        let mut outcomes = Vec::new();
        let mut interrupted = false;

        let refreshed = self
            .tokens
            .ensure_valid_credential(self.credential.clone(), self.config.refresh_margin)
            .await;
        match refreshed {
            Ok(credential) => {
                self.credential = Some(Arc::clone(&credential));
                self.state = LoopState::Fetching;
                (outcomes, interrupted) = self.fetch_all(credential, loop_start, cycle, shutdown).await;
            }
            Err(e) => {
                error!(cycle, error = %e, "Token refresh failed, skipping fetches this cycle");
                auth_error = Some(e);
            }
        }

        self.state = LoopState::Idle;

        for outcome in &outcomes {
            if outcome.kind == ArtifactKind::Timetable && outcome.is_published() {
                self.schedule.record_timetable(&outcome.mode_key, loop_start);
            }
        }

        let elapsed = (self.clock.now() - loop_start).to_std().unwrap_or_default();
        let summary = CycleSummary {
            cycle,
            started_at: loop_start,
            elapsed,
            auth_error,
            outcomes,
            interrupted,
        };
        info!(
            cycle,
            published = summary.published(),
            failed = summary.failed(),
            elapsed_ms = elapsed.as_millis() as u64,
            interrupted,
            "Cycle complete"
        );

        if let Some(report) = &self.report
            && let Err(e) = report.append(&summary)
        {
            warn!(path = %report.path().display(), error = %e, "Failed to append cycle report");
        }

        self.schedule
            .advance(loop_start, self.config.interval, self.config.timetable);
        debug!(next_tick_at = %self.schedule.next_tick_at, "Next cycle scheduled");

        summary
    }

    async fn fetch_all(
        &self,
        credential: Arc<Credential>,
        loop_start: DateTime<Utc>,
        cycle: u64,
        shutdown: &CancellationToken,
    ) -> (Vec<ArtifactOutcome>, bool) {
        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut tasks = JoinSet::new();

        for (index, mode) in self.modes.iter().enumerate() {
            let timetable_due = mode.supports(ArtifactKind::Timetable)
                && self
                    .schedule
                    .timetable_due(self.config.timetable, &mode.key, loop_start);
            if timetable_due {
                info!(mode = %mode.key, "Timetable due this cycle");
            }

            let job = ModeJob {
                mode_key: mode.key.clone(),
                kinds: mode.kinds_for_cycle(timetable_due),
                fetcher: Arc::clone(&self.fetcher),
                writer: Arc::clone(&self.writer),
                credential: Arc::clone(&credential),
                clock: Arc::clone(&self.clock),
                spacing: self.config.request_spacing,
                shutdown: shutdown.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let span = tracing::info_span!("harvest_mode", mode = %mode.key, cycle);

            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, job.run().await)
                }
                .instrument(span),
            );
        }

        let mut per_mode = Vec::with_capacity(self.modes.len());
        let mut interrupted = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, (outcomes, stopped))) => {
                    interrupted |= stopped;
                    per_mode.push((index, outcomes));
                }
                Err(e) => error!(error = %e, "Mode task failed"),
            }
        }

        per_mode.sort_by_key(|(index, _)| *index);
        let outcomes = per_mode.into_iter().flat_map(|(_, o)| o).collect();
        (outcomes, interrupted)
    }
}

/// Sequential fetch-then-publish for one mode.
struct ModeJob<F> {
    mode_key: String,
    kinds: Vec<ArtifactKind>,
    fetcher: Arc<F>,
    writer: Arc<SnapshotWriter>,
    credential: Arc<Credential>,
    clock: Arc<dyn Clock>,
    spacing: Duration,
    shutdown: CancellationToken,
}

impl<F: ModeFetcher> ModeJob<F> {
    /// Returns the outcome of every started fetch and whether a stop cut the list short.
    async fn run(self) -> (Vec<ArtifactOutcome>, bool) {
        let mut outcomes = Vec::with_capacity(self.kinds.len());

        for (i, &kind) in self.kinds.iter().enumerate() {
            if i > 0 && !self.spacing.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {}
                    _ = self.clock.sleep(self.spacing) => {}
                }
            }
            if self.shutdown.is_cancelled() {
                info!(skipped = self.kinds.len() - i, "Stop requested, not starting further fetches");
                return (outcomes, true);
            }

            let status = self.fetch_and_publish(kind).await;
            outcomes.push(ArtifactOutcome {
                mode_key: self.mode_key.clone(),
                kind,
                status,
            });
        }

        (outcomes, false)
    }

    async fn fetch_and_publish(&self, kind: ArtifactKind) -> ArtifactStatus {
        let result = match self.fetcher.fetch(&self.mode_key, kind, &self.credential).await {
            Ok(result) => result,
            Err(e @ HarvestError::InvalidRequest(_)) => {
                error!(%kind, error = %e, "Fetch request rejected; the mode table is inconsistent");
                return ArtifactStatus::Failed(e);
            }
            Err(e) => {
                warn!(%kind, error = %e, "Fetch failed");
                return ArtifactStatus::Failed(e);
            }
        };

        let (bytes, entities) = (result.bytes, result.entities);
        match self.writer.publish(result).await {
            Ok(path) => {
                info!(%kind, bytes, entities = ?entities, "Snapshot updated");
                ArtifactStatus::Published {
                    path,
                    bytes,
                    entities,
                }
            }
            Err(e) => {
                error!(%kind, error = %e, "Failed to publish snapshot");
                ArtifactStatus::Failed(e)
            }
        }
    }
}
