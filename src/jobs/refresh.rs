//! Refresh run coordinator
//!
//! One run walks every non-excluded library through a [`ChunkedScanner`], checking the
//! time budget and the item quota between windows. The media server is checked for
//! liveness before each library and whenever it disappears mid-library; a server running
//! its own scan is waited out.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{RunError, ScanError};
use crate::media::Library;
use crate::services::health::write_health;
use crate::services::logging::Sink;
use crate::services::metrics::{ResourceSampler, ResourceSummary, format_duration};
use crate::services::notifications::{
    Notification, NotificationKind, NotificationLevel, NotificationService,
};
use crate::services::reconciler::Reconciler;
use crate::services::resolver::ResolverStats;
use crate::services::scanner::{ChunkReport, ChunkedScanner, ItemQuota, ScanContext};

/// A library this slow gets a warning
const SLOW_LIBRARY: Duration = Duration::from_secs(600);
const FAILURE_RATIO_WARNING: f64 = 0.30;
const FAILURE_RATIO_MIN_CHECKED: usize = 20;
const LOW_HIT_RATE: f64 = 0.5;
/// Warnings shown in a notification
const NOTIFY_WARNINGS: usize = 5;
/// Deadline used when the configured budget does not fit in an `Instant`
const MAX_RUN_TIME: Duration = Duration::from_secs(7 * 86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    TimeBudget,
    Quota,
    Aborted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::TimeBudget => "time_budget",
            StopReason::Quota => "quota",
            StopReason::Aborted => "aborted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-library profile of a run
#[derive(Debug, Clone)]
pub struct LibraryReport {
    pub library: Library,
    pub duration: Duration,
    pub items: usize,
    pub chunks: usize,
    pub checked: usize,
    pub fixed: usize,
    pub failed: usize,
    pub cooling: usize,
    pub dead_skipped: usize,
    pub recovered: usize,
    pub transient: usize,
    pub new_dead: Vec<String>,
    pub stop: StopReason,
}

impl LibraryReport {
    fn new(library: Library) -> Self {
        Self {
            library,
            duration: Duration::ZERO,
            items: 0,
            chunks: 0,
            checked: 0,
            fixed: 0,
            failed: 0,
            cooling: 0,
            dead_skipped: 0,
            recovered: 0,
            transient: 0,
            new_dead: Vec::new(),
            stop: StopReason::Completed,
        }
    }

    fn absorb(&mut self, chunk: ChunkReport) {
        self.chunks += 1;
        self.checked += chunk.checked;
        self.fixed += chunk.fixed;
        self.failed += chunk.failed;
        self.cooling += chunk.cooling;
        self.dead_skipped += chunk.dead_skipped;
        self.recovered += chunk.recovered;
        self.transient += chunk.transient;
        self.new_dead.extend(chunk.new_dead);
    }

    pub fn profile_line(&self) -> String {
        format!(
            "LIB | name={} | type={} | dur={} | items={} | checked={} | fixed={} | failed={} | \
             cooling={} | dead_skip={} | new_dead={} | recovered={} | transient={} | chunks={} | stop={}",
            self.library.title,
            self.library.kind,
            format_duration(self.duration),
            self.items,
            self.checked,
            self.fixed,
            self.failed,
            self.cooling,
            self.dead_skipped,
            self.new_dead.len(),
            self.recovered,
            self.transient,
            self.chunks,
            self.stop
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub libraries: Vec<LibraryReport>,
    pub stop: StopReason,
    pub duration: Duration,
    pub items_examined: usize,
    pub resolver: ResolverStats,
    pub dead_total: i64,
    pub warnings: Vec<String>,
    pub resources: Option<ResourceSummary>,
}

impl RunReport {
    fn sum(&self, f: impl Fn(&LibraryReport) -> usize) -> usize {
        self.libraries.iter().map(f).sum()
    }

    pub fn checked(&self) -> usize {
        self.sum(|l| l.checked)
    }

    pub fn fixed(&self) -> usize {
        self.sum(|l| l.fixed)
    }

    pub fn failed(&self) -> usize {
        self.sum(|l| l.failed)
    }

    pub fn recovered(&self) -> usize {
        self.sum(|l| l.recovered)
    }

    pub fn new_dead(&self) -> Vec<String> {
        self.libraries
            .iter()
            .flat_map(|l| l.new_dead.iter().cloned())
            .collect()
    }

    pub fn libraries_completed(&self) -> usize {
        self.libraries
            .iter()
            .filter(|l| l.stop == StopReason::Completed)
            .count()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "libraries={} | checked={} | fixed={} | failed={} | recovered={} | new_dead={} | \
             dead_total={} | provider_hits={}/{} | dur={} | stop={}",
            self.libraries.len(),
            self.checked(),
            self.fixed(),
            self.failed(),
            self.recovered(),
            self.new_dead().len(),
            self.dead_total,
            self.resolver.hits,
            self.resolver.tries,
            format_duration(self.duration),
            self.stop
        )
    }
}

/// Warnings worth an operator's attention
pub fn collect_warnings(libraries: &[LibraryReport], resolver: ResolverStats) -> Vec<String> {
    let mut warnings = Vec::new();
    for lib in libraries {
        if lib.duration >= SLOW_LIBRARY {
            warnings.push(format!(
                "Slow library: {} took {}",
                lib.library.title,
                format_duration(lib.duration)
            ));
        }
        if lib.checked >= FAILURE_RATIO_MIN_CHECKED
            && lib.failed as f64 / lib.checked as f64 >= FAILURE_RATIO_WARNING
        {
            warnings.push(format!(
                "High failure rate: {} failed {}/{} items",
                lib.library.title, lib.failed, lib.checked
            ));
        }
    }
    if let Some(rate) = resolver.hit_rate() {
        if rate < LOW_HIT_RATE {
            warnings.push(format!(
                "Low provider hit rate: {:.0}% ({}/{})",
                rate * 100.0,
                resolver.hits,
                resolver.tries
            ));
        }
    }
    warnings
}

/// A run that was aborted, with whatever was done before
#[derive(Debug)]
pub struct RunFailure {
    pub error: RunError,
    pub report: RunReport,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run aborted: {} (items processed: {}, libraries completed: {})",
            self.error,
            self.report.checked(),
            self.report.libraries_completed()
        )
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub struct RunCoordinator {
    reconciler: Arc<Reconciler>,
    config: EngineConfig,
    notifications: NotificationService,
    sampler: Option<Arc<ResourceSampler>>,
    health_file: Option<PathBuf>,
}

/// Per-run shared state
struct RunState {
    started: Instant,
    deadline: Instant,
    quota: ItemQuota,
    aborted: AtomicBool,
}

impl RunCoordinator {
    pub fn new(
        reconciler: Arc<Reconciler>,
        config: EngineConfig,
        notifications: NotificationService,
    ) -> Self {
        Self {
            reconciler,
            config,
            notifications,
            sampler: None,
            health_file: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_health_file(mut self, path: PathBuf) -> Self {
        self.health_file = Some(path);
        self
    }

    /// Execute one refresh run
    pub async fn run(&self) -> Result<RunReport, RunFailure> {
        let started = Instant::now();
        let state = RunState {
            started,
            deadline: started
                .checked_add(self.config.time_budget)
                .unwrap_or_else(|| started + MAX_RUN_TIME),
            quota: ItemQuota::new(self.config.item_quota),
            aborted: AtomicBool::new(false),
        };

        let sinks = self.reconciler.sinks();
        sinks.reset(&Sink::RUN_SCOPED);
        self.reconciler.resolver().reset_stats();
        let sampler = self.sampler.as_ref().map(|s| {
            s.reset();
            s.spawn(self.config.sample_interval)
        });

        info!(
            budget_secs = self.config.time_budget.as_secs(),
            quota = self.config.item_quota,
            chunk_size = self.config.chunk_size,
            "Refresh run started"
        );
        self.notifications
            .notify(Notification::new(
                NotificationKind::RunStarted,
                NotificationLevel::Info,
                "Metadata refresh started",
                format!("Started {}", Local::now().format("%d.%m.%Y %H:%M:%S")),
            ))
            .await;

        let (libraries, failure) = self.run_libraries(&state).await;

        if let Some(handle) = sampler {
            handle.stop().await;
        }
        let report = self.build_report(&state, libraries, failure.is_some()).await;

        match failure {
            None => {
                self.finish(&report).await;
                Ok(report)
            }
            Some(error) => {
                let failure = RunFailure { error, report };
                self.abort(&failure).await;
                Err(failure)
            }
        }
    }

    async fn run_libraries(&self, state: &RunState) -> (Vec<LibraryReport>, Option<RunError>) {
        if let Err(e) = self.ensure_online().await {
            return (Vec::new(), Some(e));
        }

        let libraries = match self.reconciler.server().list_libraries().await {
            Ok(libraries) => libraries,
            Err(e) => return (Vec::new(), Some(RunError::Server(e))),
        };
        let libraries: Vec<Library> = libraries
            .into_iter()
            .filter(|lib| {
                let excluded = self.config.is_excluded(lib);
                if excluded {
                    info!(library = %lib.title, "Library excluded");
                }
                !excluded
            })
            .collect();

        let results: Vec<Result<LibraryReport, (LibraryReport, RunError)>> =
            stream::iter(libraries)
                .map(|lib| self.run_library(lib, state))
                .buffer_unordered(self.config.effective_concurrency())
                .collect()
                .await;

        let mut reports = Vec::new();
        let mut failure = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err((report, e)) => {
                    reports.push(report);
                    failure.get_or_insert(e);
                }
            }
        }
        (reports, failure)
    }

    async fn run_library(
        &self,
        library: Library,
        state: &RunState,
    ) -> Result<LibraryReport, (LibraryReport, RunError)> {
        let started = Instant::now();
        let mut report = LibraryReport::new(library.clone());

        let result = self.scan_library(library, state, &mut report).await;
        report.duration = started.elapsed();
        self.reconciler.sinks().record(Sink::Profiler, report.profile_line());

        match result {
            Ok(()) => Ok(report),
            Err(e) => {
                state.aborted.store(true, Ordering::Release);
                report.stop = StopReason::Aborted;
                Err((report, e))
            }
        }
    }

    async fn scan_library(
        &self,
        library: Library,
        state: &RunState,
        report: &mut LibraryReport,
    ) -> Result<(), RunError> {
        if let Some(stop) = self.stop_reason(state) {
            report.stop = stop;
            return Ok(());
        }

        self.ensure_online().await?;
        if !self.wait_until_idle(state.deadline).await? {
            report.stop = StopReason::TimeBudget;
            return Ok(());
        }

        let server = self.reconciler.server();
        let refs = server
            .list_items(&library.id, None)
            .await
            .map_err(RunError::Server)?;
        report.items = refs.len();
        info!(library = %library.title, items = refs.len(), "Scanning library");

        let mut scanner = ChunkedScanner::new(library, refs, self.config.chunk_size);
        let ctx = ScanContext {
            reconciler: &self.reconciler,
            quota: &state.quota,
            lookback: self.config.lookback,
        };

        let mut interruptions = 0;
        loop {
            if let Some(stop) = self.stop_reason(state) {
                if !scanner.is_finished() {
                    info!(
                        library = %scanner.library().title,
                        stop = %stop,
                        remaining = scanner.remaining(),
                        "Stopping library early"
                    );
                    report.stop = stop;
                }
                return Ok(());
            }

            match scanner.next_chunk(&ctx).await {
                Ok(Some(chunk)) => {
                    interruptions = 0;
                    report.absorb(chunk);
                }
                Ok(None) => return Ok(()),
                Err(ScanError::Server(e)) if e.is_unavailable() => {
                    interruptions += 1;
                    warn!(
                        library = %scanner.library().title,
                        cursor = scanner.cursor(),
                        error = %e,
                        "Media server went away mid-library"
                    );
                    if interruptions > self.config.offline_retries {
                        return Err(RunError::ServerUnavailable {
                            attempts: interruptions,
                        });
                    }
                    self.ensure_online().await?;
                    if !self.wait_until_idle(state.deadline).await? {
                        report.stop = StopReason::TimeBudget;
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn stop_reason(&self, state: &RunState) -> Option<StopReason> {
        if state.aborted.load(Ordering::Acquire) {
            Some(StopReason::Aborted)
        } else if Instant::now() >= state.deadline {
            Some(StopReason::TimeBudget)
        } else if state.quota.is_exhausted() {
            Some(StopReason::Quota)
        } else {
            None
        }
    }

    /// Check liveness, waiting out a booting server up to the configured retries
    async fn ensure_online(&self) -> Result<(), RunError> {
        let server = self.reconciler.server();
        let retries = self.config.offline_retries;
        for attempt in 0..=retries {
            if server.is_online().await {
                return Ok(());
            }
            if attempt < retries {
                warn!(
                    attempt = attempt + 1,
                    retries,
                    grace_secs = self.config.boot_grace.as_secs(),
                    "Media server offline, waiting"
                );
                tokio::time::sleep(self.config.boot_grace).await;
            }
        }
        Err(RunError::ServerUnavailable {
            attempts: retries + 1,
        })
    }

    /// Wait while the server runs its own library scan. Returns `false` if the deadline
    /// passed first.
    async fn wait_until_idle(&self, deadline: Instant) -> Result<bool, RunError> {
        let server = self.reconciler.server();
        let mut announced = false;
        loop {
            if !server.is_scanning().await.map_err(RunError::Server)? {
                if announced {
                    info!("Media server idle, resuming");
                }
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if !announced {
                info!(
                    poll_secs = self.config.busy_poll_interval.as_secs(),
                    "Media server is scanning, waiting"
                );
                announced = true;
            }
            tokio::time::sleep(self.config.busy_poll_interval).await;
        }
    }

    async fn build_report(
        &self,
        state: &RunState,
        libraries: Vec<LibraryReport>,
        aborted: bool,
    ) -> RunReport {
        let stop = if aborted {
            StopReason::Aborted
        } else if libraries.iter().any(|l| l.stop == StopReason::TimeBudget) {
            StopReason::TimeBudget
        } else if libraries.iter().any(|l| l.stop == StopReason::Quota) {
            StopReason::Quota
        } else {
            StopReason::Completed
        };

        let dead_total = match self.reconciler.db().item_states().count_dead().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Could not count dead items");
                0
            }
        };
        let resolver = self.reconciler.resolver().stats();

        RunReport {
            warnings: collect_warnings(&libraries, resolver),
            libraries,
            stop,
            duration: state.started.elapsed(),
            items_examined: state.quota.used(),
            resolver,
            dead_total,
            resources: self.sampler.as_ref().map(|s| s.summary()),
        }
    }

    fn write_common_sinks(&self, report: &RunReport) {
        let sinks = self.reconciler.sinks();
        if !report.warnings.is_empty() {
            sinks.record(Sink::Warnings, format!("RUN WARNINGS ({})", report.warnings.len()));
            for warning in &report.warnings {
                warn!(warning = %warning, "Run warning");
                sinks.record(Sink::Warnings, format!("WARNING | {}", warning));
            }
        }
        sinks.record(Sink::Profiler, format!("RUN | {}", report.summary_line()));
        if let Some(resources) = &report.resources {
            sinks.record(Sink::ResourceSummary, resources.describe());
        }
    }

    fn record_health(&self, ok: bool) {
        if let Some(path) = &self.health_file {
            if let Err(e) = write_health(path, ok, Local::now()) {
                warn!(path = %path.display(), error = %e, "Could not write health file");
            }
        }
    }

    async fn finish(&self, report: &RunReport) {
        info!(
            checked = report.checked(),
            fixed = report.fixed(),
            failed = report.failed(),
            recovered = report.recovered(),
            dead_total = report.dead_total,
            stop = %report.stop,
            "Refresh run finished"
        );
        self.write_common_sinks(report);
        self.record_health(true);

        let new_dead = report.new_dead();
        if !new_dead.is_empty() {
            self.notifications
                .notify(Notification::new(
                    NotificationKind::DeadItems,
                    NotificationLevel::Error,
                    format!("{} item(s) marked dead", new_dead.len()),
                    new_dead
                        .iter()
                        .map(|t| format!("• {}", t))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ))
                .await;
        }

        let mut body = report.summary_line().replace(" | ", "\n");
        if let Some(resources) = &report.resources {
            body.push_str(&format!("\n\n{}", resources.describe()));
        }
        let level = if report.warnings.is_empty() {
            NotificationLevel::Info
        } else {
            body.push_str("\n\nWarnings:\n");
            body.push_str(
                &report
                    .warnings
                    .iter()
                    .take(NOTIFY_WARNINGS)
                    .map(|w| format!("• {}", w))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
            NotificationLevel::Warning
        };
        self.notifications
            .notify(Notification::new(
                NotificationKind::RunFinished,
                level,
                "Metadata refresh finished",
                body,
            ))
            .await;

        self.reconciler.sinks().flush();
    }

    async fn abort(&self, failure: &RunFailure) {
        error!(
            error = %failure.error,
            processed = failure.report.checked(),
            libraries_completed = failure.report.libraries_completed(),
            "Refresh run aborted"
        );
        self.write_common_sinks(&failure.report);
        self.record_health(false);

        self.notifications
            .notify(Notification::new(
                NotificationKind::RunAborted,
                NotificationLevel::Error,
                "Metadata refresh aborted",
                format!(
                    "Reason: {}\nItems processed: {}\nLibraries completed: {}",
                    failure.error,
                    failure.report.checked(),
                    failure.report.libraries_completed()
                ),
            ))
            .await;

        self.reconciler.sinks().flush();
    }
}
