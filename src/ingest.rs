//! The ingestion loop: fetch a snapshot, normalize it, write what is new,
//! pause as the quota allows, repeat.
//!
//! One cycle runs to completion before the next starts and records are
//! handled one at a time. Per-record problems (bad fields, missing identity,
//! lookup or write failures) are counted and logged; only a startup that
//! never reaches upstream ends the loop with an error.
//!
//! Samples whose novelty lookup or write failed are kept in a bounded
//! pending buffer and retried at the start of the next cycle, ahead of that
//! cycle's records. The oldest entry is evicted when the buffer is full.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::governor::{Pause, RateGovernor};
use crate::model::NormalizedSample;
use crate::normalize::normalize;
use crate::store::{AppendOutcome, SampleStore};
use crate::upstream::{FetchError, TelemetrySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Normalizing,
    Writing,
    Throttling,
    Aborted,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upstream unreachable at startup after {attempts} attempt(s): {source}")]
    Startup {
        attempts: u32,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Consecutive failed fetches tolerated before the first success.
    pub startup_fetch_attempts: u32,
    pub pending_capacity: usize,
    pub archive_dir: Option<PathBuf>,
    pub max_cycles: Option<u64>,
}

impl IngestOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            startup_fetch_attempts: cfg.ingest.startup_fetch_attempts,
            pending_capacity: cfg.ingest.pending_capacity,
            archive_dir: cfg.app.archive_snapshots.then(|| cfg.snapshot_dir()),
            max_cycles: None,
        }
    }
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            startup_fetch_attempts: 3,
            pending_capacity: 512,
            archive_dir: None,
            max_cycles: None,
        }
    }
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub remaining_quota: Option<i64>,
    pub fetched: usize,
    pub inserted: usize,
    pub already_stored: usize,
    pub rejected: usize,
    pub field_issues: usize,
    pub lookup_failures: usize,
    pub write_failures: usize,
    pub pending_written: usize,
    pub pending_evicted: usize,
}

/// Counters accumulated over the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub inserted: u64,
    pub already_stored: u64,
    pub rejected: u64,
    pub field_issues: u64,
    pub lookup_failures: u64,
    pub write_failures: u64,
    pub pending_evicted: u64,
    pub backoff_waits: u64,
    pub quota_alarms: u64,
}

impl IngestStats {
    fn absorb(&mut self, r: &CycleReport) {
        self.cycles += 1;
        self.inserted += r.inserted as u64;
        self.already_stored += r.already_stored as u64;
        self.rejected += r.rejected as u64;
        self.field_issues += r.field_issues as u64;
        self.lookup_failures += r.lookup_failures as u64;
        self.write_failures += r.write_failures as u64;
        self.pending_evicted += r.pending_evicted as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Inserted,
    AlreadyStored,
    LookupFailed,
    WriteFailed,
}

pub struct Ingestor<S, T> {
    source: S,
    store: T,
    governor: RateGovernor,
    options: IngestOptions,
    pending: VecDeque<NormalizedSample>,
    state: LoopState,
    stats: IngestStats,
    cycle: u64,
    reached_upstream: bool,
    startup_failures: u32,
}

impl<S, T> Ingestor<S, T>
where
    S: TelemetrySource,
    T: SampleStore,
{
    pub fn new(source: S, store: T, governor: RateGovernor, options: IngestOptions) -> Self {
        Self {
            source,
            store,
            governor,
            options,
            pending: VecDeque::new(),
            state: LoopState::Idle,
            stats: IngestStats::default(),
            cycle: 0,
            reached_upstream: false,
            startup_failures: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// One cycle without the throttle pause: fetch, retry pending samples,
    /// normalize, write.
    #[instrument(skip_all)]
    pub async fn poll_once(&mut self) -> Result<CycleReport, FetchError> {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        self.state = LoopState::Fetching;
        let fetched = match self.source.fetch_snapshot().await {
            Ok(f) => f,
            Err(err) => {
                self.state = LoopState::Idle;
                return Err(err);
            }
        };
        report.remaining_quota = fetched.remaining_quota;
        report.fetched = fetched.samples.len();
        self.archive(&fetched.body).await;

        self.state = LoopState::Writing;
        self.flush_pending(&mut report).await;

        self.state = LoopState::Normalizing;
        let mut samples = Vec::with_capacity(fetched.samples.len());
        for raw in &fetched.samples {
            match normalize(raw) {
                Ok(n) => {
                    if !n.issues.is_empty() {
                        report.field_issues += n.issues.len();
                        for issue in &n.issues {
                            debug!(vehicle_id = n.sample.vehicle_id, %issue, "field defaulted");
                        }
                    }
                    samples.push(n.sample);
                }
                Err(rejected) => {
                    report.rejected += 1;
                    warn!(%rejected, "dropping record without identity");
                }
            }
        }

        self.state = LoopState::Writing;
        for sample in samples {
            match self.store_one(&sample).await {
                RecordOutcome::Inserted => report.inserted += 1,
                RecordOutcome::AlreadyStored => report.already_stored += 1,
                RecordOutcome::LookupFailed => {
                    report.lookup_failures += 1;
                    self.defer(sample, &mut report);
                }
                RecordOutcome::WriteFailed => {
                    report.write_failures += 1;
                    self.defer(sample, &mut report);
                }
            }
        }

        self.state = LoopState::Idle;
        self.stats.absorb(&report);
        Ok(report)
    }

    /// Runs cycles until `shutdown` resolves, `max_cycles` is reached, or the
    /// upstream cannot be reached at startup. A shutdown request is honoured
    /// between cycles, never in the middle of one.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<IngestStats, IngestError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let started = Instant::now();

        loop {
            if self.options.max_cycles.is_some_and(|max| self.cycle >= max) {
                info!(cycles = self.cycle, "cycle limit reached");
                break;
            }

            let wait = match self.poll_once().await {
                Ok(report) => {
                    self.reached_upstream = true;
                    self.startup_failures = 0;
                    info!(
                        cycle = report.cycle,
                        elapsed = ?started.elapsed(),
                        remaining = ?report.remaining_quota,
                        fetched = report.fetched,
                        inserted = report.inserted,
                        already_stored = report.already_stored,
                        rejected = report.rejected,
                        field_issues = report.field_issues,
                        failed = report.lookup_failures + report.write_failures,
                        pending = self.pending.len(),
                        "cycle complete"
                    );
                    let pause = self.governor.pause(report.remaining_quota);
                    self.record_pause(pause)
                }
                Err(err) => {
                    self.stats.failed_cycles += 1;
                    if !self.reached_upstream {
                        self.startup_failures += 1;
                        if self.startup_failures >= self.options.startup_fetch_attempts {
                            self.state = LoopState::Aborted;
                            error!(error = %err, attempts = self.startup_failures, "upstream unreachable at startup");
                            return Err(IngestError::Startup {
                                attempts: self.startup_failures,
                                source: err,
                            });
                        }
                    }
                    warn!(error = %err, cycle = self.cycle, "cycle aborted");
                    match self.refusal_pause(&err) {
                        Some(pause) => self.record_pause(pause),
                        None => self.governor.poll_interval(),
                    }
                }
            };

            self.state = LoopState::Throttling;
            let stop = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = tokio::time::sleep(wait) => false,
            };
            self.state = LoopState::Idle;
            if stop {
                info!(cycles = self.cycle, "shutdown requested");
                break;
            }
        }

        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "stopping with unwritten samples; they are lost");
        }
        Ok(self.stats.clone())
    }

    fn refusal_pause(&mut self, err: &FetchError) -> Option<Pause> {
        let FetchError::Status {
            status,
            remaining_quota,
            ..
        } = err
        else {
            return None;
        };
        let rate_limited = *status == StatusCode::TOO_MANY_REQUESTS;
        self.governor.after_refusal(*remaining_quota, rate_limited)
    }

    fn record_pause(&mut self, pause: Pause) -> Duration {
        if pause.backing_off {
            self.stats.backoff_waits += 1;
        }
        if pause.alarm {
            self.stats.quota_alarms += 1;
        }
        pause.wait
    }

    async fn store_one(&self, sample: &NormalizedSample) -> RecordOutcome {
        let vehicle_id = sample.vehicle_id;
        let observed_at = sample.observed_at;
        match self.store.is_novel(vehicle_id, observed_at).await {
            Ok(true) => {}
            Ok(false) => return RecordOutcome::AlreadyStored,
            Err(err) => {
                warn!(vehicle_id, %observed_at, error = %err, "novelty lookup failed");
                return RecordOutcome::LookupFailed;
            }
        }
        match self.store.append(sample).await {
            Ok(AppendOutcome::Inserted) => RecordOutcome::Inserted,
            Ok(AppendOutcome::AlreadyStored) => {
                debug!(vehicle_id, %observed_at, "unique key already present");
                RecordOutcome::AlreadyStored
            }
            Err(err) => {
                warn!(vehicle_id, %observed_at, error = %err, "write failed");
                RecordOutcome::WriteFailed
            }
        }
    }

    async fn flush_pending(&mut self, report: &mut CycleReport) {
        if self.pending.is_empty() {
            return;
        }
        let retry: Vec<_> = self.pending.drain(..).collect();
        debug!(count = retry.len(), "retrying pending samples");
        for sample in retry {
            match self.store_one(&sample).await {
                RecordOutcome::Inserted => report.pending_written += 1,
                RecordOutcome::AlreadyStored => {}
                RecordOutcome::LookupFailed | RecordOutcome::WriteFailed => {
                    self.defer(sample, report);
                }
            }
        }
    }

    fn defer(&mut self, sample: NormalizedSample, report: &mut CycleReport) {
        let same_key = |p: &NormalizedSample| {
            p.vehicle_id == sample.vehicle_id && p.observed_at == sample.observed_at
        };
        if self.pending.iter().any(same_key) {
            return;
        }
        if self.options.pending_capacity == 0 {
            report.pending_evicted += 1;
            warn!(vehicle_id = sample.vehicle_id, observed_at = %sample.observed_at, "sample dropped; pending buffer disabled");
            return;
        }
        if self.pending.len() >= self.options.pending_capacity {
            if let Some(evicted) = self.pending.pop_front() {
                report.pending_evicted += 1;
                warn!(
                    vehicle_id = evicted.vehicle_id,
                    observed_at = %evicted.observed_at,
                    "pending buffer full; oldest sample dropped"
                );
            }
        }
        self.pending.push_back(sample);
    }

    async fn archive(&self, body: &str) {
        let Some(dir) = &self.options.archive_dir else {
            return;
        };
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
        let path = dir.join(format!("{stamp}-{}.json", self.cycle));
        if let Err(err) = tokio::fs::write(&path, body).await {
            warn!(path = %path.display(), error = %err, "failed to archive snapshot");
        }
    }
}
