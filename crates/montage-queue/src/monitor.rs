// Job Health Monitor
// Detects and repairs zombie jobs: repository says "processing",
// queue has no matching live job

use crate::queue::JobQueue;
use chrono::Utc;
use montage_core::{StepOutcome, StepStateMachine};
use montage_observability::{emit_event, ObservabilityEvent, ProcessKind};
use montage_types::{derive_job_id, JobSpec, Result, StepPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

// ============================================================================
// Monitor Types
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Fixed wall-clock interval between sweeps.
    pub interval: Duration,
    /// Minutes a step may sit in `processing` before it is a zombie
    /// candidate. "Processing" is a legitimate transient state, so the
    /// monitor must not race a healthy in-flight job.
    pub stuck_threshold_minutes: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stuck_threshold_minutes: 20,
        }
    }
}

/// Ephemeral scan finding; recomputed on every pass, never persisted.
#[derive(Debug, Clone)]
pub struct ZombieRecord {
    pub project_id: Uuid,
    pub step: u32,
    pub job_id: String,
    pub minutes_processing: i64,
}

/// Which recovery tier repaired a zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileTier {
    /// The queue recorded success but the write-back never landed;
    /// the recorded result was applied as a completion.
    AppliedCompletedResult,
    /// The queue recorded a failure; the step was marked failed.
    MarkedFailedFromQueue,
    /// No trace anywhere; marked failed as the conservative default.
    MarkedFailedNoTrace,
}

impl ReconcileTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcileTier::AppliedCompletedResult => "applied_completed_result",
            ReconcileTier::MarkedFailedFromQueue => "marked_failed_from_queue",
            ReconcileTier::MarkedFailedNoTrace => "marked_failed_no_trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Idle,
    Scanning,
    Reconciling,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Another sweep was already running; this call did nothing.
    pub skipped: bool,
    pub scanned: usize,
    pub candidates: usize,
    pub reconciled: Vec<(Uuid, ReconcileTier)>,
    /// Projects whose lost `queued` submission was re-queued at low
    /// priority by the catch-up pass.
    pub resubmitted: Vec<Uuid>,
    /// Per-project reconciliation failures. Never aborts the sweep;
    /// the project still matches the scan predicate and is retried on
    /// the next interval.
    pub errors: usize,
}

// ============================================================================
// Job Health Monitor
// ============================================================================

/// Reconciliation loop between the repository and the queue. The two
/// are independently-failing systems with no two-phase commit between
/// them; this monitor restores "processing implies a live or
/// recently-terminal job exists" off the hot path.
pub struct JobHealthMonitor {
    machine: StepStateMachine,
    queue: Arc<dyn JobQueue>,
    config: MonitorConfig,
    sweep_lock: Mutex<()>,
    phase: RwLock<SweepPhase>,
}

impl JobHealthMonitor {
    pub fn new(machine: StepStateMachine, queue: Arc<dyn JobQueue>, config: MonitorConfig) -> Self {
        Self {
            machine,
            queue,
            config,
            sweep_lock: Mutex::new(()),
            phase: RwLock::new(SweepPhase::Idle),
        }
    }

    pub async fn phase(&self) -> SweepPhase {
        *self.phase.read().await
    }

    /// Find zombie candidates: current step `processing` for longer
    /// than the stuck threshold, with no live job under the derived
    /// identifier.
    pub async fn scan(&self) -> Result<(usize, Vec<ZombieRecord>)> {
        let projects = self.machine.store().list_processing().await?;
        let scanned = projects.len();
        let now = Utc::now();
        let mut zombies = Vec::new();

        for project in projects {
            let Some(step) = project.processing_step() else {
                continue;
            };
            let minutes = project.minutes_since_update(now);
            if minutes < self.config.stuck_threshold_minutes {
                continue;
            }

            let Some(descriptor) = self.machine.catalog().get(step) else {
                warn!(project_id = %project.id, step, "processing step has no catalog entry");
                continue;
            };
            let job_id = derive_job_id(project.id, &descriptor.slug);

            match self.queue.get(&job_id).await? {
                Some(job) if !job.state.is_finished() => {
                    // Slow but alive; leave it to the worker.
                    continue;
                }
                _ => {}
            }

            zombies.push(ZombieRecord {
                project_id: project.id,
                step,
                job_id,
                minutes_processing: minutes,
            });
        }

        Ok((scanned, zombies))
    }

    /// Three-tier recovery, attempted in order: apply a recorded
    /// success, propagate a recorded failure, or mark failed with no
    /// trace. Leaving the step `processing` forever would block the
    /// pipeline, and guessing success risks silently losing work.
    pub async fn reconcile(&self, zombie: &ZombieRecord) -> Result<ReconcileTier> {
        if let Some(job) = self.queue.find_completed(&zombie.job_id).await? {
            if let Some(result) = job.result {
                match serde_json::from_value::<StepPayload>(result) {
                    Ok(payload) if payload.step_number() == zombie.step => {
                        self.machine
                            .mark_terminal(
                                zombie.project_id,
                                zombie.step,
                                StepOutcome::Completed(payload),
                            )
                            .await?;
                        self.log_repair(zombie, ReconcileTier::AppliedCompletedResult);
                        return Ok(ReconcileTier::AppliedCompletedResult);
                    }
                    _ => {
                        warn!(
                            project_id = %zombie.project_id,
                            job_id = %zombie.job_id,
                            "completed job carries unusable result; falling through"
                        );
                    }
                }
            }
        }

        if let Some(job) = self.queue.find_failed(&zombie.job_id).await? {
            let message = job
                .error
                .unwrap_or_else(|| "job failed without error detail".to_string());
            self.machine
                .mark_terminal(zombie.project_id, zombie.step, StepOutcome::Failed(message))
                .await?;
            self.log_repair(zombie, ReconcileTier::MarkedFailedFromQueue);
            return Ok(ReconcileTier::MarkedFailedFromQueue);
        }

        self.machine
            .mark_terminal(
                zombie.project_id,
                zombie.step,
                StepOutcome::Failed(
                    "background job disappeared from the queue; retry the step".to_string(),
                ),
            )
            .await?;
        self.log_repair(zombie, ReconcileTier::MarkedFailedNoTrace);
        Ok(ReconcileTier::MarkedFailedNoTrace)
    }

    fn log_repair(&self, zombie: &ZombieRecord, tier: ReconcileTier) {
        let project_id = zombie.project_id.to_string();
        let detail = format!("{} minutes in processing", zombie.minutes_processing);
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Monitor,
            ObservabilityEvent {
                event: "zombie_reconciled",
                component: "job_health_monitor",
                project_id: Some(&project_id),
                step: Some(zombie.step),
                job_id: Some(&zombie.job_id),
                provider_id: None,
                tier: Some(tier.as_str()),
                status: None,
                error_code: None,
                detail: Some(&detail),
            },
        );
    }

    /// Re-submit steps stuck in `queued` with no trace in the queue:
    /// the original submission was lost between the repository write
    /// and the queue accepting it. Resubmission reuses the same
    /// deterministic id at low priority, so it cannot duplicate live
    /// work or starve interactive submissions.
    pub async fn catch_up(&self) -> Result<Vec<Uuid>> {
        let projects = self.machine.store().list_queued().await?;
        let now = Utc::now();
        let mut resubmitted = Vec::new();

        for project in projects {
            if project.minutes_since_update(now) < self.config.stuck_threshold_minutes {
                continue;
            }
            let step = project.current_step;
            let Some(descriptor) = self.machine.catalog().get(step) else {
                warn!(project_id = %project.id, step, "queued step has no catalog entry");
                continue;
            };
            let job_id = derive_job_id(project.id, &descriptor.slug);
            if self.queue.get(&job_id).await?.is_some() {
                continue;
            }

            let request = project.steps.get(&step).and_then(|r| r.request.clone());
            let spec = JobSpec::for_catch_up(project.id, descriptor, request);
            match self.queue.submit(spec).await {
                Ok(_) => {
                    info!(
                        project_id = %project.id,
                        step,
                        job_id = %job_id,
                        "lost submission re-queued"
                    );
                    resubmitted.push(project.id);
                }
                Err(e) => {
                    warn!(
                        project_id = %project.id,
                        step,
                        error = %e,
                        "catch-up resubmission failed; will retry next sweep"
                    );
                }
            }
        }

        Ok(resubmitted)
    }

    /// One full pass: scan, then reconcile every candidate, then the
    /// catch-up pass over lost submissions. Safe to call on demand; a
    /// pass that finds another sweep in progress is a no-op.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        *self.phase.write().await = SweepPhase::Scanning;
        let result = self.sweep_inner().await;
        *self.phase.write().await = SweepPhase::Idle;
        result
    }

    async fn sweep_inner(&self) -> Result<SweepReport> {
        let (scanned, zombies) = self.scan().await?;

        *self.phase.write().await = SweepPhase::Reconciling;
        let mut report = SweepReport {
            scanned,
            candidates: zombies.len(),
            ..SweepReport::default()
        };

        for zombie in &zombies {
            match self.reconcile(zombie).await {
                Ok(tier) => report.reconciled.push((zombie.project_id, tier)),
                Err(e) => {
                    // One bad record must not halt repair for the rest.
                    error!(
                        project_id = %zombie.project_id,
                        step = zombie.step,
                        error = %e,
                        "reconciliation failed; will retry next sweep"
                    );
                    report.errors += 1;
                }
            }
        }

        match self.catch_up().await {
            Ok(resubmitted) => report.resubmitted = resubmitted,
            Err(e) => {
                error!(error = %e, "catch-up pass failed; will retry next sweep");
                report.errors += 1;
            }
        }

        Ok(report)
    }

    /// Recurring sweep on the configured interval until cancelled.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if !report.skipped => {
                    info!(
                        scanned = report.scanned,
                        candidates = report.candidates,
                        repaired = report.reconciled.len(),
                        resubmitted = report.resubmitted.len(),
                        errors = report.errors,
                        "health sweep finished"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "health sweep failed"),
            }
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(cancel).await })
    }
}

// ============================================================================
// Tests
// ============================================================================
