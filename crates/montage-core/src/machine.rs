// Step State Machine
// Owns per-project step transitions and cascading reset

use crate::store::{ProjectPatch, ProjectStore, StepExpectation};
use chrono::Utc;
use montage_types::{
    JobSpec, MontageError, Project, ProjectStatus, Result, StepCatalog, StepPayload, StepRecord,
    StepStatus,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal outcome reported by the worker-completion path.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed(StepPayload),
    Failed(String),
}

impl StepOutcome {
    fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Completed(_) => StepStatus::Completed,
            StepOutcome::Failed(_) => StepStatus::Failed,
        }
    }
}

// ============================================================================
// Step State Machine
// ============================================================================

/// Per-project pipeline driver. All mutation funnels through the
/// store's conditional update, so no in-process locks are needed: the
/// atomicity lives at the repository layer.
#[derive(Clone)]
pub struct StepStateMachine {
    store: Arc<dyn ProjectStore>,
    catalog: StepCatalog,
}

impl StepStateMachine {
    pub fn new(store: Arc<dyn ProjectStore>, catalog: StepCatalog) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    /// Queue `target_step` and return the job ready for submission.
    ///
    /// Every declared dependency must be `completed`, no step of the
    /// project may be `processing`, and the step itself must be in a
    /// queueable status (`unset`, `failed`, or already `queued` —
    /// re-queuing is safe because submission is idempotent).
    pub async fn advance_step(
        &self,
        project_id: Uuid,
        target_step: u32,
        request: Option<serde_json::Value>,
    ) -> Result<JobSpec> {
        let descriptor = self
            .catalog
            .get(target_step)
            .ok_or(MontageError::InvalidStep {
                step: target_step,
                max: self.catalog.len(),
            })?
            .clone();

        let project = self.store.get(project_id).await?;

        let missing: Vec<u32> = descriptor
            .depends_on
            .iter()
            .copied()
            .filter(|dep| project.step_status(*dep) != StepStatus::Completed)
            .collect();
        if !missing.is_empty() {
            return Err(MontageError::Precondition(format!(
                "step {} requires completed steps {:?}",
                target_step, missing
            )));
        }

        if let Some(in_flight) = project.processing_step() {
            return Err(MontageError::Conflict(format!(
                "step {} is processing; the pipeline is sequential per project",
                in_flight
            )));
        }

        let current = project.step_status(target_step);
        if !current.can_queue() {
            return Err(MontageError::Conflict(format!(
                "step {} is {} and cannot be queued",
                target_step,
                current.as_str()
            )));
        }

        let patch = ProjectPatch::default()
            .step(target_step, StepRecord::queued(request.clone()))
            .current_step(target_step);
        self.store
            .conditional_update(
                project_id,
                &[
                    StepExpectation::new(target_step, current),
                    // A worker may have claimed another step since the
                    // read above; the write re-checks.
                    StepExpectation::NoProcessing,
                ],
                patch,
            )
            .await?;

        info!(
            project_id = %project_id,
            step = target_step,
            slug = %descriptor.slug,
            "step queued"
        );

        Ok(JobSpec::for_step(project_id, &descriptor, request))
    }

    /// Cascading destructive reset: `from_step` and everything after it
    /// go back to `unset`, step-owned payloads are discarded, and the
    /// project points at `from_step` again. One atomic write; external
    /// binary assets are only unreferenced, never deleted here.
    pub async fn reset_from_step(&self, project_id: Uuid, from_step: u32) -> Result<Project> {
        if !self.catalog.contains(from_step) {
            return Err(MontageError::InvalidStep {
                step: from_step,
                max: self.catalog.len(),
            });
        }

        let mut patch = ProjectPatch::default()
            .current_step(from_step)
            .status(ProjectStatus::Active);
        patch.clear_completed_at = true;
        for number in self.catalog.numbers_from(from_step) {
            patch = patch.step(number, StepRecord::default());
        }

        let project = self.store.conditional_update(project_id, &[], patch).await?;

        info!(project_id = %project_id, from_step, "pipeline reset");
        Ok(project)
    }

    /// Apply a terminal status from the worker-completion path.
    ///
    /// Idempotent under at-least-once delivery: a repeat of the same
    /// terminal status is a no-op, including when two deliveries race
    /// the conditional update.
    pub async fn mark_terminal(
        &self,
        project_id: Uuid,
        step: u32,
        outcome: StepOutcome,
    ) -> Result<Project> {
        if !self.catalog.contains(step) {
            return Err(MontageError::InvalidStep {
                step,
                max: self.catalog.len(),
            });
        }
        if let StepOutcome::Completed(payload) = &outcome {
            if payload.step_number() != step {
                return Err(MontageError::Precondition(format!(
                    "result payload belongs to step {}, not step {}",
                    payload.step_number(),
                    step
                )));
            }
        }

        let project = self.store.get(project_id).await?;
        let current = project.step_status(step);

        if current == outcome.status() {
            // Duplicate completion signal; nothing to do.
            return Ok(project);
        }
        if !current.can_finish() {
            return Err(MontageError::Precondition(format!(
                "step {} is {} and cannot move to {}",
                step,
                current.as_str(),
                outcome.status().as_str()
            )));
        }

        let record = self.terminal_record(&project, step, &outcome);
        let mut patch = ProjectPatch::default().step(step, record);
        if matches!(outcome, StepOutcome::Completed(_)) && step == self.catalog.terminal_step() {
            patch = patch.status(ProjectStatus::Completed);
            patch.completed_at = Some(Utc::now());
        }

        match self
            .store
            .conditional_update(project_id, &[StepExpectation::new(step, current)], patch)
            .await
        {
            Ok(updated) => {
                info!(
                    project_id = %project_id,
                    step,
                    status = outcome.status().as_str(),
                    "step finished"
                );
                Ok(updated)
            }
            Err(MontageError::Conflict(_)) => {
                // Lost a race against another delivery of the same
                // signal; treat a matching terminal state as success.
                let latest = self.store.get(project_id).await?;
                if latest.step_status(step) == outcome.status() {
                    return Ok(latest);
                }
                warn!(project_id = %project_id, step, "terminal write lost a conflicting race");
                Err(MontageError::Conflict(format!(
                    "step {} changed concurrently",
                    step
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn terminal_record(&self, project: &Project, step: u32, outcome: &StepOutcome) -> StepRecord {
        let request = project.steps.get(&step).and_then(|r| r.request.clone());
        match outcome {
            StepOutcome::Completed(payload) => StepRecord {
                status: StepStatus::Completed,
                request,
                result: Some(payload.clone()),
                error_message: None,
            },
            StepOutcome::Failed(message) => StepRecord {
                status: StepStatus::Failed,
                request,
                result: None,
                error_message: Some(message.clone()),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
