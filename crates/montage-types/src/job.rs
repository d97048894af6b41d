// Job Submission Types
// The contract handed to the external work queue

use crate::step::StepDescriptor;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Retry Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Backoff shape between retry attempts.
///
/// Stated as per-submission configuration owned by the job, not as
/// shared process-wide state, so the policy is testable in isolation
/// and safe across multiple process instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_delay_ms: u64 },
}

impl Backoff {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential { base_delay_ms } => {
                let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { base_delay_ms: 5_000 }
    }
}

/// Recognized submission options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: JobPriority,
    /// Max attempts, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Drop the queue's record once the job completes.
    pub remove_on_complete: bool,
    /// Drop the queue's record once the job fails. Kept by default so
    /// failures stay inspectable.
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            attempts: 3,
            backoff: Backoff::default(),
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

// ============================================================================
// Job Spec
// ============================================================================

/// Deterministic job identifier for a (project, step) pair.
///
/// Resubmission under the same identifier is idempotent, and the
/// identifier doubles as the join key the health monitor uses to
/// correlate repository state with queue state.
pub fn derive_job_id(project_id: Uuid, step_slug: &str) -> String {
    format!("{}:{}", project_id, step_slug)
}

/// A fully described job, ready for `JobQueue::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

impl JobSpec {
    /// Build the job for one pipeline step of one project.
    pub fn for_step(
        project_id: Uuid,
        descriptor: &StepDescriptor,
        request: Option<serde_json::Value>,
    ) -> Self {
        let payload = serde_json::json!({
            "project_id": project_id,
            "step": descriptor.number,
            "request": request,
        });

        Self {
            id: derive_job_id(project_id, &descriptor.slug),
            job_type: format!("generate_{}", descriptor.slug),
            payload,
            options: default_options_for(descriptor),
        }
    }

    /// Catch-up resubmission of a step whose original submission was
    /// lost. Same deterministic id, low priority: repair traffic must
    /// not starve interactive submissions.
    pub fn for_catch_up(
        project_id: Uuid,
        descriptor: &StepDescriptor,
        request: Option<serde_json::Value>,
    ) -> Self {
        let mut spec = Self::for_step(project_id, descriptor, request);
        spec.options.priority = JobPriority::Low;
        spec
    }
}

/// Per-step default submission options. Composition renders are the
/// expensive user-facing tail of the pipeline and jump the queue.
fn default_options_for(descriptor: &StepDescriptor) -> JobOptions {
    let priority = match descriptor.slug.as_str() {
        "composition" | "publish" => JobPriority::High,
        _ => JobPriority::Normal,
    };

    JobOptions {
        priority,
        ..JobOptions::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepCatalog;

    #[test]
    fn job_id_is_deterministic() {
        let project_id = Uuid::new_v4();
        let a = derive_job_id(project_id, "assets");
        let b = derive_job_id(project_id, "assets");
        assert_eq!(a, b);
        assert!(a.ends_with(":assets"));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::Exponential { base_delay_ms: 1_000 };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(8_000));
    }

    #[test]
    fn fixed_backoff_is_flat() {
        let backoff = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn for_step_builds_spec_with_step_payload() {
        let catalog = StepCatalog::standard();
        let project_id = Uuid::new_v4();
        let spec = JobSpec::for_step(
            project_id,
            catalog.get(3).unwrap(),
            Some(serde_json::json!({"shot_count": 4})),
        );

        assert_eq!(spec.id, derive_job_id(project_id, "assets"));
        assert_eq!(spec.job_type, "generate_assets");
        assert_eq!(spec.payload["step"], 3);
        assert_eq!(spec.payload["request"]["shot_count"], 4);
        assert_eq!(spec.options.priority, JobPriority::Normal);
    }

    #[test]
    fn catch_up_spec_keeps_the_id_but_drops_priority() {
        let catalog = StepCatalog::standard();
        let project_id = Uuid::new_v4();

        let original = JobSpec::for_step(project_id, catalog.get(4).unwrap(), None);
        let catch_up = JobSpec::for_catch_up(project_id, catalog.get(4).unwrap(), None);

        assert_eq!(catch_up.id, original.id);
        assert_eq!(catch_up.job_type, original.job_type);
        assert_eq!(catch_up.options.priority, JobPriority::Low);
    }

    #[test]
    fn composition_defaults_to_high_priority() {
        let catalog = StepCatalog::standard();
        let spec = JobSpec::for_step(Uuid::new_v4(), catalog.get(4).unwrap(), None);
        assert_eq!(spec.options.priority, JobPriority::High);
    }
}
