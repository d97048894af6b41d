// Project Model
// The unit of work driven through the pipeline

use crate::step::{StepCatalog, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Step Payload
// ============================================================================

/// One generated shot within the asset step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotAsset {
    pub index: u32,
    pub url: String,
}

/// Step-owned result fields, keyed by step.
///
/// The state machine only touches the common envelope (status,
/// timestamps, error message); result typing stays with the step that
/// writes it, so no step ever sees another step's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepPayload {
    Analysis {
        summary: String,
        scene_count: u32,
    },
    Configuration {
        style: String,
        settings: serde_json::Value,
    },
    Assets {
        shots: Vec<ShotAsset>,
    },
    Composition {
        output_url: String,
        duration_secs: f64,
    },
    Publish {
        published_url: String,
    },
}

impl StepPayload {
    /// The step number this payload belongs to in the standard catalog.
    pub fn step_number(&self) -> u32 {
        match self {
            StepPayload::Analysis { .. } => 1,
            StepPayload::Configuration { .. } => 2,
            StepPayload::Assets { .. } => 3,
            StepPayload::Composition { .. } => 4,
            StepPayload::Publish { .. } => 5,
        }
    }
}

// ============================================================================
// Project
// ============================================================================

/// Project-level status. Steps carry their own per-step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Active,
    Completed,
}

/// Per-step state on a project: the common envelope plus the
/// step-owned request and result payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    /// Request payload persisted at queue time (opaque to the machine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
    /// Result payload written by the worker-completion path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StepRecord {
    pub fn queued(request: Option<serde_json::Value>) -> Self {
        Self {
            status: StepStatus::Queued,
            request,
            result: None,
            error_message: None,
        }
    }
}

/// The unit of work. Created externally when a project is initiated;
/// mutated only through the state machine's conditional updates and by
/// workers writing terminal step state via the same repository primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: ProjectStatus,
    /// 1..=N; the step the pipeline is currently pointed at.
    pub current_step: u32,
    pub steps: BTreeMap<u32, StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(id: Uuid, owner_id: Uuid, catalog: &StepCatalog) -> Self {
        let now = Utc::now();
        let steps = catalog
            .iter()
            .map(|d| (d.number, StepRecord::default()))
            .collect();

        Self {
            id,
            owner_id,
            status: ProjectStatus::Active,
            current_step: 1,
            steps,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn step_status(&self, number: u32) -> StepStatus {
        self.steps
            .get(&number)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Unset)
    }

    /// The step currently marked `processing`, if any. The pipeline is
    /// strictly sequential per project, so there is at most one.
    pub fn processing_step(&self) -> Option<u32> {
        self.steps
            .iter()
            .find(|(_, r)| r.status == StepStatus::Processing)
            .map(|(n, _)| *n)
    }

    /// Whole minutes since the last repository write.
    pub fn minutes_since_update(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_minutes()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_project_starts_unset() {
        let catalog = StepCatalog::standard();
        let project = Project::new(Uuid::new_v4(), Uuid::new_v4(), &catalog);

        assert_eq!(project.current_step, 1);
        assert_eq!(project.status, ProjectStatus::Active);
        assert_eq!(project.steps.len(), 5);
        assert!(project.processing_step().is_none());
        for n in 1..=5 {
            assert_eq!(project.step_status(n), StepStatus::Unset);
        }
    }

    #[test]
    fn step_payload_round_trips_with_tag() {
        let payload = StepPayload::Assets {
            shots: vec![ShotAsset {
                index: 0,
                url: "https://cdn.example.com/shot-0.mp4".to_string(),
            }],
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["step"], "assets");

        let back: StepPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.step_number(), 3);
    }

    #[test]
    fn processing_step_finds_single_in_flight_step() {
        let catalog = StepCatalog::standard();
        let mut project = Project::new(Uuid::new_v4(), Uuid::new_v4(), &catalog);
        project.steps.get_mut(&2).unwrap().status = StepStatus::Processing;

        assert_eq!(project.processing_step(), Some(2));
    }
}
