// Pipeline Step Catalog
// Static, ordered description of the generation pipeline stages

use crate::error::{MontageError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// Step Status
// ============================================================================

/// Per-step status on a project.
///
/// Transitions: `unset -> queued -> processing -> {completed | failed}`,
/// plus `failed -> queued` for an explicit retry. There is no direct
/// `unset -> completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Unset,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    /// Whether a step in this status may be (re-)queued.
    ///
    /// `queued` is included: re-queuing an already-queued step is safe
    /// because job submission is idempotent per derived job id.
    pub fn can_queue(self) -> bool {
        matches!(self, StepStatus::Unset | StepStatus::Queued | StepStatus::Failed)
    }

    /// Whether a terminal status may be applied from this status.
    pub fn can_finish(self) -> bool {
        matches!(self, StepStatus::Queued | StepStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Unset => "unset",
            StepStatus::Queued => "queued",
            StepStatus::Processing => "processing",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }
}

// ============================================================================
// Step Descriptor / Catalog
// ============================================================================

/// One stage of the pipeline, defined at process start and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// 1-based step number; catalog numbering is dense.
    pub number: u32,
    /// Stable identifier used in derived job ids (e.g. "assets").
    pub slug: String,
    /// Human label for logs and UI surfaces.
    pub label: String,
    /// Step numbers that must be `completed` before this step may queue.
    pub depends_on: Vec<u32>,
}

/// Ordered catalog of pipeline steps.
#[derive(Debug, Clone)]
pub struct StepCatalog {
    steps: Vec<StepDescriptor>,
}

impl StepCatalog {
    /// Build a catalog, validating structure up front.
    ///
    /// The pipeline is strictly sequential per project, so a step may
    /// only depend on earlier steps; forward or self dependencies could
    /// never be satisfied.
    pub fn new(steps: Vec<StepDescriptor>) -> Result<Self> {
        if steps.is_empty() {
            return Err(MontageError::InvalidCatalog("catalog is empty".to_string()));
        }

        let mut slugs = HashSet::new();
        for (idx, step) in steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.number != expected {
                return Err(MontageError::InvalidCatalog(format!(
                    "step numbering must be dense: found {} where {} was expected",
                    step.number, expected
                )));
            }
            if step.slug.is_empty() {
                return Err(MontageError::InvalidCatalog(format!(
                    "step {} has an empty slug",
                    step.number
                )));
            }
            if !slugs.insert(step.slug.clone()) {
                return Err(MontageError::InvalidCatalog(format!(
                    "duplicate step slug '{}'",
                    step.slug
                )));
            }
            for dep in &step.depends_on {
                if *dep == 0 || *dep >= step.number {
                    return Err(MontageError::InvalidCatalog(format!(
                        "step {} depends on step {}, which is not an earlier step",
                        step.number, dep
                    )));
                }
            }
        }

        Ok(Self { steps })
    }

    /// The standard five-stage creative-generation pipeline.
    pub fn standard() -> Self {
        let steps = vec![
            StepDescriptor {
                number: 1,
                slug: "analysis".to_string(),
                label: "Brief analysis".to_string(),
                depends_on: vec![],
            },
            StepDescriptor {
                number: 2,
                slug: "configuration".to_string(),
                label: "Scene configuration".to_string(),
                depends_on: vec![1],
            },
            StepDescriptor {
                number: 3,
                slug: "assets".to_string(),
                label: "Asset generation".to_string(),
                depends_on: vec![2],
            },
            StepDescriptor {
                number: 4,
                slug: "composition".to_string(),
                label: "Composition".to_string(),
                depends_on: vec![3],
            },
            StepDescriptor {
                number: 5,
                slug: "publish".to_string(),
                label: "Publish".to_string(),
                depends_on: vec![4],
            },
        ];

        Self::new(steps).expect("standard catalog is valid")
    }

    pub fn get(&self, number: u32) -> Option<&StepDescriptor> {
        if number == 0 {
            return None;
        }
        self.steps.get(number as usize - 1)
    }

    pub fn len(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The pipeline's final step number.
    pub fn terminal_step(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn contains(&self, number: u32) -> bool {
        number >= 1 && number <= self.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps.iter()
    }

    /// Step numbers `from..=terminal`, in order. Used by cascading reset.
    pub fn numbers_from(&self, from: u32) -> std::ops::RangeInclusive<u32> {
        from.max(1)..=self.terminal_step()
    }
}

// ============================================================================
// Tests
// ============================================================================
