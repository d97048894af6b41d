// Montage Shared Types
// Domain types for the multi-stage generation pipeline

mod error;
mod job;
mod project;
mod step;

pub use error::{MontageError, Result};
pub use job::{derive_job_id, Backoff, JobOptions, JobPriority, JobSpec};
pub use project::{Project, ProjectStatus, ShotAsset, StepPayload, StepRecord};
pub use step::{StepCatalog, StepDescriptor, StepStatus};
