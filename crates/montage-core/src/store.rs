// Project Repository Seam
// Optimistic-concurrency primitive the state machine is built on

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use montage_types::{MontageError, Project, ProjectStatus, Result, StepRecord, StepStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

// ============================================================================
// Patch / Expectation
// ============================================================================

/// Compare half of the compare-and-swap: what the caller read and
/// expects to still hold when the write lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepExpectation {
    /// The step must still hold this status.
    Status { step: u32, status: StepStatus },
    /// No step of the project may be `processing`. Guards the window
    /// between a caller's read and its write against a worker claiming
    /// some other step in the meantime.
    NoProcessing,
}

impl StepExpectation {
    pub fn new(step: u32, status: StepStatus) -> Self {
        Self::Status { step, status }
    }
}

/// Swap half: everything a single atomic update may change. All listed
/// steps change together or none do, so a cascading reset can never
/// half-apply.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub current_step: Option<u32>,
    pub status: Option<ProjectStatus>,
    /// Full replacement per listed step.
    pub steps: Vec<(u32, StepRecord)>,
    pub completed_at: Option<DateTime<Utc>>,
    pub clear_completed_at: bool,
}

impl ProjectPatch {
    pub fn step(mut self, number: u32, record: StepRecord) -> Self {
        self.steps.push((number, record));
        self
    }

    pub fn current_step(mut self, step: u32) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn status(mut self, status: ProjectStatus) -> Self {
        self.status = Some(status);
        self
    }
}

// ============================================================================
// Project Store
// ============================================================================

/// Repository seam. Implementations are external (the system of record
/// lives behind this trait); [`MemoryProjectStore`] is the in-process
/// reference used by tests and local development.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Project>;

    /// Apply `patch` iff every expectation still holds, bumping
    /// `updated_at`. Returns the updated project, or
    /// [`MontageError::Conflict`] when an expectation fails.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &[StepExpectation],
        patch: ProjectPatch,
    ) -> Result<Project>;

    /// Projects whose current step is `processing`. Used by the health
    /// monitor's scan.
    async fn list_processing(&self) -> Result<Vec<Project>>;

    /// Projects whose current step is `queued`. Used by the health
    /// monitor's catch-up pass.
    async fn list_queued(&self) -> Result<Vec<Project>>;
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory reference implementation of [`ProjectStore`].
#[derive(Clone, Default)]
pub struct MemoryProjectStore {
    inner: Arc<RwLock<HashMap<Uuid, Project>>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, project: Project) {
        self.inner.write().await.insert(project.id, project);
    }

    /// Shift a project's `updated_at` into the past. Test hook for
    /// exercising the health monitor's stuck-threshold.
    pub async fn backdate(&self, id: Uuid, minutes: i64) {
        if let Some(project) = self.inner.write().await.get_mut(&id) {
            project.updated_at = Utc::now() - Duration::minutes(minutes);
        }
    }
}

fn apply_patch(project: &mut Project, patch: ProjectPatch) {
    for (number, record) in patch.steps {
        project.steps.insert(number, record);
    }
    if let Some(step) = patch.current_step {
        project.current_step = step;
    }
    if let Some(status) = patch.status {
        project.status = status;
    }
    if let Some(at) = patch.completed_at {
        project.completed_at = Some(at);
    }
    if patch.clear_completed_at {
        project.completed_at = None;
    }
    project.updated_at = Utc::now();
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn get(&self, id: Uuid) -> Result<Project> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MontageError::NotFound(format!("project {id}")))
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: &[StepExpectation],
        patch: ProjectPatch,
    ) -> Result<Project> {
        let mut guard = self.inner.write().await;
        let project = guard
            .get_mut(&id)
            .ok_or_else(|| MontageError::NotFound(format!("project {id}")))?;

        for expectation in expected {
            match expectation {
                StepExpectation::Status { step, status } => {
                    let actual = project.step_status(*step);
                    if actual != *status {
                        return Err(MontageError::Conflict(format!(
                            "step {} is {}, expected {}",
                            step,
                            actual.as_str(),
                            status.as_str()
                        )));
                    }
                }
                StepExpectation::NoProcessing => {
                    if let Some(step) = project.processing_step() {
                        return Err(MontageError::Conflict(format!(
                            "step {step} became processing"
                        )));
                    }
                }
            }
        }

        apply_patch(project, patch);
        Ok(project.clone())
    }

    async fn list_processing(&self) -> Result<Vec<Project>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|p| p.processing_step().is_some())
            .cloned()
            .collect())
    }

    async fn list_queued(&self) -> Result<Vec<Project>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|p| p.step_status(p.current_step) == StepStatus::Queued)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use montage_types::StepCatalog;

    async fn seeded_store() -> (MemoryProjectStore, Uuid) {
        let store = MemoryProjectStore::new();
        let project = Project::new(Uuid::new_v4(), Uuid::new_v4(), &StepCatalog::standard());
        let id = project.id;
        store.insert(project).await;
        (store, id)
    }

    #[tokio::test]
    async fn conditional_update_applies_when_expectation_holds() {
        let (store, id) = seeded_store().await;

        let patch = ProjectPatch::default()
            .step(1, StepRecord::queued(None))
            .current_step(1);
        let updated = store
            .conditional_update(id, &[StepExpectation::new(1, StepStatus::Unset)], patch)
            .await
            .unwrap();

        assert_eq!(updated.step_status(1), StepStatus::Queued);
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_expectation() {
        let (store, id) = seeded_store().await;

        let patch = ProjectPatch::default().step(1, StepRecord::queued(None));
        store
            .conditional_update(id, &[StepExpectation::new(1, StepStatus::Unset)], patch)
            .await
            .unwrap();

        // Same expectation again: the first writer already moved it.
        let stale = ProjectPatch::default().step(1, StepRecord::queued(None));
        let err = store
            .conditional_update(id, &[StepExpectation::new(1, StepStatus::Unset)], stale)
            .await
            .unwrap_err();
        assert!(matches!(err, MontageError::Conflict(_)));
    }

    #[tokio::test]
    async fn racing_claims_have_one_winner() {
        let (store, id) = seeded_store().await;

        let patch = ProjectPatch::default().step(1, StepRecord::queued(None));
        store.conditional_update(id, &[], patch).await.unwrap();

        // Two workers race queued -> processing; the CAS admits one.
        let mut winners = 0;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let claim = ProjectPatch::default().step(
                    1,
                    StepRecord {
                        status: StepStatus::Processing,
                        ..StepRecord::default()
                    },
                );
                store
                    .conditional_update(id, &[StepExpectation::new(1, StepStatus::Queued)], claim)
                    .await
            }));
        }
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn no_processing_expectation_rejects_foreign_in_flight_step() {
        let (store, id) = seeded_store().await;

        // Some other step gets claimed between a caller's read and
        // its write.
        let claim = ProjectPatch::default().step(
            1,
            StepRecord {
                status: StepStatus::Processing,
                ..StepRecord::default()
            },
        );
        store.conditional_update(id, &[], claim).await.unwrap();

        let queue_two = ProjectPatch::default().step(2, StepRecord::queued(None));
        let err = store
            .conditional_update(
                id,
                &[
                    StepExpectation::new(2, StepStatus::Unset),
                    StepExpectation::NoProcessing,
                ],
                queue_two,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MontageError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_queued_filters_by_current_step() {
        let (store, id) = seeded_store().await;
        assert!(store.list_queued().await.unwrap().is_empty());

        let patch = ProjectPatch::default()
            .step(1, StepRecord::queued(None))
            .current_step(1);
        store.conditional_update(id, &[], patch).await.unwrap();

        let queued = store.list_queued().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
    }

    #[tokio::test]
    async fn get_unknown_project_is_not_found() {
        let store = MemoryProjectStore::new();
        let err = store.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MontageError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_processing_filters_by_step_status() {
        let (store, id) = seeded_store().await;
        assert!(store.list_processing().await.unwrap().is_empty());

        let patch = ProjectPatch::default().step(
            2,
            StepRecord {
                status: StepStatus::Processing,
                ..StepRecord::default()
            },
        );
        store.conditional_update(id, &[], patch).await.unwrap();

        let processing = store.list_processing().await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, id);
    }
}
