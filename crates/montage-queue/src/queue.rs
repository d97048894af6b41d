// Job Queue Contract
// At-least-once queue seam with idempotent submission

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use montage_types::{JobOptions, JobSpec, MontageError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

// ============================================================================
// Queue Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// A job as the queue sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Job Queue Seam
// ============================================================================

/// Contract consumed by this core; the queue product behind it is
/// external and delivers at least once.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job. Submitting an identifier that already names an
    /// unfinished job is a no-op returning the existing identifier, so
    /// periodic catch-up sweeps can re-queue without duplicating work.
    /// Surfaces [`MontageError::QueueUnavailable`] when the transport
    /// rejects the submission; callers treat that as retryable.
    async fn submit(&self, spec: JobSpec) -> Result<String>;

    /// Look up a job in any state.
    async fn get(&self, id: &str) -> Result<Option<QueuedJob>>;

    async fn list_completed(&self) -> Result<Vec<QueuedJob>>;

    async fn list_failed(&self) -> Result<Vec<QueuedJob>>;

    /// Ordered lookup helpers over the terminal sets; each strategy is
    /// independently testable rather than an inline fallback branch.
    async fn find_completed(&self, id: &str) -> Result<Option<QueuedJob>> {
        Ok(self.list_completed().await?.into_iter().find(|j| j.id == id))
    }

    async fn find_failed(&self, id: &str) -> Result<Option<QueuedJob>> {
        Ok(self.list_failed().await?.into_iter().find(|j| j.id == id))
    }
}

// ============================================================================
// Memory Queue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    active: HashMap<String, QueuedJob>,
    completed: HashMap<String, QueuedJob>,
    failed: HashMap<String, QueuedJob>,
}

/// In-memory reference implementation of [`JobQueue`], used by tests
/// and local development. Terminal-set retention honors the job's
/// remove_on_complete / remove_on_fail disposition flags.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    inner: Arc<RwLock<QueueInner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a transport outage. Test hook.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Worker picked the job up.
    pub async fn start(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(job) = inner.active.get_mut(id) {
            job.state = JobState::Active;
            job.attempts_made += 1;
            return true;
        }
        false
    }

    /// Worker finished successfully. The record moves to the completed
    /// set unless the job asked to be removed on completion.
    pub async fn complete(&self, id: &str, result: serde_json::Value) -> bool {
        let mut inner = self.inner.write().await;
        let Some(mut job) = inner.active.remove(id) else {
            return false;
        };
        job.state = JobState::Completed;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());
        if !job.options.remove_on_complete {
            inner.completed.insert(id.to_string(), job);
        }
        true
    }

    /// Worker gave up after exhausting its attempts.
    pub async fn fail(&self, id: &str, error: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(mut job) = inner.active.remove(id) else {
            return false;
        };
        job.state = JobState::Failed;
        job.error = Some(error.to_string());
        job.finished_at = Some(Utc::now());
        if !job.options.remove_on_fail {
            inner.failed.insert(id.to_string(), job);
        }
        true
    }

    /// Drop a job without a trace, as a crashed or evicted job would.
    pub async fn evict(&self, id: &str) -> bool {
        self.inner.write().await.active.remove(id).is_some()
    }

    pub async fn active_len(&self) -> usize {
        self.inner.read().await.active.len()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, spec: JobSpec) -> Result<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MontageError::QueueUnavailable(
                "queue transport refused the submission".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.active.get(&spec.id) {
            // Idempotent re-queue: an unfinished job under this id
            // already exists.
            return Ok(existing.id.clone());
        }

        let id = spec.id.clone();
        inner.active.insert(
            id.clone(),
            QueuedJob {
                id: id.clone(),
                job_type: spec.job_type,
                payload: spec.payload,
                options: spec.options,
                state: JobState::Waiting,
                attempts_made: 0,
                result: None,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedJob>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active
            .get(id)
            .or_else(|| inner.completed.get(id))
            .or_else(|| inner.failed.get(id))
            .cloned())
    }

    async fn list_completed(&self) -> Result<Vec<QueuedJob>> {
        Ok(self.inner.read().await.completed.values().cloned().collect())
    }

    async fn list_failed(&self) -> Result<Vec<QueuedJob>> {
        Ok(self.inner.read().await.failed.values().cloned().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
