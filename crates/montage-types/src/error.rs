// Montage Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MontageError {
    /// A declared step dependency is not completed yet.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The step is already in flight; the caller should wait or refresh.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid step {step}: pipeline has steps 1..={max}")]
    InvalidStep { step: u32, max: u32 },

    #[error("invalid step catalog: {0}")]
    InvalidCatalog(String),

    /// The queue transport rejected a submission. Retryable by the
    /// caller with backoff; the step transition already persisted
    /// stays in place.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Security rejection. Never retried, never followed.
    #[error("unsafe url: {0}")]
    UnsafeUrl(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("all {attempts} provider attempts failed, last error: {last_error}")]
    AllProvidersFailed { attempts: usize, last_error: String },

    #[error("repository error: {0}")]
    Repository(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MontageError>;
