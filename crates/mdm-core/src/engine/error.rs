use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A job with this id already exists; resubmission is rejected.
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown batch {0}")]
    UnknownBatch(String),
    #[error("job store: {0:#}")]
    Store(#[source] anyhow::Error),
}
