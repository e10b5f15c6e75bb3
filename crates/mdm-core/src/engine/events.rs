use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::{Job, JobId, JobStatus, Progress};

/// Lifecycle event fanned out to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Progress or a non-terminal status change (pending, paused,
    /// downloading, converting).
    Progress {
        id: JobId,
        status: JobStatus,
        progress: Progress,
        #[serde(default)]
        speed: Option<String>,
        #[serde(default)]
        eta: Option<String>,
        #[serde(default)]
        total_size: Option<String>,
    },
    Completed {
        id: JobId,
        output_dir: PathBuf,
    },
    Error {
        id: JobId,
        message: String,
        #[serde(default)]
        log_path: Option<PathBuf>,
    },
    Removed {
        id: JobId,
    },
}

impl EngineEvent {
    pub fn job_id(&self) -> &str {
        match self {
            EngineEvent::Progress { id, .. }
            | EngineEvent::Completed { id, .. }
            | EngineEvent::Error { id, .. }
            | EngineEvent::Removed { id } => id,
        }
    }

    pub(crate) fn progress_of(job: &Job) -> Self {
        EngineEvent::Progress {
            id: job.request.id.clone(),
            status: job.status,
            progress: job.progress.clone(),
            speed: job.speed.clone(),
            eta: job.eta.clone(),
            total_size: job.total_size.clone(),
        }
    }
}

/// How a job left the engine's care, as seen by `wait_for_terminal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Removed,
}
