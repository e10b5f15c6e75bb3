//! Job record and status types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::request::JobRequest;

/// Job identifier (caller-supplied, unique for the engine's lifetime).
pub type JobId = String;

/// Job status. See the state machine in the engine module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Converting,
    Completed,
    Error,
    Paused,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Converting => "converting",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "downloading" => Some(JobStatus::Downloading),
            "converting" => Some(JobStatus::Converting),
            "completed" => Some(JobStatus::Completed),
            "error" => Some(JobStatus::Error),
            "paused" => Some(JobStatus::Paused),
            _ => None,
        }
    }

    /// A process is associated with the job (it occupies a slot).
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Downloading | JobStatus::Converting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known progress: a 0-100 percentage or a phase label when the
/// current phase has no measurable percentage (post-processing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Progress {
    Percent(f64),
    Indeterminate(String),
}

impl Progress {
    pub fn percent(&self) -> Option<f64> {
        match self {
            Progress::Percent(p) => Some(*p),
            Progress::Indeterminate(_) => None,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Progress::Percent(0.0)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Percent(p) => write!(f, "{p}"),
            Progress::Indeterminate(label) => f.write_str(label),
        }
    }
}

/// A job as owned by the engine: the immutable request plus mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub request: JobRequest,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Progress,
    /// Advisory display strings from the tool output.
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub eta: Option<String>,
    #[serde(default)]
    pub total_size: Option<String>,
    /// Classified, user-facing message; set only in `error` status.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Tool log kept for failed jobs.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Set once a process has been spawned for this job; partial artifacts may exist.
    #[serde(default)]
    pub has_run: bool,
    /// Unix seconds.
    pub created_at: i64,
}

impl Job {
    /// New pending job for a validated request.
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            status: JobStatus::Pending,
            progress: Progress::default(),
            speed: None,
            eta: None,
            total_size: None,
            last_error: None,
            log_path: None,
            has_run: false,
            created_at: unix_timestamp(),
        }
    }

    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub(crate) fn clear_transfer_stats(&mut self) {
        self.speed = None;
        self.eta = None;
    }
}

/// Current time as Unix seconds.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
