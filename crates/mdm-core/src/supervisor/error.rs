use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::classify::FailureKind;

/// The tool could not be started for a job. Treated like a failed run.
#[derive(Debug, Error)]
pub enum LaunchFailure {
    #[error("required tool '{0}' was not found")]
    ToolNotFound(String),
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LaunchFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            LaunchFailure::OutputDirectory { .. } => FailureKind::FilePermission,
            LaunchFailure::Spawn { source, .. }
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                FailureKind::FilePermission
            }
            _ => FailureKind::Unknown,
        }
    }

    /// Short message stored on the job.
    pub fn user_message(&self) -> String {
        match self {
            LaunchFailure::ToolNotFound(tool) => {
                format!("Required tool '{tool}' is not installed or not on PATH")
            }
            LaunchFailure::OutputDirectory { .. } => self.kind().message().to_string(),
            LaunchFailure::Spawn { program, .. } => format!("Could not start {program}"),
        }
    }
}
