//! Control protocol for a running instance: one JSON request per line, one
//! JSON response per line.
//!
//! `mdm run` owns the engine and answers requests on a Unix socket; the other
//! subcommands send a request there when an instance is running.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::batch::{BatchCoordinator, BatchProgress, BatchRequest};
use crate::engine::EngineError;
use crate::job::{Job, JobId, JobRequest};
use crate::logging::state_dir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    Submit { request: JobRequest },
    SubmitBatch { request: BatchRequest },
    Pause { id: JobId },
    Resume { id: JobId },
    Cancel { id: JobId },
    Retry { id: JobId },
    /// Drop a finished job from history.
    Remove { id: JobId },
    ClearFinished,
    CancelBatch { batch_id: String },
    /// Forget a batch; its submitted jobs stay as plain jobs.
    RemoveBatch { batch_id: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Whether the request changed anything.
    Ack { changed: bool },
    Job { job: Job },
    Batch { progress: BatchProgress },
    Count { count: usize },
    Status {
        jobs: Vec<Job>,
        batches: Vec<BatchProgress>,
    },
    Error { message: String },
}

impl ControlResponse {
    fn from_error(e: EngineError) -> Self {
        ControlResponse::Error {
            message: e.to_string(),
        }
    }
}

pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Answer one request against the running engine and coordinator.
pub async fn handle(coordinator: &BatchCoordinator, request: ControlRequest) -> ControlResponse {
    let engine = coordinator.engine();
    tracing::debug!(?request, "control request");
    match request {
        ControlRequest::Submit { request } => match engine.submit(request).await {
            Ok(job) => ControlResponse::Job { job },
            Err(e) => ControlResponse::from_error(e),
        },
        ControlRequest::SubmitBatch { request } => match coordinator.submit_batch(request).await {
            Ok(progress) => ControlResponse::Batch { progress },
            Err(e) => ControlResponse::from_error(e),
        },
        ControlRequest::Pause { id } => ControlResponse::Ack {
            changed: engine.pause(&id).await,
        },
        ControlRequest::Resume { id } => ControlResponse::Ack {
            changed: engine.resume(&id).await,
        },
        ControlRequest::Cancel { id } => ControlResponse::Ack {
            changed: engine.cancel(&id).await,
        },
        ControlRequest::Retry { id } => ControlResponse::Ack {
            changed: engine.retry(&id).await,
        },
        ControlRequest::Remove { id } => ControlResponse::Ack {
            changed: engine.remove(&id).await,
        },
        ControlRequest::ClearFinished => ControlResponse::Count {
            count: engine.clear_finished().await,
        },
        ControlRequest::CancelBatch { batch_id } => {
            match coordinator.cancel_batch(&batch_id).await {
                Ok(count) => ControlResponse::Count { count },
                // Batches adopted by nobody still have linked jobs in the engine.
                Err(EngineError::UnknownBatch(_)) => ControlResponse::Count {
                    count: engine.cancel_batch(&batch_id).await,
                },
                Err(e) => ControlResponse::from_error(e),
            }
        }
        ControlRequest::RemoveBatch { batch_id } => ControlResponse::Ack {
            changed: coordinator.remove_batch(&batch_id).await,
        },
        ControlRequest::Status => ControlResponse::Status {
            jobs: engine.snapshot().await,
            batches: coordinator.batches().await,
        },
    }
}

/// Default path for the control socket (same XDG state dir as the job database).
pub fn default_control_socket_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("control.sock"))
}
