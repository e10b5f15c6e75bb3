//! Terminal output for `mdm run`: per-job progress lines (throttled), outcome
//! lines and batch summaries.

use anyhow::Result;
use async_trait::async_trait;
use mdm_core::batch::{BatchEvent, BatchProgress};
use mdm_core::engine::EngineEvent;
use mdm_core::job::{JobStatus, Progress};
use mdm_core::services::Notifier;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Prints engine events to stdout.
#[derive(Default)]
pub struct ConsoleNotifier {
    last_print: Mutex<HashMap<String, Instant>>,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line for `event`, or `None` when it should not be printed now.
    fn line_for(&self, event: &EngineEvent, now: Instant) -> Option<String> {
        let mut last = self.last_print.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            EngineEvent::Progress {
                id,
                status: status @ (JobStatus::Downloading | JobStatus::Converting),
                progress,
                speed,
                eta,
                ..
            } => {
                let due = last
                    .get(id)
                    .map_or(true, |t| now.duration_since(*t) >= PROGRESS_INTERVAL);
                if !due {
                    return None;
                }
                last.insert(id.clone(), now);
                Some(format_progress(id, *status, progress, speed.as_deref(), eta.as_deref()))
            }
            EngineEvent::Progress { id, status, .. } => {
                Some(format!("  {id}: {}", status.as_str()))
            }
            EngineEvent::Completed { id, output_dir } => {
                last.remove(id);
                Some(format!("Completed {id} -> {}", output_dir.display()))
            }
            EngineEvent::Error {
                id,
                message,
                log_path,
            } => {
                last.remove(id);
                Some(match log_path {
                    Some(p) => format!("Failed {id}: {message} (log: {})", p.display()),
                    None => format!("Failed {id}: {message}"),
                })
            }
            EngineEvent::Removed { id } => {
                last.remove(id);
                Some(format!("Removed {id}"))
            }
        }
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, event: &EngineEvent) -> Result<()> {
        if let Some(line) = self.line_for(event, Instant::now()) {
            println!("{line}");
        }
        Ok(())
    }
}

pub fn format_progress(
    id: &str,
    status: JobStatus,
    progress: &Progress,
    speed: Option<&str>,
    eta: Option<&str>,
) -> String {
    let mut line = match progress {
        Progress::Percent(p) => format!("  {id}: {p:.1}%"),
        Progress::Indeterminate(label) => format!("  {id}: {label}"),
    };
    if status == JobStatus::Converting {
        line.push_str(" (converting)");
    }
    if let Some(speed) = speed {
        line.push_str(&format!("  {speed}"));
    }
    if let Some(eta) = eta {
        line.push_str(&format!("  ETA {eta}"));
    }
    line
}

pub fn format_batch(p: &BatchProgress) -> String {
    let name = p.title.as_deref().unwrap_or(&p.batch_id);
    format!(
        "Batch {name}: {}/{} done, {} failed, {} running",
        p.completed, p.total, p.failed, p.active
    )
}

pub fn spawn_batch_printer(mut events: broadcast::Receiver<BatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BatchEvent::Progress(p)) => println!("{}", format_batch(&p)),
                Ok(BatchEvent::Finished(p)) => {
                    let name = p.title.as_deref().unwrap_or(&p.batch_id);
                    println!(
                        "Batch {name} finished: {} completed, {} failed",
                        p.completed, p.failed
                    );
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}
