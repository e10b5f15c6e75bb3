//! `mdm status` – show status of all jobs.

use anyhow::{bail, Result};
use mdm_core::batch::BatchProgress;
use mdm_core::control::{ControlRequest, ControlResponse};
use mdm_core::job::{Job, Progress};
use mdm_core::store::{JobStore, SqliteJobStore};

use crate::cli::console::format_batch;
use crate::cli::control_socket;

pub async fn run_status() -> Result<()> {
    let (jobs, batches) = match control_socket::forward(ControlRequest::Status).await? {
        Some(ControlResponse::Status { jobs, batches }) => (jobs, batches),
        Some(ControlResponse::Error { message }) => bail!("{message}"),
        Some(other) => bail!("unexpected response from running instance: {other:?}"),
        // Read-only: the store is not touched without a running instance.
        None => (SqliteJobStore::open_default().await?.load().await?, Vec::new()),
    };
    print!("{}", render(&jobs, &batches));
    Ok(())
}

pub fn render(jobs: &[Job], batches: &[BatchProgress]) -> String {
    if jobs.is_empty() {
        return "No jobs.\n".to_string();
    }
    let mut out = format!(
        "{:<24} {:<12} {:<9} {:<12} {:<7} {}\n",
        "ID", "STATUS", "PROGRESS", "SPEED", "ETA", "SOURCE"
    );
    for j in jobs {
        let progress = match &j.progress {
            Progress::Percent(p) => format!("{p:.1}%"),
            Progress::Indeterminate(label) => label.clone(),
        };
        out.push_str(&format!(
            "{:<24} {:<12} {:<9} {:<12} {:<7} {}\n",
            j.id(),
            j.status.as_str(),
            progress,
            j.speed.as_deref().unwrap_or("-"),
            j.eta.as_deref().unwrap_or("-"),
            j.request.source
        ));
        if let Some(err) = &j.last_error {
            out.push_str(&format!("    error: {err}\n"));
        }
    }
    for b in batches {
        out.push_str(&format_batch(b));
        out.push('\n');
    }
    out
}
