//! `mdm run` – run the engine to process queued jobs.

use anyhow::{bail, Result};
use mdm_core::batch::{BatchCoordinator, BatchOptions};
use mdm_core::config::MdmConfig;
use mdm_core::control::{default_control_socket_path, ControlRequest};
use mdm_core::engine::Engine;
use mdm_core::job::JobStatus;
use mdm_core::services::{clean_old_logs, spawn_notifier, FileLogSink};
use std::sync::Arc;
use std::time::Duration;

use super::open_engine;
use crate::cli::console::{spawn_batch_printer, ConsoleNotifier};
use crate::cli::control_socket;

const IDLE_POLL: Duration = Duration::from_millis(500);

pub async fn run_engine(cfg: &MdmConfig, jobs: Option<usize>, watch: bool) -> Result<()> {
    let socket_path = default_control_socket_path()?;
    if control_socket::send(&socket_path, &ControlRequest::Status)
        .await
        .ok()
        .flatten()
        .is_some()
    {
        bail!("another `mdm run` is already active ({})", socket_path.display());
    }

    match FileLogSink::open_default().map(|sink| clean_old_logs(sink.dir(), &cfg.logs)) {
        Ok(Ok(n)) if n > 0 => tracing::info!("removed {} old tool log(s)", n),
        Ok(Err(e)) | Err(e) => tracing::warn!("log cleanup skipped: {:#}", e),
        _ => {}
    }

    let engine = open_engine(cfg, jobs).await?;
    let coordinator = BatchCoordinator::new(engine.clone(), BatchOptions::from_config(cfg)).await;
    serve(&engine, &coordinator, cfg, watch).await
}

/// Start the engine, answer control requests and print progress until the
/// queue drains (or Ctrl-C, or forever with `watch`). Active jobs are paused
/// on the way out so the next run picks them up.
pub(super) async fn serve(
    engine: &Engine,
    coordinator: &BatchCoordinator,
    cfg: &MdmConfig,
    watch: bool,
) -> Result<()> {
    let socket_path = default_control_socket_path()?;
    let listener = match control_socket::spawn_control_listener(coordinator.clone(), &socket_path)
    {
        Ok(handle) => {
            tracing::debug!(path = %socket_path.display(), "control socket listening");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!("control socket unavailable: {:#}", e);
            None
        }
    };
    let notifier = spawn_notifier(engine.subscribe(), Arc::new(ConsoleNotifier::new()));
    let batches = spawn_batch_printer(coordinator.subscribe());

    engine.start().await;
    tracing::info!(
        limit = engine.limit(),
        gate = ?cfg.batch_concurrency,
        watch,
        "engine running"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(IDLE_POLL);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Interrupted; pausing active jobs.");
                break;
            }
            _ = tick.tick() => {
                if !watch && engine.outstanding().await == 0 && coordinator.waiting().await == 0 {
                    break;
                }
            }
        }
    }

    let paused = engine.shutdown().await;
    if let Some(handle) = listener {
        handle.abort();
        let _ = std::fs::remove_file(&socket_path);
    }
    // Let the printers drain what the shutdown emitted.
    tokio::time::sleep(Duration::from_millis(50)).await;
    notifier.abort();
    batches.abort();

    let jobs = engine.snapshot().await;
    let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
    let failed = jobs.iter().filter(|j| j.status == JobStatus::Error).count();
    if jobs.is_empty() {
        println!("No queued jobs.");
    } else {
        println!("{completed} completed, {failed} failed, {paused} paused for next run");
    }
    tracing::info!(completed, failed, paused, "run finished");
    Ok(())
}
