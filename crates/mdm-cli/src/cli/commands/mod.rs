//! CLI command handlers, one file per command.
//!
//! Every command except `run` first tries the control socket of a running
//! instance; without one it opens the engine and batch coordinator on the job
//! store directly (never started, so nothing is spawned).

mod add;
mod batch;
mod cancel_batch;
mod clear;
mod job_action;
mod remove_batch;
mod run;
mod status;

pub use add::{run_add, AddOptions};
pub use batch::run_batch;
pub use cancel_batch::run_cancel_batch;
pub use clear::run_clear;
pub use job_action::{run_job_action, JobAction};
pub use remove_batch::run_remove_batch;
pub use run::run_engine;
pub use status::run_status;

#[cfg(test)]
pub use add::build_request;
#[cfg(test)]
pub use batch::{is_url, load_manifest};
#[cfg(test)]
pub use status::render;

use anyhow::{bail, Result};
use mdm_core::batch::{BatchCoordinator, BatchOptions};
use mdm_core::config::MdmConfig;
use mdm_core::control::{self, ControlRequest, ControlResponse};
use mdm_core::engine::{Engine, EngineOptions};
use mdm_core::services::{BrowserCookieHint, Collaborators, FileLogSink, SearchPathResolver};
use mdm_core::store::SqliteJobStore;
use std::sync::Arc;

use crate::cli::control_socket;

/// Production collaborators: tools from the configured bin dir and `PATH`,
/// file logs, browser cookies on demand.
pub(crate) fn collaborators(cfg: &MdmConfig) -> Result<Collaborators> {
    Ok(Collaborators {
        resolver: Arc::new(SearchPathResolver::from_config(&cfg.tools)),
        log_sink: Arc::new(FileLogSink::open_default()?),
        cookies: Arc::new(BrowserCookieHint::new(&cfg.cookies)),
    })
}

/// Engine over the default job store with the production collaborators.
pub(crate) async fn open_engine(cfg: &MdmConfig, jobs: Option<usize>) -> Result<Engine> {
    let store = SqliteJobStore::open_default().await?;
    let services = collaborators(cfg)?;
    let mut options = EngineOptions::from_config(cfg);
    if let Some(n) = jobs {
        options.max_concurrent = n.max(1);
    }
    Ok(Engine::open(Arc::new(store), services, options).await?)
}

/// Send `request` to a running instance, or answer it here against the store.
pub(crate) async fn dispatch(cfg: &MdmConfig, request: ControlRequest) -> Result<ControlResponse> {
    if let Some(response) = control_socket::forward(request.clone()).await? {
        return Ok(response);
    }
    let engine = open_engine(cfg, None).await?;
    let coordinator = BatchCoordinator::new(engine, BatchOptions::from_config(cfg)).await;
    Ok(control::handle(&coordinator, request).await)
}

/// Unwrap an `Ack`; an `Error` response becomes the command's error.
pub(crate) fn expect_ack(response: ControlResponse) -> Result<bool> {
    match response {
        ControlResponse::Ack { changed } => Ok(changed),
        ControlResponse::Error { message } => bail!("{message}"),
        other => bail!("unexpected response: {other:?}"),
    }
}

pub(crate) fn expect_count(response: ControlResponse) -> Result<usize> {
    match response {
        ControlResponse::Count { count } => Ok(count),
        ControlResponse::Error { message } => bail!("{message}"),
        other => bail!("unexpected response: {other:?}"),
    }
}
