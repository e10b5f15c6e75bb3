//! `mdm batch <playlist-url | manifest.toml>` – queue a playlist.
//!
//! A URL is listed by the fetch tool first; a manifest is read as is. With a
//! running instance the batch is handed over; otherwise it runs in-process
//! until the queue drains.

use anyhow::{bail, Context, Result};
use mdm_core::batch::{
    analyze_playlist, is_playlist_url, BatchCoordinator, BatchOptions, BatchRequest,
};
use mdm_core::config::MdmConfig;
use mdm_core::control::{ControlRequest, ControlResponse};
use std::path::{Path, PathBuf};

use super::{collaborators, open_engine};
use super::run::serve;
use crate::cli::console::format_batch;
use crate::cli::control_socket;

pub fn load_manifest(path: &Path) -> Result<BatchRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read manifest {}", path.display()))?;
    let mut request: BatchRequest =
        toml::from_str(&text).with_context(|| format!("parse manifest {}", path.display()))?;
    // Relative output dirs are relative to the manifest.
    if request.output_dir.is_relative() {
        if let Some(parent) = path.parent() {
            request.output_dir = parent.join(&request.output_dir);
        }
    }
    Ok(request)
}

pub fn is_url(source: &str) -> bool {
    source.starts_with("https://") || source.starts_with("http://")
}

async fn load_request(cfg: &MdmConfig, source: &str, dir: Option<PathBuf>) -> Result<BatchRequest> {
    if !is_url(source) {
        let mut request = load_manifest(Path::new(source))?;
        if let Some(dir) = dir {
            request.output_dir = dir;
        }
        return Ok(request);
    }
    if !is_playlist_url(source) {
        bail!("{source} does not look like a playlist; use `mdm add` for a single download");
    }
    let dir = match dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    println!("Analyzing {source} ...");
    let request = analyze_playlist(&collaborators(cfg)?, source, dir).await?;
    println!(
        "Found {} video(s) in {}",
        request.members.len(),
        request.title.as_deref().unwrap_or(&request.id)
    );
    Ok(request)
}

pub async fn run_batch(cfg: &MdmConfig, source: &str, dir: Option<PathBuf>) -> Result<()> {
    let request = load_request(cfg, source, dir).await?;
    let batch_id = request.id.clone();
    match control_socket::forward(ControlRequest::SubmitBatch {
        request: request.clone(),
    })
    .await?
    {
        Some(ControlResponse::Batch { progress }) => {
            println!("Queued on running instance. {}", format_batch(&progress));
            Ok(())
        }
        Some(ControlResponse::Error { message }) => bail!("{message}"),
        Some(other) => bail!("unexpected response from running instance: {other:?}"),
        None => {
            let engine = open_engine(cfg, None).await?;
            let coordinator =
                BatchCoordinator::new(engine.clone(), BatchOptions::from_config(cfg)).await;
            let progress = coordinator.submit_batch(request).await?;
            println!("{}", format_batch(&progress));
            serve(&engine, &coordinator, cfg, false).await?;
            if let Some(p) = coordinator.progress(&batch_id).await {
                println!("{}", format_batch(&p));
            }
            Ok(())
        }
    }
}
