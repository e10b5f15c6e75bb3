//! `mdm add <source>` – queue a single download.

use anyhow::{bail, Result};
use mdm_core::batch::{media_title, sanitize_title};
use mdm_core::config::MdmConfig;
use mdm_core::control::{ControlRequest, ControlResponse};
use mdm_core::job::{JobKind, JobRequest, MediaSelector};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{collaborators, open_engine};
use crate::cli::control_socket;

#[derive(Debug, Clone)]
pub struct AddOptions {
    pub dir: PathBuf,
    pub name: Option<String>,
    pub id: Option<String>,
    pub audio: bool,
    pub quality: Option<String>,
    pub remux: bool,
    /// Ask the fetch tool for the media title when no name is given.
    pub lookup_title: bool,
}

pub fn build_request(source: &str, opts: AddOptions) -> JobRequest {
    let kind = if opts.remux {
        JobKind::StreamRemux
    } else {
        JobKind::infer(source)
    };
    let media = if opts.audio {
        MediaSelector::audio(opts.quality)
    } else {
        MediaSelector::video(opts.quality)
    };
    let base_name = opts
        .name
        .map(|n| sanitize_title(&n))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| name_from_source(source));
    JobRequest {
        id: opts.id.unwrap_or_else(generated_id),
        source: source.to_string(),
        output_dir: opts.dir,
        base_name,
        kind,
        media,
        batch: None,
    }
}

/// `v=` query value for watch pages, else the last path segment without its
/// extension.
fn name_from_source(source: &str) -> String {
    let source = source.split('#').next().unwrap_or(source);
    let (path, query) = source.split_once('?').unwrap_or((source, ""));
    if let Some(v) = query.split('&').find_map(|kv| kv.strip_prefix("v=")) {
        let name = sanitize_title(v);
        if !name.is_empty() {
            return name;
        }
    }
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    // Host only: nothing to name the file after.
    let segment = match path.trim_end_matches('/').split_once('/') {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or(""),
        None => "",
    };
    let stem = match segment.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => segment,
    };
    let name = sanitize_title(stem);
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

fn generated_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("job-{millis}")
}

pub async fn run_add(cfg: &MdmConfig, source: &str, mut opts: AddOptions) -> Result<()> {
    if opts.lookup_title && opts.name.is_none() && !opts.remux {
        match media_title(&collaborators(cfg)?, source).await {
            Ok(title) => opts.name = Some(title),
            Err(e) => tracing::warn!(source, "title lookup failed, naming from the URL: {:#}", e),
        }
    }
    let request = build_request(source, opts);
    let id = request.id.clone();
    match control_socket::forward(ControlRequest::Submit {
        request: request.clone(),
    })
    .await?
    {
        Some(ControlResponse::Job { job }) => {
            println!("Added job {id} ({}) for {source}", job.status.as_str());
        }
        Some(ControlResponse::Error { message }) => bail!("{message}"),
        Some(other) => bail!("unexpected response from running instance: {other:?}"),
        None => {
            let engine = open_engine(cfg, None).await?;
            engine.submit(request).await?;
            println!("Added job {id} for {source}; start it with `mdm run`");
        }
    }
    Ok(())
}
