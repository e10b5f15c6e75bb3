//! Ask the fetch tool what a URL contains before anything is downloaded.
//!
//! A playlist is listed flat (`--flat-playlist --dump-json`): one JSON object
//! per entry on stdout, which becomes a [`BatchRequest`] with every member
//! selected. A single page can be asked for its title only.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use url::Url;

use super::types::{BatchMember, BatchRequest, MEMBER_SEPARATOR};
use crate::classify::{classify, failure_message, FailureKind};
use crate::services::{Collaborators, Tool};
use crate::supervisor::{self, LaunchSpec, Stream};

const TAIL_LINES: usize = 20;
const UNKNOWN_PLAYLIST: &str = "Unknown Playlist";
const UNKNOWN_VIDEO: &str = "Unknown Video";

/// Rough URL check: YouTube `list=` links and playlist pages, SoundCloud sets
/// and profiles (private share links excluded).
pub fn is_playlist_url(url: &str) -> bool {
    url.contains("list=")
        || url.contains("/playlist")
        || url.contains("/sets/")
        || (url.contains("soundcloud.com/") && !url.contains("/s-"))
}

/// The `list` query parameter, else the last path segment, else
/// `playlist_` plus a short hash of the URL.
pub fn playlist_id_from_url(url: &str) -> String {
    let from_url = Url::parse(url).ok().and_then(|u| {
        if let Some((_, list)) = u.query_pairs().find(|(k, _)| k == "list") {
            return Some(list.into_owned());
        }
        u.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(str::to_string)
    });
    from_url
        .filter(|id| !id.trim().is_empty() && !id.contains(MEMBER_SEPARATOR))
        .unwrap_or_else(|| format!("playlist_{}", short_hash(url, 10)))
}

fn short_hash(text: &str, len: usize) -> String {
    let mut hex = hex::encode(Sha256::digest(text.as_bytes()));
    hex.truncate(len);
    hex
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    playlist_title: Option<String>,
    #[serde(default)]
    playlist: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Build the batch for `url` from the tool's flat listing.
pub fn parse_flat_listing(url: &str, output_dir: PathBuf, listing: &str) -> Result<BatchRequest> {
    let entries = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str::<FlatEntry>(l)
                .with_context(|| format!("parse playlist entry {}", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;
    let Some(first) = entries.first() else {
        bail!("No videos found in playlist");
    };
    let title = non_empty(&first.playlist_title)
        .or_else(|| non_empty(&first.playlist))
        .unwrap_or(UNKNOWN_PLAYLIST)
        .to_string();

    let mut seen = HashSet::new();
    let members = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let index = i as u32 + 1;
            let mut member_id = entry_id(entry, index);
            if !seen.insert(member_id.clone()) {
                // Same video listed twice.
                member_id = format!("{member_id}-{index}");
                seen.insert(member_id.clone());
            }
            BatchMember {
                member_id,
                index,
                title: non_empty(&entry.title).unwrap_or(UNKNOWN_VIDEO).to_string(),
                source: non_empty(&entry.url).map(str::to_string),
                selected: true,
                media: None,
            }
        })
        .collect();

    Ok(BatchRequest {
        id: playlist_id_from_url(url),
        title: Some(title),
        output_dir,
        members,
    })
}

/// Entry id, else a hash of its URL (URLs can't be member ids), else its
/// position.
fn entry_id(entry: &FlatEntry, index: u32) -> String {
    if let Some(id) = non_empty(&entry.id).filter(|id| !id.contains(MEMBER_SEPARATOR)) {
        return id.to_string();
    }
    match non_empty(&entry.url) {
        Some(url) => format!("url_{}", short_hash(url, 12)),
        None => format!("entry_{index}"),
    }
}

/// List the playlist at `url` and turn it into a batch saving into
/// `output_dir`. Cookie arguments are added when the hint asks for them; a
/// verification challenge without cookies is reported back to the hint.
pub async fn analyze_playlist(
    services: &Collaborators,
    url: &str,
    output_dir: PathBuf,
) -> Result<BatchRequest> {
    let args = ["--flat-playlist", "--dump-json", "--yes-playlist"];
    let listing = run_fetch_tool(services, url, &args, "playlist analysis").await?;
    let request = parse_flat_listing(url, output_dir, &listing)?;
    tracing::info!(
        url,
        batch_id = %request.id,
        members = request.members.len(),
        "playlist analyzed"
    );
    Ok(request)
}

#[derive(Debug, Deserialize)]
struct SingleInfo {
    #[serde(default)]
    title: Option<String>,
}

/// Title of the single media at `url`, `"Unknown Video"` when the tool
/// reports none.
pub async fn media_title(services: &Collaborators, url: &str) -> Result<String> {
    let args = ["--dump-single-json", "--no-playlist"];
    let json = run_fetch_tool(services, url, &args, "title lookup").await?;
    let info: SingleInfo = serde_json::from_str(json.trim()).context("parse media info")?;
    Ok(non_empty(&info.title).unwrap_or(UNKNOWN_VIDEO).to_string())
}

/// Run the fetch tool for `url` with `args` and return its stdout.
async fn run_fetch_tool(
    services: &Collaborators,
    url: &str,
    args: &[&str],
    what: &str,
) -> Result<String> {
    let tool = services.resolver.resolve(Tool::Fetch)?;
    let cookie_args = services.cookies.extra_args(url);
    let with_cookies = !cookie_args.is_empty();

    let mut full = tool.leading_args;
    full.push(url.to_string());
    full.extend(args.iter().map(|a| a.to_string()));
    full.extend(cookie_args);
    let spec = LaunchSpec {
        program: tool.program,
        args: full,
    };
    tracing::debug!(url, with_cookies, "{}: {}", what, spec);

    let log_id = format!("{}_{}", what.replace(' ', "_"), short_hash(url, 12));
    let (handle, mut output) = supervisor::start(&spec, services.log_sink.open(&log_id), TAIL_LINES)?;
    let mut stdout = String::new();
    while let Some(line) = output.next_line().await {
        if line.stream == Stream::Stdout {
            stdout.push_str(&line.text);
            stdout.push('\n');
        }
    }
    let report = output.finish().await;
    drop(handle);

    if !report.success() {
        let kind = classify(&report.stderr_tail);
        if kind == FailureKind::VerificationChallenge && !with_cookies {
            services.cookies.record_challenge(url);
            tracing::info!(url, "verification challenge; cookies will be used next time");
        }
        tracing::warn!(url, kind = %kind, "{} failed", what);
        bail!("{} failed: {}", capitalize(what), failure_message(kind, report.code));
    }
    services.log_sink.discard(&log_id);
    Ok(stdout)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
