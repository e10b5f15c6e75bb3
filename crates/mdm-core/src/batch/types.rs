//! Batch (playlist) request and the derived per-member job requests.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::job::{BatchLink, JobId, JobKind, JobRequest, MediaSelector};

/// Joins batch and member ids into a job id. Rejected inside either id, so
/// derived ids cannot collide.
pub const MEMBER_SEPARATOR: char = ':';

const DEFAULT_VIDEO_QUALITY: &str = "1080p";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMember {
    pub member_id: String,
    /// 1-based position in the playlist; used for the file name.
    pub index: u32,
    pub title: String,
    /// Defaults to the YouTube watch URL for `member_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default = "default_selected")]
    pub selected: bool,
    /// Defaults to video at 1080p.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaSelector>,
}

fn default_selected() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub output_dir: PathBuf,
    pub members: Vec<BatchMember>,
}

impl BatchRequest {
    pub fn validate(&self) -> Result<(), String> {
        check_id("batch id", &self.id)?;
        if self.output_dir.as_os_str().is_empty() {
            return Err(format!("batch {}: output directory must not be empty", self.id));
        }
        let mut seen = HashSet::new();
        for m in &self.members {
            check_id("member id", &m.member_id)?;
            if !seen.insert(m.member_id.as_str()) {
                return Err(format!("batch {}: duplicate member {}", self.id, m.member_id));
            }
        }
        Ok(())
    }

    pub fn selected(&self) -> impl Iterator<Item = &BatchMember> {
        self.members.iter().filter(|m| m.selected)
    }

    /// Job request for one member, inheriting the batch output directory.
    pub fn job_request(&self, member: &BatchMember) -> JobRequest {
        let source = member
            .source
            .clone()
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={}", member.member_id));
        JobRequest {
            id: derived_job_id(&self.id, &member.member_id),
            kind: JobKind::infer(&source),
            source,
            output_dir: self.output_dir.clone(),
            base_name: member_base_name(member.index, &member.title),
            media: member
                .media
                .clone()
                .unwrap_or_else(|| MediaSelector::video(Some(DEFAULT_VIDEO_QUALITY.to_string()))),
            batch: Some(BatchLink {
                batch_id: self.id.clone(),
                member_id: member.member_id.clone(),
            }),
        }
    }
}

fn check_id(what: &str, id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err(format!("{what} must not be empty"));
    }
    if id.contains(MEMBER_SEPARATOR) {
        return Err(format!("{what} {id:?} must not contain '{MEMBER_SEPARATOR}'"));
    }
    Ok(())
}

pub fn derived_job_id(batch_id: &str, member_id: &str) -> JobId {
    format!("{batch_id}{MEMBER_SEPARATOR}{member_id}")
}

/// `"{index:02} - {title}"` with characters invalid in file names replaced.
pub fn member_base_name(index: u32, title: &str) -> String {
    let title = sanitize_title(title);
    if title.is_empty() {
        format!("{index:02}")
    } else {
        format!("{index:02} - {title}")
    }
}

pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Counters derived from member job statuses; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Selected members.
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Members with a running process.
    pub active: usize,
    /// Every selected member completed or failed.
    pub finished: bool,
}

/// What the coordinator persists about a batch. Members already handed to
/// the engine are recovered from the engine's own jobs; only members still
/// waiting for a gate slot carry their request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// `Finished` was already announced.
    #[serde(default)]
    pub finished_sent: bool,
    pub members: Vec<MemberRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting: Option<JobRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Progress(BatchProgress),
    /// Emitted once per batch.
    Finished(BatchProgress),
}
