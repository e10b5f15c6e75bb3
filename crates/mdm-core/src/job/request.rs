//! Caller-supplied job request.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::types::JobId;

/// Which command template a job runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Fetch tool (yt-dlp style) with `[download] NN%` progress lines.
    #[default]
    SimpleFetch,
    /// Remux tool (ffmpeg style) copying a stream into a container.
    StreamRemux,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::SimpleFetch => "simple-fetch",
            JobKind::StreamRemux => "stream-remux",
        }
    }

    /// HLS playlists go through the remux tool; everything else through the fetch tool.
    pub fn infer(source: &str) -> Self {
        let path = source.split(['?', '#']).next().unwrap_or(source);
        if path.to_ascii_lowercase().ends_with(".m3u8") {
            JobKind::StreamRemux
        } else {
            JobKind::SimpleFetch
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
}

/// Media selection plus an optional quality hint: a resolution like `1080p`
/// for video, an audio-quality code like `0` (best) .. `5` for audio.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaSelector {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
}

impl MediaSelector {
    pub fn audio(quality: Option<String>) -> Self {
        Self {
            kind: MediaKind::Audio,
            quality,
        }
    }

    pub fn video(resolution: Option<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            quality: resolution,
        }
    }
}

/// Structured association of a job with the batch member it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchLink {
    pub batch_id: String,
    pub member_id: String,
}

/// Everything the caller supplies when submitting a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: JobId,
    /// URI identifying what to fetch.
    pub source: String,
    pub output_dir: PathBuf,
    /// Output file name without extension; the tool picks the extension.
    pub base_name: String,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub media: MediaSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchLink>,
}

impl JobRequest {
    /// Check required fields. Returns the reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("job id must not be empty".to_string());
        }
        if self.source.trim().is_empty() {
            return Err(format!("job {}: source must not be empty", self.id));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(format!("job {}: output directory must not be empty", self.id));
        }
        let name = self.base_name.trim();
        if name.is_empty() || name == "." || name == ".." {
            return Err(format!("job {}: invalid output base name", self.id));
        }
        if self.base_name.contains(['/', '\\']) {
            return Err(format!(
                "job {}: output base name must not contain path separators",
                self.id
            ));
        }
        Ok(())
    }
}
