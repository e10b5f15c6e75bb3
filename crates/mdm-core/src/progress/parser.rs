//! Line-oriented progress parser for both command templates.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::job::{JobKind, Progress};
use crate::supervisor::Stream;

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());
static ELAPSED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());
static REMUX_SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?x)").unwrap());
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)%").unwrap());
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"of\s+(~?\s*\d+(?:\.\d+)?\w+)").unwrap());
static SPEED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"at\s+(\d+(?:\.\d+)?\w+/s)").unwrap());
static ETA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"ETA\s+([\d:]+)").unwrap());
/// Status line of the converter the fetch tool runs for merging/extraction.
static CONVERTER_STATS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^frame=\s*\d+|^size=\s*\S+.*\btime=\s*\d").unwrap()
});

/// Post-processing markers printed by the fetch tool once the transfer is done.
const POSTPROCESS_MARKERS: &[&str] = &[
    "[Merger]",
    "[ffmpeg]",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
];

/// Label shown while post-processing, where no percentage is measurable.
pub const PROCESSING_LABEL: &str = "Processing...";

/// Which status the update implies for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Downloading,
    Converting,
}

/// One structured progress signal extracted from a line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: Progress,
    pub phase: Phase,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub total_size: Option<String>,
}

impl ProgressUpdate {
    fn converting() -> Self {
        Self {
            progress: Progress::Indeterminate(PROCESSING_LABEL.to_string()),
            phase: Phase::Converting,
            speed: None,
            eta: None,
            total_size: None,
        }
    }
}

/// Per-job parser. Holds the only state the rules need: the announced
/// duration for the timestamp-based remux path.
#[derive(Debug, Clone)]
pub struct LineParser {
    kind: JobKind,
    duration_secs: Option<f64>,
}

impl LineParser {
    pub fn new(kind: JobKind) -> Self {
        Self {
            kind,
            duration_secs: None,
        }
    }

    pub fn known_duration(&self) -> Option<f64> {
        self.duration_secs
    }

    /// Consume one line from `stream`; returns at most one update. Never fails.
    pub fn parse_line(&mut self, stream: Stream, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self.kind {
            JobKind::StreamRemux => self.parse_remux_line(line),
            JobKind::SimpleFetch => parse_fetch_line(stream, line),
        }
    }

    fn parse_remux_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        if let Some(caps) = DURATION_RE.captures(line) {
            // First announcement wins; later inputs/outputs repeat the header.
            if self.duration_secs.is_none() {
                self.duration_secs = hms_to_secs(&caps[1], &caps[2], &caps[3]).filter(|d| *d > 0.0);
            }
            return None;
        }

        let duration = self.duration_secs?;
        let caps = ELAPSED_RE.captures(line)?;
        let elapsed = hms_to_secs(&caps[1], &caps[2], &caps[3])?;
        let percent = round_one_decimal((elapsed / duration * 100.0).min(100.0));
        Some(ProgressUpdate {
            progress: Progress::Percent(percent),
            phase: Phase::Downloading,
            speed: REMUX_SPEED_RE.captures(line).map(|c| c[1].to_string()),
            eta: None,
            total_size: None,
        })
    }
}

fn parse_fetch_line(stream: Stream, line: &str) -> Option<ProgressUpdate> {
    if POSTPROCESS_MARKERS.iter().any(|m| line.starts_with(m)) {
        return Some(ProgressUpdate::converting());
    }
    // The converter reports on stderr; info lines on stdout may carry
    // `time=` inside URLs.
    if stream == Stream::Stderr && CONVERTER_STATS_RE.is_match(line) {
        return Some(ProgressUpdate::converting());
    }
    let rest = line.strip_prefix("[download]")?;
    if rest.trim_start().starts_with("Destination:") {
        return None;
    }

    let caps = PERCENT_RE.captures(rest)?;
    let percent: f64 = caps[1].parse().ok()?;
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }

    let total_size = SIZE_RE
        .captures(line)
        .map(|c| c[1].split_whitespace().collect::<String>());
    let speed = SPEED_RE.captures(line).map(|c| c[1].to_string());
    let mut eta = ETA_RE.captures(line).map(|c| c[1].to_string());
    if percent >= 100.0 {
        eta = Some("00:00".to_string());
    }

    Some(ProgressUpdate {
        progress: Progress::Percent(percent),
        phase: Phase::Downloading,
        speed,
        eta,
        total_size,
    })
}

fn hms_to_secs(h: &str, m: &str, s: &str) -> Option<f64> {
    let h: f64 = h.parse().ok()?;
    let m: f64 = m.parse().ok()?;
    let s: f64 = s.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + s)
}

fn round_one_decimal(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
