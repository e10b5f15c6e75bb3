//! Per-job tool logs.
//!
//! Every line a tool prints is appended to `download_<id>_<hash>.log` with a
//! `[STDOUT]`/`[STDERR]` prefix. Logs of successful jobs are discarded; logs
//! of failed jobs are kept for the user and aged out by [`clean_old_logs`].
//! Write errors are logged once and otherwise ignored.

use anyhow::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sha2::{Digest, Sha256};

use crate::config::LogRetentionConfig;
use crate::supervisor::Stream;

/// Open handle for one job's log.
pub trait LogWriter: Send {
    fn append_line(&mut self, stream: Stream, line: &str);
    /// Unprefixed line (command header, exit footer).
    fn note(&mut self, line: &str);
}

pub trait LogSink: Send + Sync {
    fn open(&self, job_id: &str) -> Box<dyn LogWriter>;
    /// Where the log for `job_id` lives, if this sink keeps files.
    fn path_for(&self, job_id: &str) -> Option<PathBuf>;
    /// Delete the log (after a successful run).
    fn discard(&self, job_id: &str);
}

/// Files under a directory, one per job id.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.local/state/mdm/logs`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(crate::logging::state_dir()?.join("logs")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(log_file_name(job_id))
    }
}

impl LogSink for FileLogSink {
    fn open(&self, job_id: &str) -> Box<dyn LogWriter> {
        let path = self.file_for(job_id);
        let file = fs::create_dir_all(&self.dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match file {
            Ok(file) => Box::new(FileLogWriter {
                path,
                out: Some(LineWriter::new(file)),
            }),
            Err(e) => {
                tracing::warn!(job_id, "cannot open tool log {}: {}", path.display(), e);
                Box::new(NullWriter)
            }
        }
    }

    fn path_for(&self, job_id: &str) -> Option<PathBuf> {
        Some(self.file_for(job_id))
    }

    fn discard(&self, job_id: &str) {
        let path = self.file_for(job_id);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(job_id, "deleted tool log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id, "cannot delete {}: {}", path.display(), e),
        }
    }
}

struct FileLogWriter {
    path: PathBuf,
    out: Option<LineWriter<File>>,
}

impl FileLogWriter {
    fn write(&mut self, line: std::fmt::Arguments<'_>) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        if let Err(e) = out.write_fmt(line).and_then(|_| out.write_all(b"\n")) {
            tracing::warn!("tool log {} disabled: {}", self.path.display(), e);
            self.out = None;
        }
    }
}

impl LogWriter for FileLogWriter {
    fn append_line(&mut self, stream: Stream, line: &str) {
        self.write(format_args!("[{}] {}", stream.label(), line));
    }

    fn note(&mut self, line: &str) {
        self.write(format_args!("{line}"));
    }
}

/// Sink that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogSink;

struct NullWriter;

impl LogWriter for NullWriter {
    fn append_line(&mut self, _stream: Stream, _line: &str) {}
    fn note(&mut self, _line: &str) {}
}

impl LogSink for NullLogSink {
    fn open(&self, _job_id: &str) -> Box<dyn LogWriter> {
        Box::new(NullWriter)
    }

    fn path_for(&self, _job_id: &str) -> Option<PathBuf> {
        None
    }

    fn discard(&self, _job_id: &str) {}
}

/// Readable id plus a short digest of the raw id: `a:b` and `a_b` sanitize
/// to the same text but must not share a file.
fn log_file_name(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    format!("download_{}_{}.log", sanitize_id(id), &hex::encode(digest)[..8])
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

const ERROR_SCAN_BYTES: u64 = 1024;

/// Delete `*.log` files in `dir` older than the retention. Logs whose first
/// KiB mentions `ERROR` or `failed` use the longer error retention.
/// Returns the number of files deleted.
pub fn clean_old_logs(dir: &Path, retention: &LogRetentionConfig) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let now = SystemTime::now();
    let normal = Duration::from_secs(retention.retain_success_hours * 3600);
    let errored = Duration::from_secs(retention.retain_error_hours * 3600);

    let mut deleted = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let age = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => now.duration_since(modified).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("skip {}: {}", path.display(), e);
                continue;
            }
        };
        let max_age = if mentions_error(&path) { errored } else { normal };
        if age > max_age {
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!("cannot delete old log {}: {}", path.display(), e),
            }
        }
    }
    if deleted > 0 {
        tracing::info!("deleted {} old tool logs", deleted);
    }
    Ok(deleted)
}

fn mentions_error(path: &Path) -> bool {
    let mut head = Vec::with_capacity(ERROR_SCAN_BYTES as usize);
    let read = File::open(path).and_then(|f| f.take(ERROR_SCAN_BYTES).read_to_end(&mut head));
    if read.is_err() {
        return false;
    }
    let head = String::from_utf8_lossy(&head);
    head.contains("ERROR") || head.contains("failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_prefixes_lines_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLogSink::new(dir.path().join("logs"));
        {
            let mut w = sink.open("batch:01/x");
            w.note("Command: yt-dlp x");
            w.append_line(Stream::Stdout, "[download]  1.0%");
            w.append_line(Stream::Stderr, "WARNING: slow");
        }
        let path = sink.path_for("batch:01/x").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("download_batch_01_x_"), "{name}");
        assert!(name.ends_with(".log"), "{name}");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Command: yt-dlp x\n[STDOUT] [download]  1.0%\n[STDERR] WARNING: slow\n"
        );

        sink.discard("batch:01/x");
        assert!(!path.exists());
        sink.discard("batch:01/x");
    }

    #[test]
    fn ids_that_sanitize_alike_get_separate_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileLogSink::new(dir.path());
        assert_ne!(sink.path_for("a:b"), sink.path_for("a_b"));
        assert_eq!(sink.path_for("a:b"), sink.path_for("a:b"));

        sink.open("a:b").note("first");
        sink.open("a_b").note("second");
        sink.discard("a:b");
        let kept = fs::read_to_string(sink.path_for("a_b").unwrap()).unwrap();
        assert_eq!(kept, "second\n");
        assert!(!sink.path_for("a:b").unwrap().exists());
    }

    fn aged_log(dir: &Path, name: &str, body: &str, hours: u64) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, body).unwrap();
        let f = File::options().write(true).open(&p).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(hours * 3600))
            .unwrap();
        p
    }

    #[test]
    fn clean_old_logs_keeps_error_logs_longer() {
        let dir = tempfile::tempdir().unwrap();
        let retention = LogRetentionConfig::default();
        let fresh = aged_log(dir.path(), "download_a.log", "[STDOUT] ok", 1);
        let stale = aged_log(dir.path(), "download_b.log", "[STDOUT] ok", 30);
        let stale_error = aged_log(dir.path(), "download_c.log", "[STDERR] ERROR: boom", 30);
        let ancient_error = aged_log(dir.path(), "download_d.log", "post-processing failed", 200);
        let other = aged_log(dir.path(), "notes.txt", "x", 500);

        let n = clean_old_logs(dir.path(), &retention).unwrap();
        assert_eq!(n, 2);
        assert!(fresh.exists());
        assert!(!stale.exists());
        assert!(stale_error.exists());
        assert!(!ancient_error.exists());
        assert!(other.exists());
    }

    #[test]
    fn clean_old_logs_missing_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let n = clean_old_logs(&dir.path().join("nope"), &LogRetentionConfig::default()).unwrap();
        assert_eq!(n, 0);
    }
}
