//! Tests for request building, manifests and console rendering.

use crate::cli::commands::{build_request, is_url, load_manifest, render, AddOptions, JobAction};
use crate::cli::console::{format_batch, format_progress};
use mdm_core::batch::BatchProgress;
use mdm_core::job::{Job, JobKind, JobStatus, MediaKind, Progress};
use std::path::PathBuf;

fn opts() -> AddOptions {
    AddOptions {
        dir: PathBuf::from("/tmp/out"),
        name: None,
        id: Some("j1".to_string()),
        audio: false,
        quality: None,
        remux: false,
        lookup_title: false,
    }
}

#[test]
fn add_names_watch_pages_by_video_id() {
    let r = build_request("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10", opts());
    assert_eq!(r.base_name, "dQw4w9WgXcQ");
    assert_eq!(r.kind, JobKind::SimpleFetch);
    assert_eq!(r.media.kind, MediaKind::Video);
    assert_eq!(r.id, "j1");
    assert!(r.validate().is_ok());
}

#[test]
fn add_names_from_last_path_segment() {
    let r = build_request("https://cdn.example.com/shows/ep1/index.m3u8?token=x", opts());
    assert_eq!(r.base_name, "index");
    assert_eq!(r.kind, JobKind::StreamRemux);

    let r = build_request("https://example.com/", opts());
    assert_eq!(r.base_name, "download");
}

#[test]
fn add_flags_override_inference() {
    let mut o = opts();
    o.name = Some("My: Show".to_string());
    o.audio = true;
    o.quality = Some("0".to_string());
    o.remux = true;
    o.id = None;
    let r = build_request("https://example.com/a", o);
    assert_eq!(r.base_name, "My- Show");
    assert_eq!(r.kind, JobKind::StreamRemux);
    assert_eq!(r.media.kind, MediaKind::Audio);
    assert_eq!(r.media.quality.as_deref(), Some("0"));
    assert!(r.id.starts_with("job-"));
}

#[test]
fn manifest_output_dir_is_relative_to_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trip.toml");
    std::fs::write(
        &path,
        r#"
id = "PLtrip"
title = "Trip"
output_dir = "music"

[[members]]
member_id = "a"
index = 1
title = "Intro"
"#,
    )
    .unwrap();
    let req = load_manifest(&path).unwrap();
    assert_eq!(req.id, "PLtrip");
    assert_eq!(req.output_dir, dir.path().join("music"));
    assert_eq!(req.members.len(), 1);
    assert!(req.members[0].selected);

    std::fs::write(&path, "id = 3").unwrap();
    assert!(load_manifest(&path).is_err());
    assert!(load_manifest(&dir.path().join("missing.toml")).is_err());
}

#[test]
fn batch_sources_are_urls_or_manifest_paths() {
    assert!(is_url("https://www.youtube.com/playlist?list=PL1"));
    assert!(is_url("http://example.com/sets/x"));
    assert!(!is_url("playlist.toml"));
    assert!(!is_url("./https-mirror/list.toml"));
}

#[test]
fn status_table_lists_jobs_and_errors() {
    assert_eq!(render(&[], &[]), "No jobs.\n");

    let mut job = Job::new(build_request("https://example.com/clip.mp4", opts()));
    job.status = JobStatus::Error;
    job.last_error = Some("The media was not found".to_string());
    let text = render(&[job], &[]);
    assert!(text.starts_with("ID"));
    assert!(text.contains("j1"));
    assert!(text.contains("error"));
    assert!(text.contains("    error: The media was not found"));
}

#[test]
fn console_lines() {
    let line = format_progress(
        "j1",
        JobStatus::Downloading,
        &Progress::Percent(45.2),
        Some("2.00MiB/s"),
        Some("00:03"),
    );
    assert_eq!(line, "  j1: 45.2%  2.00MiB/s  ETA 00:03");

    let line = format_progress(
        "j1",
        JobStatus::Converting,
        &Progress::Indeterminate("Processing...".to_string()),
        None,
        None,
    );
    assert_eq!(line, "  j1: Processing... (converting)");

    let p = BatchProgress {
        batch_id: "PL".to_string(),
        title: None,
        total: 5,
        completed: 2,
        failed: 1,
        active: 2,
        finished: false,
    };
    assert_eq!(format_batch(&p), "Batch PL: 2/5 done, 1 failed, 2 running");
}

#[test]
fn job_action_messages() {
    assert_eq!(JobAction::Pause.outcome("a", true), "Paused job a");
    assert_eq!(JobAction::Retry.outcome("a", false), "Job a has not failed");
    assert_eq!(JobAction::Remove.outcome("a", false), "Job a is not finished");
}
