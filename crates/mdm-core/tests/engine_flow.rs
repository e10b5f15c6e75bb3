//! Integration tests: engine driving fake tool scripts resolved from a bin dir,
//! with file logs and the SQLite store.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fake_tools::{is_alive, FakeTools};
use common::{request, wait_until};
use mdm_core::engine::{EngineEvent, JobOutcome};
use mdm_core::job::{Job, JobKind, JobStatus, Progress};
use mdm_core::store::{JobStore, MemoryJobStore, SqliteJobStore};
use tempfile::tempdir;

#[tokio::test]
async fn concurrency_never_exceeds_the_limit() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let engine = tools.engine(Arc::new(MemoryJobStore::new()), 2).await;
    engine.start().await;

    let ids: Vec<String> = (0..6).map(|i| format!("job{i}")).collect();
    for id in &ids {
        engine
            .submit(request(id, &format!("https://example.com/{id}"), out.path()))
            .await
            .unwrap();
        assert!(engine.active_count().await <= 2);
    }
    for id in &ids {
        let outcome = tokio::time::timeout(Duration::from_secs(20), engine.wait_for_terminal(id))
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed));
    }
    assert_eq!(tools.runs(), 6);
    assert!(tools.concurrency_peak() <= 2, "peak {}", tools.concurrency_peak());
    assert!(out.path().join("job5.mp4").exists());
}

#[tokio::test]
async fn fetch_progress_reaches_subscribers_in_order() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let engine = tools.engine(Arc::new(MemoryJobStore::new()), 1).await;
    let mut events = engine.subscribe();
    engine.start().await;

    engine
        .submit(request("clip", "https://example.com/clip", out.path()))
        .await
        .unwrap();
    assert_eq!(engine.wait_for_terminal("clip").await, Some(JobOutcome::Completed));

    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        seen.push(ev);
    }
    let percents: Vec<f64> = seen
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Progress {
                status: JobStatus::Downloading,
                progress: Progress::Percent(p),
                ..
            } => Some(*p),
            _ => None,
        })
        .collect();
    assert!(percents.contains(&45.2), "{percents:?}");
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert!(matches!(seen.last(), Some(EngineEvent::Completed { id, .. }) if id == "clip"));

    // Success discards the tool log.
    let logs: Vec<_> = std::fs::read_dir(tools.log_dir())
        .map(|d| d.flatten().map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(logs.is_empty(), "{logs:?}");
}

#[tokio::test]
async fn remux_progress_uses_the_stream_duration() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let engine = tools.engine(Arc::new(MemoryJobStore::new()), 1).await;
    let mut events = engine.subscribe();
    engine.start().await;

    let req = request("live", "https://cdn.example.com/live/index.m3u8", out.path());
    assert_eq!(req.kind, JobKind::StreamRemux);
    engine.submit(req).await.unwrap();
    assert_eq!(engine.wait_for_terminal("live").await, Some(JobOutcome::Completed));

    let mut halfway = None;
    while let Ok(ev) = events.try_recv() {
        if let EngineEvent::Progress {
            progress: Progress::Percent(p),
            speed,
            ..
        } = ev
        {
            if p > 0.0 && p < 100.0 {
                halfway = Some((p, speed));
            }
        }
    }
    assert_eq!(halfway, Some((50.0, Some("2.5x".to_string()))));
    assert!(out.path().join("live.mp4").exists());
}

#[tokio::test]
async fn failure_keeps_the_log_and_reports_its_path() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let engine = tools.engine(Arc::new(MemoryJobStore::new()), 1).await;
    engine.start().await;

    engine
        .submit(request("broken", "https://example.com/fail", out.path()))
        .await
        .unwrap();
    let outcome = engine.wait_for_terminal("broken").await;
    match outcome {
        Some(JobOutcome::Failed(message)) => assert!(message.contains("not found"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
    let job = engine.job("broken").await.unwrap();
    let log = job.log_path.expect("log path");
    let text = std::fs::read_to_string(log).unwrap();
    assert!(text.contains("Command: "), "{text}");
    assert!(text.contains("[STDERR] ERROR: [generic]"), "{text}");
}

#[tokio::test]
async fn cancelling_an_active_job_kills_it_before_removal() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let engine = tools.engine(Arc::new(MemoryJobStore::new()), 1).await;
    engine.start().await;

    engine
        .submit(request("big", "https://example.com/slow", out.path()))
        .await
        .unwrap();
    let partial = out.path().join("big.f137.mp4.part");
    wait_until("partial file", || {
        let exists = partial.exists();
        async move { exists }
    })
    .await;
    let pid = tools.pid_of("slow").expect("pid recorded");
    assert!(is_alive(pid));

    let mut events = engine.subscribe();
    assert!(engine.cancel("big").await);
    loop {
        match events.recv().await.unwrap() {
            EngineEvent::Removed { id } if id == "big" => break,
            _ => {}
        }
    }
    assert!(!is_alive(pid), "process {pid} survived cancel");
    assert!(!partial.exists());
    assert!(engine.job("big").await.is_none());
}

#[tokio::test]
async fn restart_recovers_interrupted_jobs_from_sqlite() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let state = tempdir().unwrap();
    let db_path = state.path().join("jobs.db");

    // A previous process died mid-download.
    {
        let store = SqliteJobStore::open_at(&db_path).await.unwrap();
        let mut running = Job::new(request("a", "https://example.com/a", out.path()));
        running.status = JobStatus::Downloading;
        running.progress = Progress::Percent(30.0);
        running.has_run = true;
        let waiting = Job::new(request("b", "https://example.com/b", out.path()));
        store.save(&[running, waiting]).await.unwrap();
    }

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_at(&db_path).await.unwrap());
    let engine = tools.engine(store.clone(), 2).await;
    let jobs = engine.snapshot().await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].status, JobStatus::Paused);
    assert_eq!(jobs[1].status, JobStatus::Pending);
    assert_eq!(tools.runs(), 0);
    let persisted = store.load().await.unwrap();
    assert_eq!(persisted[0].status, JobStatus::Paused);

    engine.start().await;
    assert_eq!(engine.wait_for_terminal("b").await, Some(JobOutcome::Completed));
    assert_eq!(engine.job("a").await.unwrap().status, JobStatus::Paused);

    assert!(engine.resume("a").await);
    assert_eq!(engine.wait_for_terminal("a").await, Some(JobOutcome::Completed));
    let persisted = store.load().await.unwrap();
    assert!(persisted.iter().all(|j| j.status == JobStatus::Completed));
}

#[tokio::test]
async fn shutdown_pauses_running_jobs() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let state = tempdir().unwrap();
    let store: Arc<dyn JobStore> =
        Arc::new(SqliteJobStore::open_at(state.path().join("jobs.db")).await.unwrap());
    let engine = tools.engine(store.clone(), 1).await;
    engine.start().await;
    engine
        .submit(request("long", "https://example.com/slow", out.path()))
        .await
        .unwrap();
    let e = engine.clone();
    wait_until("job running", move || {
        let e = e.clone();
        async move { e.active_count().await == 1 }
    })
    .await;

    assert_eq!(engine.shutdown().await, 1);
    let persisted = store.load().await.unwrap();
    assert_eq!(persisted[0].status, JobStatus::Paused);
    if let Some(pid) = tools.pid_of("slow") {
        assert!(!is_alive(pid));
    }
}

#[tokio::test]
async fn merge_step_switches_to_converting_for_good() {
    let tools = FakeTools::install();
    let out = tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let engine = tools.engine(store.clone(), 1).await;
    let mut events = engine.subscribe();
    engine.start().await;

    engine
        .submit(request("merged", "https://example.com/merge", out.path()))
        .await
        .unwrap();
    let e = engine.clone();
    wait_until("merge step", move || {
        let e = e.clone();
        async move {
            e.job("merged")
                .await
                .is_some_and(|j| j.status == JobStatus::Converting)
        }
    })
    .await;
    // The status change is persisted straight away.
    assert!(store
        .snapshot()
        .iter()
        .any(|j| j.id() == "merged" && j.status == JobStatus::Converting));

    assert_eq!(engine.wait_for_terminal("merged").await, Some(JobOutcome::Completed));
    let mut statuses = Vec::new();
    while let Ok(ev) = events.try_recv() {
        match ev {
            EngineEvent::Progress { status, .. } => statuses.push(status),
            EngineEvent::Completed { .. } => break,
            other => panic!("unexpected {other:?}"),
        }
    }
    let first_converting = statuses
        .iter()
        .position(|s| *s == JobStatus::Converting)
        .expect("converting reported");
    assert!(statuses[..first_converting].contains(&JobStatus::Downloading));
    assert!(
        statuses[first_converting..]
            .iter()
            .all(|s| *s == JobStatus::Converting),
        "{statuses:?}"
    );
    assert!(out.path().join("merged.mp4").exists());
}
