#![cfg(unix)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::engine::{Engine, EngineError, EngineOptions};
use crate::job::{JobStatus, MediaSelector};
use crate::services::{Collaborators, ResolvedTool, StaticResolver, Tool};
use crate::store::MemoryJobStore;

fn sh(script: &str) -> StaticResolver {
    StaticResolver::new().with(
        Tool::Fetch,
        ResolvedTool::new("/bin/sh").with_leading_args(["-c", script, "fake-fetch"]),
    )
}

async fn engine(resolver: StaticResolver, limit: usize) -> Engine {
    engine_on(Arc::new(MemoryJobStore::new()), resolver, limit).await
}

async fn engine_on(store: Arc<MemoryJobStore>, resolver: StaticResolver, limit: usize) -> Engine {
    let options = EngineOptions {
        max_concurrent: limit,
        stderr_tail_lines: 20,
        event_capacity: 512,
    };
    Engine::open(store, Collaborators::headless(Arc::new(resolver)), options)
        .await
        .unwrap()
}

async fn until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn coordinator(engine: &Engine, gate: Option<usize>) -> BatchCoordinator {
    BatchCoordinator::new(
        engine.clone(),
        BatchOptions {
            gate,
            event_capacity: 512,
        },
    )
    .await
}

fn playlist(id: &str, dir: &Path, n: u32) -> BatchRequest {
    BatchRequest {
        id: id.to_string(),
        title: Some(format!("Playlist {id}")),
        output_dir: dir.to_path_buf(),
        members: (1..=n)
            .map(|i| BatchMember {
                member_id: format!("v{i}"),
                index: i,
                title: format!("Video {i}"),
                source: Some(format!("https://example.com/{id}/{i}")),
                selected: true,
                media: Some(MediaSelector::audio(None)),
            })
            .collect(),
    }
}

async fn finished(coord: &BatchCoordinator, id: &str) -> BatchProgress {
    tokio::time::timeout(Duration::from_secs(20), coord.wait_finished(id))
        .await
        .expect("batch did not finish in time")
        .expect("batch unknown")
}

#[tokio::test]
async fn gate_holds_members_back_until_slots_free() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("sleep 30"), 5).await;
    engine.start().await;
    let coord = coordinator(&engine, Some(2)).await;

    let p = coord.submit_batch(playlist("PL", dir.path(), 5)).await.unwrap();
    assert_eq!(p.total, 5);
    assert_eq!(engine.snapshot().await.len(), 2);
    assert_eq!(engine.active_count().await, 2);
    assert_eq!(coord.waiting().await, 3);

    let e = &engine;
    let c = &coord;

    // Pausing gives the slot to the next member in order.
    assert!(engine.pause("PL:v1").await);
    until("v3 submitted", move || async move { e.job("PL:v3").await.is_some() }).await;
    assert!(engine.job("PL:v4").await.is_none());
    assert_eq!(coord.in_flight().await, 2);

    // Resuming takes a slot again, even past the gate.
    assert!(engine.resume("PL:v1").await);
    until("v1 counted again", move || async move { c.in_flight().await == 3 }).await;

    // One cancel only brings the count back to the gate.
    assert!(engine.cancel("PL:v2").await);
    until("v2 released", move || async move { c.in_flight().await == 2 }).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.job("PL:v4").await.is_none());

    assert!(engine.cancel("PL:v3").await);
    until("v4 submitted", move || async move { e.job("PL:v4").await.is_some() }).await;
    assert!(engine.job("PL:v5").await.is_none());

    assert!(coord.cancel_batch("PL").await.unwrap() >= 3);
    assert_eq!(coord.waiting().await, 0);
    assert!(engine.snapshot().await.is_empty());
}

#[tokio::test]
async fn finished_fires_once_with_mixed_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let script = "case \"$1\" in *example.com/PL/2) echo 'ERROR: Video unavailable' >&2; exit 1;; esac; exit 0";
    let engine = engine(sh(script), 2).await;
    engine.start().await;
    let coord = coordinator(&engine, Some(2)).await;
    let mut events = coord.subscribe();

    coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
    let done = finished(&coord, "PL").await;
    assert_eq!((done.total, done.completed, done.failed), (3, 2, 1));
    assert!(done.finished);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut finished_events = 0;
    while let Ok(ev) = events.try_recv() {
        if matches!(ev, BatchEvent::Finished(ref p) if p.batch_id == "PL") {
            finished_events += 1;
        }
    }
    assert_eq!(finished_events, 1);

    // Retrying the failed member does not announce the batch again.
    assert!(engine.retry("PL:v2").await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(ev) = events.try_recv() {
        assert!(!matches!(ev, BatchEvent::Finished(_)), "{ev:?}");
    }
}

#[tokio::test]
async fn unselected_members_are_skipped_and_names_derived() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("exit 0"), 2).await;
    let coord = coordinator(&engine, None).await;

    let mut req = playlist("PL", dir.path(), 3);
    req.members[1].selected = false;
    req.members[2].title = "What? Now: \"this\"".to_string();
    let p = coord.submit_batch(req).await.unwrap();
    assert_eq!(p.total, 2);

    let jobs = engine.snapshot().await;
    let ids: Vec<&str> = jobs.iter().map(|j| j.id()).collect();
    assert_eq!(ids, vec!["PL:v1", "PL:v3"]);
    assert_eq!(jobs[1].request.base_name, "03 - What- Now- -this-");
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
}

#[tokio::test]
async fn invalid_batches_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("exit 0"), 1).await;
    let coord = coordinator(&engine, Some(1)).await;

    let mut req = playlist("PL", dir.path(), 2);
    req.members[0].member_id = "a:b".to_string();
    assert!(matches!(
        coord.submit_batch(req).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let mut none = playlist("PL", dir.path(), 2);
    none.members.iter_mut().for_each(|m| m.selected = false);
    assert!(coord.submit_batch(none).await.is_err());

    assert!(matches!(
        coord.cancel_batch("nope").await,
        Err(EngineError::UnknownBatch(_))
    ));
    assert!(engine.snapshot().await.is_empty());
}

#[tokio::test]
async fn resubmitting_requeues_only_cancelled_members() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("exit 0"), 1).await;
    let coord = coordinator(&engine, Some(1)).await;

    coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
    assert_eq!(engine.snapshot().await.len(), 1);
    coord.cancel_batch("PL").await.unwrap();
    assert!(engine.snapshot().await.is_empty());

    engine.start().await;
    coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
    let done = finished(&coord, "PL").await;
    assert_eq!(done.completed, 3);

    // Nothing left to queue the second time round.
    coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
    assert_eq!(coord.waiting().await, 0);
    assert_eq!(engine.snapshot().await.len(), 3);

    assert!(coord.remove_batch("PL").await);
    assert!(coord.progress("PL").await.is_none());
    assert!(!coord.remove_batch("PL").await);
}

#[tokio::test]
async fn existing_member_jobs_are_adopted() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("exit 0"), 2).await;
    let req = playlist("PL", dir.path(), 2);
    for m in &req.members {
        engine.submit(req.job_request(m)).await.unwrap();
    }

    let coord = coordinator(&engine, Some(2)).await;
    let p = coord.progress("PL").await.unwrap();
    assert_eq!((p.total, p.completed), (2, 0));
    assert_eq!(coord.in_flight().await, 2);

    engine.start().await;
    let done = finished(&coord, "PL").await;
    assert_eq!(done.completed, 2);
    assert_eq!(coord.in_flight().await, 0);
}

#[tokio::test]
async fn paused_members_do_not_stall_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(sh("sleep 30"), 5).await;
    engine.start().await;
    let coord = coordinator(&engine, Some(2)).await;
    coord.submit_batch(playlist("PL", dir.path(), 4)).await.unwrap();

    assert!(engine.pause("PL:v1").await);
    assert!(engine.pause("PL:v2").await);
    let c = &coord;
    until("queue drained", move || async move { c.waiting().await == 0 }).await;

    let e = &engine;
    until("v3 and v4 running", move || async move { e.active_count().await == 2 }).await;
    assert_eq!(engine.job("PL:v4").await.unwrap().status, JobStatus::Downloading);
    assert_eq!(coord.in_flight().await, 2);
    assert_eq!(engine.outstanding().await, 2);

    coord.cancel_batch("PL").await.unwrap();
}

#[tokio::test]
async fn unsubmitted_members_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    {
        let engine = engine_on(store.clone(), sh("sleep 30"), 3).await;
        engine.start().await;
        let coord = coordinator(&engine, Some(1)).await;
        coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
        assert_eq!(engine.snapshot().await.len(), 1);

        let saved = store.batch_snapshot();
        assert_eq!(saved.len(), 1);
        let waiting: Vec<&str> = saved[0]
            .members
            .iter()
            .filter(|m| m.waiting.is_some())
            .map(|m| m.job_id.as_str())
            .collect();
        assert_eq!(waiting, vec!["PL:v2", "PL:v3"]);

        engine.shutdown().await;
        // Let the coordinator see the pause before it goes away.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let engine = engine_on(store.clone(), sh("exit 0"), 3).await;
    let coord = coordinator(&engine, Some(1)).await;
    let p = coord.progress("PL").await.unwrap();
    assert_eq!(p.total, 3);
    assert_eq!(p.title.as_deref(), Some("Playlist PL"));
    assert_eq!(
        engine.snapshot().await.len() + coord.waiting().await,
        3,
        "every member is either in the engine or queued"
    );
    assert_eq!(engine.job("PL:v1").await.unwrap().status, JobStatus::Paused);

    engine.start().await;
    assert!(engine.resume("PL:v1").await);
    let done = finished(&coord, "PL").await;
    assert_eq!((done.completed, done.failed), (3, 0));
    let s = &store;
    until("finish recorded", move || async move {
        s.batch_snapshot()[0].finished_sent
    })
    .await;
    assert!(store.batch_snapshot()[0]
        .members
        .iter()
        .all(|m| m.waiting.is_none()));
}

#[tokio::test]
async fn removed_batches_are_not_restored() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    {
        let engine = engine_on(store.clone(), sh("exit 0"), 1).await;
        let coord = coordinator(&engine, Some(1)).await;
        coord.submit_batch(playlist("PL", dir.path(), 3)).await.unwrap();
        assert!(coord.remove_batch("PL").await);
        assert!(store.batch_snapshot().is_empty());
    }
    let engine = engine_on(store.clone(), sh("exit 0"), 1).await;
    let coord = coordinator(&engine, Some(1)).await;
    // The submitted member is still linked, so it is adopted on its own.
    let p = coord.progress("PL").await.unwrap();
    assert_eq!(p.total, 1);
    assert_eq!(coord.waiting().await, 0);
}
