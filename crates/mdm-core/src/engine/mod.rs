//! Single-job engine: bounded pool of tool processes over a FIFO queue.
//!
//! All queue mutation (submit, admit, mark terminal, pause, cancel) happens
//! under one async mutex. Each active job has its own pump task that reads
//! the process output and takes the lock only to apply an update; the pump
//! applies its result only if its run is still the job's active run, so a
//! pause or cancel that got there first wins.
//!
//! Waiting for a killed process to be reaped happens outside the lock. The
//! run sits in the `stopping` table meanwhile and keeps its slot.
//!
//! Events fan out over a broadcast channel; a slow subscriber lags and never
//! blocks job processing.

mod artifacts;
mod error;
mod events;
mod run;
mod state;

pub use error::EngineError;
pub use events::{EngineEvent, JobOutcome};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::config::MdmConfig;
use crate::job::{Job, JobId, JobRequest, JobStatus, Progress};
use crate::services::Collaborators;
use crate::store::JobStore;
use state::EngineState;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Slot limit. Values below 1 are treated as 1.
    pub max_concurrent: usize,
    pub stderr_tail_lines: usize,
    pub event_capacity: usize,
}

impl EngineOptions {
    pub fn from_config(cfg: &MdmConfig) -> Self {
        Self {
            max_concurrent: cfg.max_concurrent_downloads,
            stderr_tail_lines: cfg.stderr_tail_lines,
            event_capacity: cfg.event_capacity,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&MdmConfig::default())
    }
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<EngineState>,
    store: Arc<dyn JobStore>,
    services: Collaborators,
    events: broadcast::Sender<EngineEvent>,
    limit: usize,
    tail_lines: usize,
    next_run_id: AtomicU64,
}

impl Engine {
    /// Load persisted jobs and recover them (running -> paused). Nothing is
    /// admitted until [`Engine::start`].
    pub async fn open(
        store: Arc<dyn JobStore>,
        services: Collaborators,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let persisted = store.load().await.map_err(EngineError::Store)?;
        let (state, changed) = EngineState::recover(persisted);
        if changed {
            store.save(&state.jobs).await.map_err(EngineError::Store)?;
        }
        tracing::info!(
            jobs = state.jobs.len(),
            limit = options.max_concurrent.max(1),
            "engine opened"
        );

        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                store,
                services,
                events,
                limit: options.max_concurrent.max(1),
                tail_lines: options.stderr_tail_lines.max(1),
                next_run_id: AtomicU64::new(1),
            }),
        })
    }

    /// Begin admitting pending jobs.
    pub async fn start(&self) {
        let mut st = self.lock().await;
        if st.started {
            return;
        }
        st.started = true;
        self.admit(&mut st);
        self.persist(&st).await;
    }

    /// Stop admitting and pause every active job. Returns how many were paused.
    pub async fn shutdown(&self) -> usize {
        let mut st = self.lock().await;
        st.started = false;
        let ids: Vec<JobId> = st
            .active
            .keys()
            .chain(st.stopping.keys())
            .cloned()
            .collect();
        let mut st = self.stop_processes(st, &ids).await;
        let mut count = 0;
        for id in &ids {
            if let Some(job) = st.get_mut(id).filter(|j| j.status.is_active()) {
                job.status = JobStatus::Paused;
                job.clear_transfer_stats();
                let event = EngineEvent::progress_of(job);
                self.emit(event);
                count += 1;
            }
        }
        self.persist(&st).await;
        if count > 0 {
            tracing::info!("engine shut down; paused {} active jobs", count);
        }
        count
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Validate, queue as `pending` and run admission. Never rejects because
    /// of the slot limit. Returns the job as it stands after admission.
    pub async fn submit(&self, request: JobRequest) -> Result<Job, EngineError> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        let mut st = self.lock().await;
        if st.index_of(&request.id).is_some() {
            return Err(EngineError::DuplicateJob(request.id));
        }
        let job = Job::new(request);
        tracing::info!(
            job_id = %job.id(),
            kind = job.request.kind.as_str(),
            "job submitted"
        );
        st.jobs.push(job.clone());
        self.emit(EngineEvent::progress_of(&job));
        self.admit(&mut st);
        self.persist(&st).await;
        Ok(st.get(job.id()).cloned().unwrap_or(job))
    }

    /// `pending` or active -> `paused`. Unknown ids and other states are a no-op.
    pub async fn pause(&self, id: &str) -> bool {
        let mut st = self.lock().await;
        match st.get(id).map(|j| j.status) {
            Some(JobStatus::Pending) => {}
            Some(s) if s.is_active() => st = self.stop_processes(st, &[id.to_string()]).await,
            _ => return false,
        }
        // Another caller may have settled the job while its process stopped.
        let Some(job) = st
            .get_mut(id)
            .filter(|j| j.status == JobStatus::Pending || j.status.is_active())
        else {
            return false;
        };
        job.status = JobStatus::Paused;
        job.clear_transfer_stats();
        let event = EngineEvent::progress_of(job);
        self.emit(event);
        tracing::info!(job_id = %id, "job paused");
        self.admit(&mut st);
        self.persist(&st).await;
        true
    }

    /// `paused` -> `pending`. The job keeps its original queue position.
    pub async fn resume(&self, id: &str) -> bool {
        let mut st = self.lock().await;
        let Some(job) = st.get_mut(id) else {
            return false;
        };
        if job.status != JobStatus::Paused {
            return false;
        }
        job.status = JobStatus::Pending;
        let event = EngineEvent::progress_of(job);
        self.emit(event);
        tracing::info!(job_id = %id, "job resumed");
        self.admit(&mut st);
        self.persist(&st).await;
        true
    }

    /// Remove a job. An active process is terminated and reaped before its
    /// partial files are deleted and `removed` is emitted. For a finished job
    /// this only evicts it from history. Unknown ids are a no-op.
    pub async fn cancel(&self, id: &str) -> bool {
        let st = self.lock().await;
        if st.index_of(id).is_none() {
            return false;
        }
        let mut st = self.stop_processes(st, &[id.to_string()]).await;
        if !self.evict(&mut st, id) {
            return false;
        }
        self.admit(&mut st);
        self.persist(&st).await;
        true
    }

    /// Cancel every unfinished job whose id starts with `prefix`.
    pub async fn cancel_by_prefix(&self, prefix: &str) -> usize {
        if prefix.is_empty() {
            return 0;
        }
        self.cancel_where(|job| job.request.id.starts_with(prefix))
            .await
    }

    /// Cancel every unfinished job derived from `batch_id`.
    pub async fn cancel_batch(&self, batch_id: &str) -> usize {
        self.cancel_where(|job| {
            job.request
                .batch
                .as_ref()
                .is_some_and(|link| link.batch_id == batch_id)
        })
        .await
    }

    /// Evict a `completed`/`error` job from history. Files are kept.
    pub async fn remove(&self, id: &str) -> bool {
        let mut st = self.lock().await;
        if !st.get(id).is_some_and(|j| j.status.is_terminal()) {
            return false;
        }
        self.evict(&mut st, id);
        self.persist(&st).await;
        true
    }

    /// Evict every finished job. Returns how many were removed.
    pub async fn clear_finished(&self) -> usize {
        let mut st = self.lock().await;
        let finished: Vec<JobId> = st
            .jobs
            .iter()
            .filter(|j| j.status.is_terminal())
            .map(|j| j.request.id.clone())
            .collect();
        for id in &finished {
            self.evict(&mut st, id);
        }
        if !finished.is_empty() {
            self.persist(&st).await;
        }
        finished.len()
    }

    /// `error` -> `pending` at the job's original queue position.
    pub async fn retry(&self, id: &str) -> bool {
        let mut st = self.lock().await;
        let Some(job) = st.get_mut(id) else {
            return false;
        };
        if job.status != JobStatus::Error {
            return false;
        }
        job.status = JobStatus::Pending;
        job.progress = Progress::default();
        job.last_error = None;
        job.log_path = None;
        job.clear_transfer_stats();
        let event = EngineEvent::progress_of(job);
        self.emit(event);
        tracing::info!(job_id = %id, "job queued for retry");
        self.admit(&mut st);
        self.persist(&st).await;
        true
    }

    pub async fn snapshot(&self) -> Vec<Job> {
        self.lock().await.jobs.clone()
    }

    pub async fn job(&self, id: &str) -> Option<Job> {
        self.lock().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.lock().await.active.len()
    }

    /// Jobs that are pending or running.
    pub async fn outstanding(&self) -> usize {
        self.lock()
            .await
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending || j.status.is_active())
            .count()
    }

    /// Resolve once `id` completes, fails or is removed. The subscription
    /// lives only as long as this call. `None` if the engine went away.
    pub async fn wait_for_terminal(&self, id: &str) -> Option<JobOutcome> {
        let mut rx = self.subscribe();
        if let Some(outcome) = self.current_outcome(id).await {
            return Some(outcome);
        }
        loop {
            match rx.recv().await {
                Ok(event) if event.job_id() == id => match event {
                    EngineEvent::Completed { .. } => return Some(JobOutcome::Completed),
                    EngineEvent::Error { message, .. } => return Some(JobOutcome::Failed(message)),
                    EngineEvent::Removed { .. } => return Some(JobOutcome::Removed),
                    EngineEvent::Progress { .. } => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(outcome) = self.current_outcome(id).await {
                        return Some(outcome);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn current_outcome(&self, id: &str) -> Option<JobOutcome> {
        let st = self.lock().await;
        match st.get(id) {
            None => Some(JobOutcome::Removed),
            Some(job) => match job.status {
                JobStatus::Completed => Some(JobOutcome::Completed),
                JobStatus::Error => Some(JobOutcome::Failed(
                    job.last_error.clone().unwrap_or_default(),
                )),
                _ => None,
            },
        }
    }

    async fn cancel_where<F>(&self, matches: F) -> usize
    where
        F: Fn(&Job) -> bool,
    {
        let st = self.lock().await;
        let ids: Vec<JobId> = st
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal() && matches(j))
            .map(|j| j.request.id.clone())
            .collect();
        let mut st = self.stop_processes(st, &ids).await;
        let mut cancelled = 0;
        for id in &ids {
            if self.evict(&mut st, id) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.admit(&mut st);
            self.persist(&st).await;
        }
        cancelled
    }

    /// Kill the processes of `ids` and wait until they are gone. The lock is
    /// released while waiting; the runs hold their slots in `stopping` until
    /// then. Loops because a job can be admitted again while unlocked.
    async fn stop_processes<'a>(
        &'a self,
        mut st: MutexGuard<'a, EngineState>,
        ids: &[JobId],
    ) -> MutexGuard<'a, EngineState> {
        loop {
            let mut handles = Vec::new();
            for id in ids {
                if let Some(run) = st.active.remove(id) {
                    st.stopping.insert(id.clone(), run.handle);
                }
                if let Some(handle) = st.stopping.get(id) {
                    // Signal every process first so they die together.
                    handle.terminate();
                    handles.push((id.clone(), handle.clone()));
                }
            }
            if handles.is_empty() {
                return st;
            }
            drop(st);
            for (id, handle) in &handles {
                let report = handle.terminated().await;
                tracing::debug!(job_id = %id, code = ?report.code, killed = report.killed, "process stopped");
            }
            st = self.lock().await;
            for (id, _) in &handles {
                st.stopping.remove(id);
            }
        }
    }

    /// Evict `id`; for an unfinished job also delete partial output. The
    /// job's process must already be gone. Caller admits and persists.
    fn evict(&self, st: &mut EngineState, id: &str) -> bool {
        let Some(idx) = st.index_of(id) else {
            return false;
        };
        debug_assert!(!st.has_process(id));
        let job = st.jobs.remove(idx);
        if !job.status.is_terminal() {
            if job.has_run {
                let deleted =
                    artifacts::delete_partial_files(&job.request.output_dir, &job.request.base_name);
                tracing::debug!(job_id = %id, deleted, "removed partial output");
            }
            self.inner.services.log_sink.discard(id);
        }
        tracing::info!(job_id = %id, was = %job.status, "job removed");
        self.emit(EngineEvent::Removed { id: id.to_string() });
        true
    }

    async fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().await
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn persist(&self, st: &EngineState) {
        if let Err(e) = self.inner.store.save(&st.jobs).await {
            tracing::warn!("failed to persist job queue: {:#}", e);
        }
    }
}
