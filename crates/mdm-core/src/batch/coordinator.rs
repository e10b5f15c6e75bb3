use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use super::types::{BatchEvent, BatchProgress, BatchRecord, BatchRequest, MemberRecord};
use crate::config::MdmConfig;
use crate::engine::{Engine, EngineError, EngineEvent};
use crate::job::{JobId, JobRequest, JobStatus};

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Member jobs of all batches allowed in flight at once. `None` hands
    /// every member straight to the engine.
    pub gate: Option<usize>,
    pub event_capacity: usize,
}

impl BatchOptions {
    pub fn from_config(cfg: &MdmConfig) -> Self {
        Self {
            gate: cfg.batch_concurrency,
            event_capacity: cfg.event_capacity,
        }
    }
}

/// Turns batch requests into member jobs, optionally gating how many are in
/// flight, and reports per-batch progress from engine events.
///
/// Batch records live in the engine's store next to its jobs, so members
/// still waiting for a slot survive a restart.
///
/// Lock order is coordinator state, then engine. The engine never calls back.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Engine,
    gate: Option<usize>,
    state: Mutex<CoordState>,
    events: broadcast::Sender<BatchEvent>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.listener.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct CoordState {
    batches: Vec<BatchEntry>,
    /// Member job id -> batch id.
    owner: HashMap<JobId, String>,
    /// Members not yet handed to the engine, FIFO across batches.
    waiting: VecDeque<JobId>,
    /// Member jobs holding a gate slot: submitted and neither paused nor
    /// finished. A resumed member takes a slot again.
    in_flight: HashSet<JobId>,
}

struct BatchEntry {
    id: String,
    title: Option<String>,
    members: Vec<MemberEntry>,
    last: Option<BatchProgress>,
    finished_sent: bool,
}

struct MemberEntry {
    job_id: JobId,
    phase: MemberPhase,
}

enum MemberPhase {
    Waiting(JobRequest),
    Observed(JobStatus),
    Removed,
}

impl MemberPhase {
    fn from_event(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Progress { status, .. } => MemberPhase::Observed(*status),
            EngineEvent::Completed { .. } => MemberPhase::Observed(JobStatus::Completed),
            EngineEvent::Error { .. } => MemberPhase::Observed(JobStatus::Error),
            EngineEvent::Removed { .. } => MemberPhase::Removed,
        }
    }

    fn holds_slot(&self) -> bool {
        matches!(self, MemberPhase::Observed(s) if !s.is_terminal() && *s != JobStatus::Paused)
    }
}

impl BatchEntry {
    fn progress(&self) -> BatchProgress {
        let mut p = BatchProgress {
            batch_id: self.id.clone(),
            title: self.title.clone(),
            total: self.members.len(),
            completed: 0,
            failed: 0,
            active: 0,
            finished: false,
        };
        for m in &self.members {
            if let MemberPhase::Observed(status) = m.phase {
                match status {
                    JobStatus::Completed => p.completed += 1,
                    JobStatus::Error => p.failed += 1,
                    s if s.is_active() => p.active += 1,
                    _ => {}
                }
            }
        }
        p.finished = p.total > 0 && p.completed + p.failed == p.total;
        p
    }

    fn member_mut(&mut self, job_id: &str) -> Option<&mut MemberEntry> {
        self.members.iter_mut().find(|m| m.job_id == job_id)
    }

    fn record(&self) -> BatchRecord {
        BatchRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            finished_sent: self.finished_sent,
            members: self
                .members
                .iter()
                .map(|m| MemberRecord {
                    job_id: m.job_id.clone(),
                    waiting: match &m.phase {
                        MemberPhase::Waiting(request) => Some(request.clone()),
                        _ => None,
                    },
                })
                .collect(),
        }
    }
}

impl CoordState {
    fn batch(&self, id: &str) -> Option<&BatchEntry> {
        self.batches.iter().find(|b| b.id == id)
    }

    fn batch_mut(&mut self, id: &str) -> Option<&mut BatchEntry> {
        self.batches.iter_mut().find(|b| b.id == id)
    }

    fn member_mut(&mut self, job_id: &str) -> Option<&mut MemberEntry> {
        let batch_id = self.owner.get(job_id)?.clone();
        self.batch_mut(&batch_id)?.member_mut(job_id)
    }

    fn recount_in_flight(&mut self) {
        self.in_flight = self
            .batches
            .iter()
            .flat_map(|b| &b.members)
            .filter(|m| m.phase.holds_slot())
            .map(|m| m.job_id.clone())
            .collect();
    }
}

impl BatchCoordinator {
    /// Attach to `engine` and restore the batches saved in its store. Members
    /// that were still waiting are queued again in batch then member order.
    /// Linked jobs with no saved batch are adopted into one.
    pub async fn new(engine: Engine, options: BatchOptions) -> Self {
        let events_rx = engine.subscribe();
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let inner = Arc::new(Inner {
            engine,
            gate: options.gate.map(|g| g.max(1)),
            state: Mutex::new(CoordState::default()),
            events,
            listener: std::sync::Mutex::new(None),
        });
        {
            let mut st = inner.state.lock().await;
            inner.restore(&mut st).await;
            inner.pump(&mut st).await;
            inner.persist(&st).await;
        }
        let task = spawn_listener(Arc::downgrade(&inner), events_rx);
        *inner.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.inner.events.subscribe()
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Register a batch and queue its selected members in member order.
    /// Submitting an id again queues only members that are not already
    /// tracked (or were cancelled).
    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchProgress, EngineError> {
        request.validate().map_err(EngineError::InvalidRequest)?;
        if request.selected().next().is_none() {
            return Err(EngineError::InvalidRequest(format!(
                "batch {}: no members selected",
                request.id
            )));
        }
        let mut st = self.inner.lock().await;
        if st.batch(&request.id).is_none() {
            st.batches.push(BatchEntry {
                id: request.id.clone(),
                title: request.title.clone(),
                members: Vec::new(),
                last: None,
                finished_sent: false,
            });
        }
        let mut queued = Vec::new();
        if let Some(entry) = st.batch_mut(&request.id) {
            if request.title.is_some() {
                entry.title = request.title.clone();
            }
            for member in request.selected() {
                let job = request.job_request(member);
                let job_id = job.id.clone();
                match entry.member_mut(&job_id) {
                    Some(m) if !matches!(m.phase, MemberPhase::Removed) => continue,
                    Some(m) => m.phase = MemberPhase::Waiting(job),
                    None => entry.members.push(MemberEntry {
                        job_id: job_id.clone(),
                        phase: MemberPhase::Waiting(job),
                    }),
                }
                queued.push(job_id);
            }
            if !queued.is_empty() {
                entry.finished_sent = false;
            }
        }
        for job_id in &queued {
            st.owner.insert(job_id.clone(), request.id.clone());
            st.waiting.push_back(job_id.clone());
        }
        tracing::info!(
            batch_id = %request.id,
            queued = queued.len(),
            gate = ?self.inner.gate,
            "batch submitted"
        );
        self.inner.pump(&mut st).await;
        self.inner.refresh_all(&mut st);
        self.inner.persist(&st).await;
        Ok(st
            .batch(&request.id)
            .map(BatchEntry::progress)
            .unwrap_or_else(|| empty_progress(&request.id)))
    }

    /// Drop the batch's unsubmitted members and cancel its submitted ones.
    /// Returns how many members were affected.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<usize, EngineError> {
        let mut st = self.inner.lock().await;
        let Some(entry) = st.batch_mut(batch_id) else {
            return Err(EngineError::UnknownBatch(batch_id.to_string()));
        };
        let mut dropped = HashSet::new();
        for m in &mut entry.members {
            if matches!(m.phase, MemberPhase::Waiting(_)) {
                m.phase = MemberPhase::Removed;
                dropped.insert(m.job_id.clone());
            }
        }
        st.waiting.retain(|id| !dropped.contains(id));
        let cancelled = self.inner.engine.cancel_batch(batch_id).await;
        tracing::info!(
            batch_id,
            dropped = dropped.len(),
            cancelled,
            "batch cancelled"
        );
        self.inner.refresh_all(&mut st);
        self.inner.persist(&st).await;
        Ok(dropped.len() + cancelled)
    }

    /// Forget a batch. Unsubmitted members are dropped; submitted jobs stay
    /// in the engine as plain jobs.
    pub async fn remove_batch(&self, batch_id: &str) -> bool {
        let mut st = self.inner.lock().await;
        let Some(pos) = st.batches.iter().position(|b| b.id == batch_id) else {
            return false;
        };
        let entry = st.batches.remove(pos);
        let ids: HashSet<JobId> = entry.members.into_iter().map(|m| m.job_id).collect();
        st.owner.retain(|id, _| !ids.contains(id));
        st.waiting.retain(|id| !ids.contains(id));
        // Plain jobs don't count against the gate.
        st.in_flight.retain(|id| !ids.contains(id));
        tracing::debug!(batch_id, "batch forgotten");
        self.inner.pump(&mut st).await;
        self.inner.refresh_all(&mut st);
        self.inner.persist(&st).await;
        true
    }

    pub async fn progress(&self, batch_id: &str) -> Option<BatchProgress> {
        self.inner.lock().await.batch(batch_id).map(BatchEntry::progress)
    }

    pub async fn batches(&self) -> Vec<BatchProgress> {
        self.inner
            .lock()
            .await
            .batches
            .iter()
            .map(BatchEntry::progress)
            .collect()
    }

    /// Members holding a gate slot.
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Members still waiting for a gate slot.
    pub async fn waiting(&self) -> usize {
        self.inner.lock().await.waiting.len()
    }

    /// Resolve with the batch's final counters once it finishes. `None` if
    /// the batch is unknown or the coordinator went away.
    pub async fn wait_finished(&self, batch_id: &str) -> Option<BatchProgress> {
        let mut rx = self.subscribe();
        let current = self.progress(batch_id).await?;
        if current.finished {
            return Some(current);
        }
        loop {
            match rx.recv().await {
                Ok(BatchEvent::Finished(p)) if p.batch_id == batch_id => return Some(p),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    let current = self.progress(batch_id).await?;
                    if current.finished {
                        return Some(current);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

fn empty_progress(batch_id: &str) -> BatchProgress {
    BatchProgress {
        batch_id: batch_id.to_string(),
        title: None,
        total: 0,
        completed: 0,
        failed: 0,
        active: 0,
        finished: false,
    }
}

fn spawn_listener(inner: Weak<Inner>, mut rx: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = rx.recv().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match received {
                Ok(event) => inner.on_event(event).await,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("batch listener fell behind by {} events; resyncing", n);
                    inner.resync().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

impl Inner {
    async fn lock(&self) -> MutexGuard<'_, CoordState> {
        self.state.lock().await
    }

    async fn restore(&self, st: &mut CoordState) {
        let records = match self.engine.store().load_batches().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("failed to load batch records: {:#}", e);
                Vec::new()
            }
        };
        let jobs = self.engine.snapshot().await;
        let status: HashMap<&str, JobStatus> = jobs.iter().map(|j| (j.id(), j.status)).collect();

        for record in records {
            let mut entry = BatchEntry {
                id: record.id,
                title: record.title,
                members: Vec::with_capacity(record.members.len()),
                last: None,
                finished_sent: record.finished_sent,
            };
            for m in record.members {
                let phase = match (status.get(m.job_id.as_str()), m.waiting) {
                    (Some(s), _) => MemberPhase::Observed(*s),
                    (None, Some(request)) => {
                        st.waiting.push_back(m.job_id.clone());
                        MemberPhase::Waiting(request)
                    }
                    (None, None) => MemberPhase::Removed,
                };
                st.owner.insert(m.job_id.clone(), entry.id.clone());
                entry.members.push(MemberEntry {
                    job_id: m.job_id,
                    phase,
                });
            }
            st.batches.push(entry);
        }

        let mut adopted = HashSet::new();
        for job in &jobs {
            let Some(link) = &job.request.batch else {
                continue;
            };
            if st.owner.contains_key(job.id()) {
                continue;
            }
            if st.batch(&link.batch_id).is_none() {
                st.batches.push(BatchEntry {
                    id: link.batch_id.clone(),
                    title: None,
                    members: Vec::new(),
                    last: None,
                    finished_sent: false,
                });
                adopted.insert(link.batch_id.clone());
            }
            if let Some(entry) = st.batch_mut(&link.batch_id) {
                entry.members.push(MemberEntry {
                    job_id: job.id().to_string(),
                    phase: MemberPhase::Observed(job.status),
                });
            }
            st.owner.insert(job.id().to_string(), link.batch_id.clone());
        }
        for entry in &mut st.batches {
            if adopted.contains(&entry.id) {
                // Already finished before we attached; don't announce again.
                entry.finished_sent = entry.progress().finished;
            }
        }
        st.recount_in_flight();
        if !st.batches.is_empty() {
            tracing::info!(
                batches = st.batches.len(),
                waiting = st.waiting.len(),
                "restored batches"
            );
        }
    }

    async fn persist(&self, st: &CoordState) {
        let records: Vec<BatchRecord> = st.batches.iter().map(BatchEntry::record).collect();
        if let Err(e) = self.engine.store().save_batches(&records).await {
            tracing::warn!("failed to persist batch records: {:#}", e);
        }
    }

    async fn on_event(&self, event: EngineEvent) {
        let mut st = self.lock().await;
        let id = event.job_id().to_string();
        let phase = MemberPhase::from_event(&event);
        let released = !phase.holds_slot() && st.in_flight.remove(&id);
        let mut announced = false;
        let owned = st.owner.get(&id).cloned();
        if let Some(batch_id) = owned {
            // A resumed or retried member re-enters the engine outside the
            // gate and counts against it again.
            if phase.holds_slot() {
                st.in_flight.insert(id.clone());
            }
            if let Some(member) = st.member_mut(&id) {
                if !matches!(member.phase, MemberPhase::Waiting(_)) {
                    member.phase = phase;
                }
            }
            if let Some(entry) = st.batch_mut(&batch_id) {
                announced = self.refresh(entry);
            }
        }
        if released {
            self.pump(&mut st).await;
            announced |= self.refresh_all(&mut st);
        }
        if released || announced {
            self.persist(&st).await;
        }
    }

    /// Rebuild member phases and slots from the engine after missed events.
    async fn resync(&self) {
        let mut st = self.lock().await;
        let jobs: HashMap<JobId, JobStatus> = self
            .engine
            .snapshot()
            .await
            .into_iter()
            .map(|j| (j.request.id, j.status))
            .collect();
        for entry in &mut st.batches {
            for m in &mut entry.members {
                if matches!(m.phase, MemberPhase::Waiting(_)) {
                    continue;
                }
                m.phase = match jobs.get(&m.job_id) {
                    Some(status) => MemberPhase::Observed(*status),
                    None => MemberPhase::Removed,
                };
            }
        }
        st.recount_in_flight();
        self.pump(&mut st).await;
        self.refresh_all(&mut st);
        self.persist(&st).await;
    }

    /// Hand waiting members to the engine while the gate has room.
    async fn pump(&self, st: &mut CoordState) {
        loop {
            if self.gate.is_some_and(|limit| st.in_flight.len() >= limit) {
                break;
            }
            let Some(job_id) = st.waiting.pop_front() else {
                break;
            };
            let request = match st.member_mut(&job_id) {
                Some(m) => match std::mem::replace(&mut m.phase, MemberPhase::Removed) {
                    MemberPhase::Waiting(request) => request,
                    other => {
                        m.phase = other;
                        continue;
                    }
                },
                None => continue,
            };
            let phase = match self.engine.submit(request).await {
                Ok(job) => MemberPhase::Observed(job.status),
                Err(EngineError::DuplicateJob(_)) => match self.engine.job(&job_id).await {
                    Some(job) => MemberPhase::Observed(job.status),
                    None => MemberPhase::Removed,
                },
                Err(e) => {
                    tracing::warn!(job_id = %job_id, "batch member rejected: {}", e);
                    MemberPhase::Observed(JobStatus::Error)
                }
            };
            if phase.holds_slot() {
                st.in_flight.insert(job_id.clone());
            }
            if let Some(m) = st.member_mut(&job_id) {
                m.phase = phase;
            }
        }
    }

    fn refresh_all(&self, st: &mut CoordState) -> bool {
        let mut announced = false;
        for entry in &mut st.batches {
            announced |= self.refresh(entry);
        }
        announced
    }

    /// Emit `Progress` when the counters moved and `Finished` the first time
    /// the batch completes. Returns whether `Finished` went out.
    fn refresh(&self, entry: &mut BatchEntry) -> bool {
        let p = entry.progress();
        if entry.last.as_ref() == Some(&p) {
            return false;
        }
        entry.last = Some(p.clone());
        let _ = self.events.send(BatchEvent::Progress(p.clone()));
        if p.finished && !entry.finished_sent {
            entry.finished_sent = true;
            tracing::info!(
                batch_id = %p.batch_id,
                completed = p.completed,
                failed = p.failed,
                "batch finished"
            );
            let _ = self.events.send(BatchEvent::Finished(p));
            return true;
        }
        false
    }
}
