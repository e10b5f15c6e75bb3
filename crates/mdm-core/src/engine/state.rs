//! Queue state owned by the engine lock.

use std::collections::HashMap;

use crate::job::{Job, JobId, JobStatus};
use crate::supervisor::ProcessHandle;

/// The live process of an active job. `run_id` tells a stale pump (whose run
/// was paused or cancelled meanwhile) from the current one.
pub(crate) struct ActiveRun {
    pub(crate) run_id: u64,
    pub(crate) handle: ProcessHandle,
}

#[derive(Default)]
pub(crate) struct EngineState {
    /// Submission order; admission scans it front to back.
    pub(crate) jobs: Vec<Job>,
    pub(crate) active: HashMap<JobId, ActiveRun>,
    /// Runs told to stop whose process is not confirmed gone yet. They keep
    /// their slot.
    pub(crate) stopping: HashMap<JobId, ProcessHandle>,
    pub(crate) started: bool,
}

impl EngineState {
    /// Rebuild from persisted jobs. No process survives a restart, so
    /// anything recorded as running comes back paused. Later duplicates of an
    /// id are dropped. Returns the state and whether anything was changed.
    pub(crate) fn recover(jobs: Vec<Job>) -> (Self, bool) {
        let mut changed = false;
        let mut seen = std::collections::HashSet::new();
        let mut kept = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            if !seen.insert(job.request.id.clone()) {
                tracing::warn!(job_id = %job.id(), "dropping duplicate persisted job");
                changed = true;
                continue;
            }
            if job.status.is_active() {
                tracing::info!(job_id = %job.id(), "recovered {} job as paused", job.status);
                job.status = JobStatus::Paused;
                job.clear_transfer_stats();
                changed = true;
            }
            kept.push(job);
        }
        let state = Self {
            jobs: kept,
            ..Self::default()
        };
        (state, changed)
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.request.id == id)
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.request.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.request.id == id)
    }

    pub(crate) fn slots_used(&self) -> usize {
        self.active.len() + self.stopping.len()
    }

    /// Whether `id` still has a process that may be alive.
    pub(crate) fn has_process(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.stopping.contains_key(id)
    }

    /// First pending job in FIFO order, if a slot is free.
    pub(crate) fn next_admissible(&self, limit: usize) -> Option<usize> {
        if self.slots_used() >= limit {
            return None;
        }
        self.jobs
            .iter()
            .position(|j| j.status == JobStatus::Pending && !self.has_process(&j.request.id))
    }

    /// Remove the active run if it belongs to `run_id`. This is the single
    /// terminal-transition guard: whoever takes the run owns the outcome.
    pub(crate) fn take_run(&mut self, id: &str, run_id: u64) -> Option<ActiveRun> {
        match self.active.get(id) {
            Some(run) if run.run_id == run_id => self.active.remove(id),
            _ => None,
        }
    }

    pub(crate) fn owns_run(&self, id: &str, run_id: u64) -> bool {
        self.active.get(id).is_some_and(|r| r.run_id == run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, JobRequest, MediaSelector};
    use std::path::PathBuf;

    fn job(id: &str, status: JobStatus) -> Job {
        let mut j = Job::new(JobRequest {
            id: id.to_string(),
            source: format!("https://example.com/{id}"),
            output_dir: PathBuf::from("/tmp"),
            base_name: id.to_string(),
            kind: JobKind::SimpleFetch,
            media: MediaSelector::default(),
            batch: None,
        });
        j.status = status;
        j
    }

    #[test]
    fn recover_pauses_running_jobs_and_drops_duplicates() {
        let mut running = job("b", JobStatus::Downloading);
        running.speed = Some("1MiB/s".to_string());
        let (state, changed) = EngineState::recover(vec![
            job("a", JobStatus::Pending),
            running,
            job("c", JobStatus::Converting),
            job("a", JobStatus::Completed),
        ]);
        assert!(changed);
        let statuses: Vec<_> = state.jobs.iter().map(|j| (j.id(), j.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("a", JobStatus::Pending),
                ("b", JobStatus::Paused),
                ("c", JobStatus::Paused)
            ]
        );
        assert!(state.jobs[1].speed.is_none());
        assert!(!state.started);
        assert!(state.active.is_empty());
    }

    #[test]
    fn recover_clean_state_reports_unchanged() {
        let (_, changed) = EngineState::recover(vec![
            job("a", JobStatus::Pending),
            job("b", JobStatus::Error),
        ]);
        assert!(!changed);
    }

    #[test]
    fn admission_is_fifo_over_pending_only() {
        let (state, _) = EngineState::recover(vec![
            job("a", JobStatus::Completed),
            job("b", JobStatus::Paused),
            job("c", JobStatus::Pending),
            job("d", JobStatus::Pending),
        ]);
        assert_eq!(state.next_admissible(1), Some(2));
        assert_eq!(state.next_admissible(0), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stopping_runs_keep_their_slot() {
        use crate::services::{LogSink, NullLogSink};

        let (mut state, _) = EngineState::recover(vec![
            job("a", JobStatus::Downloading),
            job("b", JobStatus::Pending),
        ]);
        let spec = crate::supervisor::LaunchSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exit 0".to_string()],
        };
        let (handle, _out) =
            crate::supervisor::start(&spec, NullLogSink.open("a"), 4).unwrap();
        state.stopping.insert("a".to_string(), handle);
        assert!(state.has_process("a"));
        assert_eq!(state.next_admissible(1), None);
        assert_eq!(state.next_admissible(2), Some(1));
    }
}
