//! Admission, launch and the per-job output pump.

use std::sync::atomic::Ordering;

use super::events::EngineEvent;
use super::state::{ActiveRun, EngineState};
use super::Engine;
use crate::classify::{classify, failure_message, FailureKind};
use crate::command::CommandPlan;
use crate::job::{JobId, JobKind, JobRequest, JobStatus, Progress};
use crate::progress::{LineParser, Phase, ProgressUpdate};
use crate::supervisor::{self, ExitReport, LaunchFailure, ProcessHandle, ProcessOutput};

impl Engine {
    /// Promote pending jobs in FIFO order while slots are free.
    pub(super) fn admit(&self, st: &mut EngineState) {
        if !st.started {
            return;
        }
        while let Some(idx) = st.next_admissible(self.inner.limit) {
            self.launch(st, idx);
        }
    }

    /// Start the process for `st.jobs[idx]`. A launch failure puts the job
    /// straight into `error` and frees the slot.
    fn launch(&self, st: &mut EngineState, idx: usize) {
        let spawned = self.spawn_for(&st.jobs[idx].request);
        let job = &mut st.jobs[idx];
        let id = job.request.id.clone();
        match spawned {
            Ok((handle, output)) => {
                let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
                job.status = JobStatus::Downloading;
                job.progress = Progress::default();
                job.total_size = None;
                job.last_error = None;
                job.log_path = None;
                job.has_run = true;
                job.clear_transfer_stats();
                let kind = job.request.kind;
                tracing::info!(job_id = %id, run_id, pid = ?handle.pid(), "job started");
                self.emit(EngineEvent::progress_of(job));
                st.active.insert(id.clone(), ActiveRun { run_id, handle });
                tokio::spawn(self.clone().pump(id, run_id, kind, output));
            }
            Err(failure) => {
                let sink = &self.inner.services.log_sink;
                sink.open(&id).note(&format!("Launch failed: {failure}"));
                let message = failure.user_message();
                tracing::warn!(job_id = %id, "launch failed: {}", failure);
                job.status = JobStatus::Error;
                job.last_error = Some(message.clone());
                job.log_path = sink.path_for(&id);
                job.clear_transfer_stats();
                self.emit(EngineEvent::Error {
                    id,
                    message,
                    log_path: job.log_path.clone(),
                });
            }
        }
    }

    fn spawn_for(
        &self,
        request: &JobRequest,
    ) -> Result<(ProcessHandle, ProcessOutput), LaunchFailure> {
        let services = &self.inner.services;
        let cookie_args = match request.kind {
            JobKind::SimpleFetch => services.cookies.extra_args(&request.source),
            JobKind::StreamRemux => Vec::new(),
        };
        let plan = CommandPlan::for_request(request, cookie_args);
        let tool = services.resolver.resolve(plan.tool)?;
        std::fs::create_dir_all(&request.output_dir).map_err(|source| {
            LaunchFailure::OutputDirectory {
                path: request.output_dir.clone(),
                source,
            }
        })?;
        let spec = plan.into_launch(tool);
        let log = services.log_sink.open(&request.id);
        supervisor::start(&spec, log, self.inner.tail_lines)
    }

    /// Drain one run's output, then report its exit.
    async fn pump(self, id: JobId, run_id: u64, kind: JobKind, mut output: ProcessOutput) {
        let mut parser = LineParser::new(kind);
        while let Some(line) = output.next_line().await {
            if let Some(update) = parser.parse_line(line.stream, &line.text) {
                self.apply_progress(&id, run_id, update).await;
            }
        }
        let report = output.finish().await;
        self.finish_run(&id, run_id, report).await;
    }

    async fn apply_progress(&self, id: &str, run_id: u64, update: ProgressUpdate) {
        let mut st = self.lock().await;
        if !st.owns_run(id, run_id) {
            return;
        }
        let Some(job) = st.get_mut(id) else {
            return;
        };
        let mut status_changed = false;
        match update.phase {
            Phase::Converting => {
                status_changed = job.status != JobStatus::Converting;
                job.status = JobStatus::Converting;
                job.progress = update.progress;
                job.clear_transfer_stats();
            }
            // Post-processing has started; late transfer lines don't undo it.
            Phase::Downloading if job.status == JobStatus::Converting => return,
            Phase::Downloading => {
                job.progress = update.progress;
                if update.speed.is_some() {
                    job.speed = update.speed;
                }
                if update.eta.is_some() {
                    job.eta = update.eta;
                }
                if update.total_size.is_some() {
                    job.total_size = update.total_size;
                }
            }
        }
        let event = EngineEvent::progress_of(job);
        self.emit(event);
        if status_changed {
            tracing::debug!(job_id = %id, "post-processing");
            self.persist(&st).await;
        }
    }

    /// Terminal transition for a run that exited on its own. Ignored when a
    /// pause or cancel already took the run.
    async fn finish_run(&self, id: &str, run_id: u64, report: ExitReport) {
        let mut st = self.lock().await;
        if st.take_run(id, run_id).is_none() {
            tracing::debug!(job_id = %id, run_id, "exit of a stopped run ignored");
            return;
        }
        let services = &self.inner.services;
        if let Some(job) = st.get_mut(id) {
            job.clear_transfer_stats();
            if report.success() {
                job.status = JobStatus::Completed;
                job.progress = Progress::Percent(100.0);
                job.last_error = None;
                job.log_path = None;
                services.log_sink.discard(id);
                tracing::info!(job_id = %id, "job completed");
                self.emit(EngineEvent::Completed {
                    id: id.to_string(),
                    output_dir: job.request.output_dir.clone(),
                });
            } else {
                let kind = classify(&report.stderr_tail);
                if kind == FailureKind::VerificationChallenge {
                    services.cookies.record_challenge(&job.request.source);
                }
                let message = failure_message(kind, report.code);
                tracing::warn!(
                    job_id = %id,
                    failure = kind.as_str(),
                    code = ?report.code,
                    "job failed: {}",
                    message
                );
                job.status = JobStatus::Error;
                job.last_error = Some(message.clone());
                job.log_path = services.log_sink.path_for(id);
                self.emit(EngineEvent::Error {
                    id: id.to_string(),
                    message,
                    log_path: job.log_path.clone(),
                });
            }
        }
        self.admit(&mut st);
        self.persist(&st).await;
    }
}
