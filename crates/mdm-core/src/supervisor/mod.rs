//! Process supervisor: one child process per active job.
//!
//! `start` spawns the tool and returns a pair:
//! - [`ProcessHandle`]: cloneable; `terminate()` kills the process group and
//!   `terminated()` resolves once the child is reaped and its pipes drained.
//! - [`ProcessOutput`]: owned by the job's pump; yields output lines in order
//!   (mirrored to the job log) and finally the [`ExitReport`].
//!
//! Readers run on their own tasks and never block admission. Only the last
//! `tail_lines` stderr lines are kept in memory for classification.

mod error;
mod lines;

pub use error::LaunchFailure;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::services::LogWriter;
use lines::LineSplitter;

/// How long to wait for output readers after the child exits. Pipes can stay
/// open if the tool left a grandchild behind.
const READER_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }
}

/// Executable plus full argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// `None` when the process died from a signal.
    pub code: Option<i32>,
    /// We killed it (pause/cancel), as opposed to the tool exiting on its own.
    pub killed: bool,
    /// Last stderr lines, oldest first.
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }
}

/// Control side of a running process.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Arc<watch::Sender<bool>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a kill. Idempotent; a no-op once the process has exited.
    pub fn terminate(&self) {
        self.kill_tx.send_replace(true);
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves once the process is reaped and its output readers are done.
    pub async fn terminated(&self) -> ExitReport {
        wait_exit(self.exit_rx.clone()).await
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Output side of a running process.
pub struct ProcessOutput {
    lines: mpsc::UnboundedReceiver<OutputLine>,
    log: Box<dyn LogWriter>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

impl ProcessOutput {
    /// Next line in emission order, already mirrored to the job log.
    /// `None` once both pipes are closed.
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        let line = self.lines.recv().await?;
        self.log.append_line(line.stream, &line.text);
        Some(line)
    }

    /// Wait for the exit report. Drains any unread lines into the log first.
    pub async fn finish(mut self) -> ExitReport {
        while self.next_line().await.is_some() {}
        let report = wait_exit(self.exit_rx.clone()).await;
        let footer = match report.code {
            Some(code) => format!("Process exited with code {code}"),
            None => "Process terminated by signal".to_string(),
        };
        self.log.note(&footer);
        report
    }
}

async fn wait_exit(mut rx: watch::Receiver<Option<ExitReport>>) -> ExitReport {
    let seen = rx.wait_for(|r| r.is_some()).await.map(|r| r.clone());
    match seen {
        Ok(Some(report)) => report,
        // Watcher task is gone without reporting (runtime shutdown).
        _ => rx.borrow().clone().unwrap_or_else(lost_report),
    }
}

fn lost_report() -> ExitReport {
    ExitReport {
        code: None,
        killed: true,
        stderr_tail: Vec::new(),
    }
}

/// Spawn the process described by `spec`.
///
/// Fails only when the executable cannot be launched. `log` receives a
/// `Command:` header and then every output line.
pub fn start(
    spec: &LaunchSpec,
    mut log: Box<dyn LogWriter>,
    tail_lines: usize,
) -> Result<(ProcessHandle, ProcessOutput), LaunchFailure> {
    log.note(&format!("Command: {spec}"));

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group so a kill also reaches the tool's children (the
    // fetch tool runs the remux tool for post-processing).
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| LaunchFailure::Spawn {
        program: spec.program.display().to_string(),
        source,
    })?;
    let pid = child.id();
    tracing::debug!(pid = ?pid, "spawned {}", spec.program.display());

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(tail_lines.min(1024))));

    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(
            stdout,
            Stream::Stdout,
            line_tx.clone(),
            None,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(
            stderr,
            Stream::Stderr,
            line_tx.clone(),
            Some((Arc::clone(&tail), tail_lines.max(1))),
        )));
    }
    drop(line_tx);

    let (kill_tx, kill_rx) = watch::channel(false);
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(watch_exit(child, pid, kill_rx, readers, tail, exit_tx));

    let handle = ProcessHandle {
        pid,
        kill_tx: Arc::new(kill_tx),
        exit_rx: exit_rx.clone(),
    };
    let output = ProcessOutput {
        lines: line_rx,
        log,
        exit_rx,
    };
    Ok((handle, output))
}

type Tail = Arc<Mutex<VecDeque<String>>>;

async fn read_stream<R>(
    mut reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputLine>,
    tail: Option<(Tail, usize)>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("{} read error: {}", stream.label(), e);
                break;
            }
        };
        for text in splitter.push(&buf[..n]) {
            emit(stream, text, &tx, tail.as_ref());
        }
    }
    if let Some(text) = splitter.finish() {
        emit(stream, text, &tx, tail.as_ref());
    }
}

fn emit(
    stream: Stream,
    text: String,
    tx: &mpsc::UnboundedSender<OutputLine>,
    tail: Option<&(Tail, usize)>,
) {
    if let Some((tail, cap)) = tail {
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() >= *cap {
            tail.pop_front();
        }
        tail.push_back(text.clone());
    }
    // Receiver gone means the pump stopped caring; keep draining the pipe.
    let _ = tx.send(OutputLine { stream, text });
}

async fn watch_exit(
    mut child: Child,
    pid: Option<u32>,
    mut kill_rx: watch::Receiver<bool>,
    readers: Vec<JoinHandle<()>>,
    tail: Tail,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_requested(&mut kill_rx) => {
            killed = true;
            kill_tree(&mut child, pid);
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(pid = ?pid, "wait for child failed: {}", e);
            None
        }
    };

    let aborts: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
    let drained = tokio::time::timeout(READER_GRACE, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!(pid = ?pid, "output pipes still open after exit; dropping readers");
        for abort in aborts {
            abort.abort();
        }
    }

    let stderr_tail = tail
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain(..)
        .collect();
    exit_tx.send_replace(Some(ExitReport {
        code,
        killed,
        stderr_tail,
    }));
}

async fn kill_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|k| *k).await.is_err() {
        // Every handle was dropped; nobody can ask for a kill any more.
        std::future::pending::<()>().await;
    }
}

fn kill_tree(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.start_kill() {
        tracing::debug!("start_kill: {}", e);
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: plain kill(2) on the process group created at spawn.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
