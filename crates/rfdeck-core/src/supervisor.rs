//! Owns one external child process: spawn, line capture, exit tracking,
//! graceful stop with escalation, and immediate kill.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rfdeck_ipc::{ExitOutcome, OutputLine, OutputStream, ProcessInfo};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CoreError;

pub const DEFAULT_TAIL_LINES: usize = 200;
pub const DEFAULT_LINE_BUFFER: usize = 4096;
pub const MAX_LINE_BYTES: usize = 16 * 1024;
const KILL_CONFIRM: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("program name is empty")]
    EmptyProgram,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output lines were already taken")]
    LinesTaken,

    #[error("process did not finish within {0:?}")]
    Timeout(Duration),
}

impl From<SupervisorError> for CoreError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::EmptyProgram => CoreError::InvalidConfig(err.to_string()),
            SupervisorError::Spawn { program, source } => CoreError::SpawnFailed {
                program,
                reason: source.to_string(),
            },
            SupervisorError::LinesTaken => CoreError::Io(std::io::Error::other(err.to_string())),
            SupervisorError::Timeout(_) => CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                err.to_string(),
            )),
        }
    }
}

/// What to run. Arguments are passed as a vector, never through a shell.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub tail_lines: usize,
    pub line_buffer: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            tail_lines: DEFAULT_TAIL_LINES,
            line_buffer: DEFAULT_LINE_BUFFER,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

struct Shared {
    tail: Mutex<VecDeque<OutputLine>>,
    tail_cap: usize,
    dropped: AtomicU64,
    truncated: AtomicU64,
    /// Set by `stop`; a signal death after it is the supervisor's doing.
    terminate_requested: AtomicBool,
    kill_requested: AtomicBool,
}

impl Shared {
    fn push_tail(&self, line: OutputLine) {
        if self.tail_cap == 0 {
            return;
        }
        let mut tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == self.tail_cap {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn tail(&self) -> Vec<OutputLine> {
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }

    fn requested_exit(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
            || self.kill_requested.load(Ordering::SeqCst)
    }
}

pub struct ProcessSupervisor {
    pid: Option<u32>,
    program: String,
    args: Vec<String>,
    started_at: DateTime<Utc>,
    started: Instant,
    shared: Arc<Shared>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    kill: CancellationToken,
    lines: Mutex<Option<mpsc::Receiver<OutputLine>>>,
}

impl ProcessSupervisor {
    /// Starts the child in its own process group with stdout and stderr piped.
    pub fn spawn(spec: ProcessSpec) -> Result<Self, SupervisorError> {
        if spec.program.trim().is_empty() {
            return Err(SupervisorError::EmptyProgram);
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            warn!(target: "rfdeck::process", program = %spec.program, error = %source, "spawn_failed");
            SupervisorError::Spawn {
                program: spec.program.clone(),
                source,
            }
        })?;
        let pid = child.id();
        info!(
            target: "rfdeck::process",
            program = %spec.program,
            args = ?spec.args,
            pid = ?pid,
            "spawned"
        );

        let shared = Arc::new(Shared {
            tail: Mutex::new(VecDeque::with_capacity(spec.tail_lines)),
            tail_cap: spec.tail_lines,
            dropped: AtomicU64::new(0),
            truncated: AtomicU64::new(0),
            terminate_requested: AtomicBool::new(false),
            kill_requested: AtomicBool::new(false),
        });

        let (line_tx, line_rx) = mpsc::channel(spec.line_buffer.max(1));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                line_tx.clone(),
                Arc::clone(&shared),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                line_tx,
                Arc::clone(&shared),
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let kill_waiter = kill.clone();
        let waiter_shared = Arc::clone(&shared);
        let program = spec.program.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_waiter.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let mut outcome = match status {
                Ok(status) => outcome_from_status(status),
                Err(err) => {
                    warn!(target: "rfdeck::process", program = %program, error = %err, "wait_failed");
                    ExitOutcome::Exited { code: -1 }
                }
            };
            if waiter_shared.requested_exit() && !matches!(outcome, ExitOutcome::Exited { .. })
            {
                outcome = ExitOutcome::KilledBySupervisor;
            }
            info!(target: "rfdeck::process", program = %program, pid = ?pid, outcome = %outcome, "exited");
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(Self {
            pid,
            program: spec.program,
            args: spec.args,
            started_at: Utc::now(),
            started: Instant::now(),
            shared,
            exit_rx,
            kill,
            lines: Mutex::new(Some(line_rx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Line stream over both pipes, closed once the child's output ends.
    /// Can be taken once.
    pub fn take_lines(&self) -> Result<mpsc::Receiver<OutputLine>, SupervisorError> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SupervisorError::LinesTaken)
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// True between a kill request and the reaper observing the exit.
    pub fn kill_in_flight(&self) -> bool {
        self.shared.kill_requested.load(Ordering::SeqCst) && self.is_alive()
    }

    pub async fn wait_exit(&self) -> ExitOutcome {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(outcome) = *rx.borrow() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().unwrap_or(ExitOutcome::KilledBySupervisor);
            }
        }
    }

    /// Requests termination, waits up to `grace`, then escalates to a kill.
    pub async fn stop(&self, grace: Duration) -> ExitOutcome {
        if let Some(outcome) = self.exit_outcome() {
            return outcome;
        }
        self.shared.terminate_requested.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            debug!(target: "rfdeck::process", pid, "sending SIGTERM to group");
            signal_group(pid, libc::SIGTERM);
        }
        match timeout(grace, self.wait_exit()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    target: "rfdeck::process",
                    program = %self.program,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "grace period elapsed, killing"
                );
                self.kill();
                self.confirm_kill().await
            }
        }
    }

    /// Sends SIGKILL without waiting.
    pub fn kill(&self) {
        if !self.is_alive() {
            return;
        }
        self.shared.kill_requested.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGKILL);
        }
        self.kill.cancel();
    }

    /// Bounded wait for the reaper after a kill.
    pub async fn confirm_kill(&self) -> ExitOutcome {
        match timeout(KILL_CONFIRM, self.wait_exit()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    target: "rfdeck::process",
                    program = %self.program,
                    pid = ?self.pid,
                    "process did not exit after SIGKILL"
                );
                ExitOutcome::KilledBySupervisor
            }
        }
    }

    pub fn tail(&self) -> Vec<OutputLine> {
        self.shared.tail()
    }

    pub fn dropped_lines(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Lines cut at `MAX_LINE_BYTES`.
    pub fn truncated_lines(&self) -> u64 {
        self.shared.truncated.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            program: self.program.clone(),
            args: self.args.clone(),
            started_at: self.started_at,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            alive: self.is_alive(),
            kill_in_flight: self.kill_in_flight(),
            exit: self.exit_outcome(),
            tail: self.tail(),
            dropped_lines: self.dropped_lines(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub outcome: ExitOutcome,
    pub lines: Vec<OutputLine>,
}

impl Completed {
    pub fn stdout(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
    }

    pub fn stderr(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stderr)
            .map(|l| l.text.as_str())
    }
}

/// Runs a short-lived program, collecting all of its output.
pub async fn run_to_completion(
    spec: ProcessSpec,
    limit: Duration,
) -> Result<Completed, SupervisorError> {
    let process = ProcessSupervisor::spawn(spec)?;
    let mut lines = process.take_lines()?;
    let collect = async {
        let mut out = Vec::new();
        while let Some(line) = lines.recv().await {
            out.push(line);
        }
        let outcome = process.wait_exit().await;
        Completed {
            outcome,
            lines: out,
        }
    };
    match timeout(limit, collect).await {
        Ok(completed) => Ok(completed),
        Err(_) => {
            process.kill();
            Err(SupervisorError::Timeout(limit))
        }
    }
}

async fn pump_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let limit = MAX_LINE_BYTES as u64 + 1;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if n as u64 == limit && buf.last() != Some(&b'\n') {
                    shared.truncated.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = skip_line(&mut reader).await {
                        debug!(target: "rfdeck::process", ?stream, error = %err, "output read failed");
                        break;
                    }
                }
                let line = OutputLine {
                    stream,
                    text: decode_line(&buf),
                };
                shared.push_tail(line.clone());
                match tx.try_send(line) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        shared.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    // Nobody is listening; keep draining so the child never blocks on a full pipe.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            Err(err) => {
                debug!(target: "rfdeck::process", ?stream, error = %err, "output read failed");
                break;
            }
        }
    }
}

/// Discards input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    let mut text = String::from_utf8_lossy(&raw[..end]).into_owned();
    if text.len() > MAX_LINE_BYTES {
        let mut cut = MAX_LINE_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(unix)]
fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitOutcome::Exited { code },
        (None, Some(signal)) => ExitOutcome::Signaled { signal },
        (None, None) => ExitOutcome::Exited { code: -1 },
    }
}

#[cfg(not(unix))]
fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    ExitOutcome::Exited {
        code: status.code().unwrap_or(-1),
    }
}

/// Signals the child's process group, falling back to the pid alone.
fn signal_group(pid: u32, signal: i32) -> bool {
    let pid = pid as libc::pid_t;
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return true;
        }
        libc::kill(pid, signal) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    async fn drain(rx: &mut mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Ok(Some(line)) = timeout(Duration::from_secs(5), rx.recv()).await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn captures_tagged_lines_and_exit_code() {
        let process = ProcessSupervisor::spawn(sh("echo one; echo two >&2; echo three; exit 3"))
            .unwrap();
        let mut rx = process.take_lines().unwrap();
        let lines = drain(&mut rx).await;

        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "three"]);
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stderr && l.text == "two"));

        assert_eq!(process.wait_exit().await, ExitOutcome::Exited { code: 3 });
        assert!(!process.is_alive());
        assert!(matches!(process.take_lines(), Err(SupervisorError::LinesTaken)));
    }

    #[tokio::test]
    async fn stop_terminates_within_grace() {
        let process = ProcessSupervisor::spawn(sh("exec sleep 30")).unwrap();
        assert!(process.is_alive());
        let started = Instant::now();
        let outcome = process.stop(Duration::from_secs(2)).await;
        assert_eq!(outcome, ExitOutcome::KilledBySupervisor);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn external_signal_is_not_attributed_to_supervisor() {
        let process = ProcessSupervisor::spawn(sh("exec sleep 30")).unwrap();
        let pid = process.pid().unwrap();
        assert!(signal_group(pid, libc::SIGTERM));
        let outcome = timeout(Duration::from_secs(2), process.wait_exit())
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled { signal: libc::SIGTERM });
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn stop_keeps_clean_exit_code() {
        let process =
            ProcessSupervisor::spawn(sh("trap 'exit 0' TERM; while true; do sleep 0.1; done"))
                .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = process.stop(Duration::from_secs(2)).await;
        assert_eq!(outcome, ExitOutcome::Exited { code: 0 });
    }

    #[tokio::test]
    async fn unterminated_output_is_capped_per_line() {
        let script = format!(
            "head -c {} /dev/zero | tr '\\0' a; echo; echo after",
            MAX_LINE_BYTES * 4
        );
        let process = ProcessSupervisor::spawn(sh(&script)).unwrap();
        let mut rx = process.take_lines().unwrap();
        let lines = drain(&mut rx).await;

        let texts: Vec<_> = lines.iter().map(|l| l.text.len()).collect();
        assert_eq!(texts, vec![MAX_LINE_BYTES, 5]);
        assert_eq!(lines[1].text, "after");
        assert_eq!(process.truncated_lines(), 1);
    }

    #[tokio::test]
    async fn stop_escalates_when_term_is_ignored() {
        let process =
            ProcessSupervisor::spawn(sh("trap '' TERM; while true; do sleep 0.1; done")).unwrap();
        let outcome = process.stop(Duration::from_millis(300)).await;
        assert_eq!(outcome, ExitOutcome::KilledBySupervisor);
        assert!(!process.is_alive());
        assert!(!process.kill_in_flight());
    }

    #[tokio::test]
    async fn kill_is_immediate() {
        let process = ProcessSupervisor::spawn(sh("exec sleep 30")).unwrap();
        process.kill();
        let outcome = timeout(Duration::from_secs(2), process.wait_exit())
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::KilledBySupervisor);
        // Killing an exited process is a no-op.
        process.kill();
        assert_eq!(process.info().exit, Some(ExitOutcome::KilledBySupervisor));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = ProcessSupervisor::spawn(ProcessSpec::new(
            "/nonexistent/rfdeck-missing-binary",
            Vec::new(),
        ))
        .err()
        .unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        let core: CoreError = err.into();
        assert!(matches!(core, CoreError::SpawnFailed { .. }));

        assert!(matches!(
            ProcessSupervisor::spawn(ProcessSpec::new(" ", Vec::new())),
            Err(SupervisorError::EmptyProgram)
        ));
    }

    #[tokio::test]
    async fn tail_keeps_most_recent_lines() {
        let mut spec = sh("i=0; while [ $i -lt 50 ]; do echo line$i; i=$((i+1)); done");
        spec.tail_lines = 10;
        let process = ProcessSupervisor::spawn(spec).unwrap();
        let mut rx = process.take_lines().unwrap();
        assert_eq!(drain(&mut rx).await.len(), 50);

        let tail = process.tail();
        assert_eq!(tail.len(), 10);
        assert_eq!(tail[0].text, "line40");
        assert_eq!(tail[9].text, "line49");
    }

    #[tokio::test]
    async fn full_line_buffer_counts_drops() {
        let mut spec = sh("i=0; while [ $i -lt 20 ]; do echo x$i; i=$((i+1)); done");
        spec.line_buffer = 1;
        let process = ProcessSupervisor::spawn(spec).unwrap();
        process.wait_exit().await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while process.dropped_lines() < 19 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(process.dropped_lines(), 19);
    }

    #[tokio::test]
    async fn run_to_completion_collects_and_times_out() {
        let done = run_to_completion(sh("echo ready"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(done.outcome.is_clean());
        assert_eq!(done.stdout().collect::<Vec<_>>(), vec!["ready"]);

        let err = run_to_completion(sh("exec sleep 30"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout(_)));
    }

    #[test]
    fn decode_line_strips_and_truncates() {
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"\xffok\n"), "\u{fffd}ok");
        let long = vec![b'a'; MAX_LINE_BYTES + 100];
        assert_eq!(decode_line(&long).len(), MAX_LINE_BYTES);
    }
}
