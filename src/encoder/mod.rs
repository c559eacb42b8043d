//! External encoder process supervision.
//!
//! The rest of the pipeline never touches a process handle directly: it gets
//! an [`EncoderProcessHandle`] (owned by the session driver, used only for
//! health checks and termination) and an [`EncoderInput`] (moved into the one
//! sink allowed to write frames).

pub mod command;

pub use command::{
    locate_ffmpeg, EncoderCommand, EncoderCommandBuilder, EncoderTarget, FfmpegCommand, OutputProtocol,
};

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionPolicy;
use crate::{Result, StartError, StreamConfig, StreamerError};

const STDERR_TAIL_LINES: usize = 50;
const SIGTERM_WAIT: Duration = Duration::from_secs(1);
const KILL_WAIT: Duration = Duration::from_secs(2);

type StderrTail = Arc<Mutex<VecDeque<String>>>;

fn tail_text(tail: &StderrTail) -> String {
    let lines = tail.lock().unwrap_or_else(|e| e.into_inner());
    lines.iter().cloned().collect::<Vec<_>>().join("\n")
}

/// Submit/write timestamps shared by the input writer and health checks, in
/// milliseconds since spawn.
struct Liveness {
    spawned: Instant,
    last_submit: AtomicU64,
    last_write: AtomicU64,
}

impl Liveness {
    fn new() -> Self {
        Self {
            spawned: Instant::now(),
            last_submit: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.spawned.elapsed().as_millis() as u64
    }

    fn mark_submit(&self) {
        self.last_submit.store(self.now_ms(), Ordering::Release);
    }

    fn mark_write(&self) {
        self.last_write.store(self.now_ms(), Ordering::Release);
    }

    /// How long writes have been stalled while frames keep arriving, if
    /// that exceeds `window`.
    fn stalled(&self, window: Duration) -> Option<Duration> {
        let now = self.now_ms();
        let submit = self.last_submit.load(Ordering::Acquire);
        let write = self.last_write.load(Ordering::Acquire);
        let window = window.as_millis() as u64;

        let submitting = submit > write && now.saturating_sub(submit) < window;
        let since_write = now.saturating_sub(write);
        (submitting && since_write >= window).then(|| Duration::from_millis(since_write))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderHealth {
    Healthy,
    Unhealthy(String),
}

/// A running encoder process. Owned by exactly one session.
pub struct EncoderProcessHandle {
    session: String,
    pid: Option<u32>,
    child: Child,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    liveness: Arc<Liveness>,
    last_health_check: Option<Instant>,
}

impl EncoderProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn last_health_check(&self) -> Option<Instant> {
        self.last_health_check
    }

    /// Last lines the encoder wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        tail_text(&self.stderr_tail)
    }
}

/// Result of handing one frame to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The pipe stayed full past the write timeout; nothing of this frame
    /// was written.
    Dropped,
}

struct PendingWrite {
    buf: Vec<u8>,
    offset: usize,
}

/// The encoder's stdin. Exactly one exists per process and it is moved into
/// the sink that feeds it.
pub struct EncoderInput {
    stdin: Option<ChildStdin>,
    pending: Option<PendingWrite>,
    liveness: Arc<Liveness>,
    write_timeout: Duration,
}

impl EncoderInput {
    /// Write one raw frame, giving up after the write timeout.
    ///
    /// A frame that was partly written when the timeout hit is finished
    /// before anything else is written, so the raw stream never tears.
    pub async fn write_frame(&mut self, bytes: Vec<u8>) -> Result<WriteOutcome> {
        self.liveness.mark_submit();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| StreamerError::InvariantViolation("write to a closed encoder pipe".into()))?;
        let deadline = tokio::time::Instant::now() + self.write_timeout;

        if let Some(pending) = self.pending.as_mut() {
            match tokio::time::timeout_at(deadline, write_rest(stdin, pending)).await {
                Ok(Ok(())) => {
                    self.pending = None;
                    self.liveness.mark_write();
                }
                Ok(Err(e)) => return Err(pipe_error(e)),
                Err(_) => return Ok(WriteOutcome::Dropped),
            }
        }

        let mut current = PendingWrite { buf: bytes, offset: 0 };
        match tokio::time::timeout_at(deadline, write_rest(stdin, &mut current)).await {
            Ok(Ok(())) => {
                self.liveness.mark_write();
                Ok(WriteOutcome::Written)
            }
            Ok(Err(e)) => Err(pipe_error(e)),
            Err(_) if current.offset > 0 => {
                self.pending = Some(current);
                Ok(WriteOutcome::Written)
            }
            Err(_) => Ok(WriteOutcome::Dropped),
        }
    }

    /// Close the pipe so the encoder can flush and exit. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            self.pending = None;
            if let Err(e) = tokio::time::timeout(self.write_timeout, stdin.shutdown()).await.unwrap_or(Ok(())) {
                debug!("Encoder stdin shutdown: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stdin.is_none()
    }
}

async fn write_rest(stdin: &mut ChildStdin, pending: &mut PendingWrite) -> std::io::Result<()> {
    while pending.offset < pending.buf.len() {
        let n = stdin.write(&pending.buf[pending.offset..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        pending.offset += n;
    }
    Ok(())
}

fn pipe_error(e: std::io::Error) -> StreamerError {
    StreamerError::EncoderFault(format!("encoder input pipe: {}", e))
}

async fn forward_stderr(session: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(session = %session, "encoder: {}", line);
        let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Starts, checks and stops encoder processes.
pub struct EncoderSupervisor {
    builder: Arc<dyn EncoderCommandBuilder>,
    policy: SessionPolicy,
}

impl EncoderSupervisor {
    pub fn new(builder: Arc<dyn EncoderCommandBuilder>, policy: SessionPolicy) -> Self {
        Self { builder, policy }
    }

    /// Resolve the invocation without starting anything, so a missing binary
    /// is reported before a session leaves Idle.
    pub fn prepare(
        &self,
        config: &StreamConfig,
        target: &EncoderTarget,
    ) -> std::result::Result<EncoderCommand, StartError> {
        self.builder.build(config, target)
    }

    /// Build the invocation for `config`, start it and wait out the startup
    /// probe. The process is only handed back once it survived the probe.
    pub async fn spawn(
        &self,
        config: &StreamConfig,
        target: &EncoderTarget,
    ) -> std::result::Result<(EncoderProcessHandle, EncoderInput), StartError> {
        let command = self.prepare(config, target)?;
        self.launch(config, command).await
    }

    pub async fn launch(
        &self,
        config: &StreamConfig,
        command: EncoderCommand,
    ) -> std::result::Result<(EncoderProcessHandle, EncoderInput), StartError> {
        info!("Starting encoder for '{}': {}", config.name, command.redacted());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StartError::BinaryMissing(command.program.display().to_string()),
                _ => StartError::Spawn(e),
            })?;

        let stdin = child.stdin.take().ok_or(StartError::PipeUnavailable)?;
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_stderr(config.name.clone(), stderr, tail.clone())));

        tokio::time::sleep(self.policy.startup_probe()).await;
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                if let Some(task) = stderr_task {
                    // Let the reader drain what the process printed before dying.
                    let _ = tokio::time::timeout(Duration::from_millis(500), task).await;
                }
                let stderr = tail_text(&tail);
                warn!("Encoder for '{}' exited during startup ({}): {}", config.name, status, stderr);
                return Err(StartError::ExitedEarly {
                    status: status.to_string(),
                    stderr,
                });
            }
            Err(e) => return Err(StartError::Spawn(e)),
        }

        let pid = child.id();
        info!("Encoder for '{}' running (pid {:?})", config.name, pid);

        let liveness = Arc::new(Liveness::new());
        let handle = EncoderProcessHandle {
            session: config.name.clone(),
            pid,
            child,
            stderr_tail: tail,
            stderr_task,
            liveness: liveness.clone(),
            last_health_check: None,
        };
        let input = EncoderInput {
            stdin: Some(stdin),
            pending: None,
            liveness,
            write_timeout: self.policy.pipe_write_timeout(),
        };
        Ok((handle, input))
    }

    /// Process still alive, and not stalled while frames are submitted.
    pub fn health_check(&self, handle: &mut EncoderProcessHandle) -> EncoderHealth {
        handle.last_health_check = Some(Instant::now());

        match handle.child.try_wait() {
            Ok(Some(status)) => {
                let tail = handle.stderr_tail();
                let mut reason = format!("encoder exited unexpectedly ({})", status);
                if let Some(last) = tail.lines().last() {
                    reason.push_str(": ");
                    reason.push_str(last);
                }
                return EncoderHealth::Unhealthy(reason);
            }
            Ok(None) => {}
            Err(e) => return EncoderHealth::Unhealthy(format!("encoder status unavailable: {}", e)),
        }

        match handle.liveness.stalled(self.policy.liveness_window()) {
            Some(stalled) => EncoderHealth::Unhealthy(format!(
                "no frame written to the encoder for {:.1}s while frames were submitted",
                stalled.as_secs_f64()
            )),
            None => EncoderHealth::Healthy,
        }
    }

    /// Stop the process. The input pipe should already be closed; the
    /// process gets the grace period to finish, then SIGTERM, then a kill.
    pub async fn terminate(&self, mut handle: EncoderProcessHandle) -> Option<ExitStatus> {
        let session = handle.session.clone();
        let status = match tokio::time::timeout(self.policy.terminate_grace(), handle.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => {
                debug!("Encoder for '{}' still running after grace, sending SIGTERM", session);
                send_sigterm(handle.pid);
                match tokio::time::timeout(SIGTERM_WAIT, handle.child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => {
                        warn!("Encoder for '{}' ignored SIGTERM, killing", session);
                        if let Err(e) = handle.child.start_kill() {
                            warn!("Failed to kill encoder for '{}': {}", session, e);
                        }
                        tokio::time::timeout(KILL_WAIT, handle.child.wait())
                            .await
                            .ok()
                            .and_then(|r| r.ok())
                    }
                }
            }
        };

        if let Some(task) = handle.stderr_task.take() {
            if tokio::time::timeout(Duration::from_millis(200), task).await.is_err() {
                debug!("Encoder stderr reader for '{}' did not finish", session);
            }
        }
        info!("Encoder for '{}' terminated ({:?})", session, status);
        status
    }
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) {}
