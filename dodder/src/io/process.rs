//! Helpers for running child processes with timeouts, cancellation, and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often the wait loop checks for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for output readers once the child is gone. Background
/// processes left by a child that exited normally may keep the pipes open.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Why the wait loop stopped before the child exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` only if the killed child could not be reaped.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub interrupted: Option<Interrupted>,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self) -> String {
        truncated_notice("stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self) -> String {
        truncated_notice("stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Capture>>;

/// Run a command, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the
/// amount of each stream stored in memory (bytes beyond this are discarded while still
/// draining the pipe). The child runs in its own process group; when `timeout`
/// elapses or `cancel` is set the whole group is killed and the output captured
/// up to that point is returned.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let (done_tx, done_rx) = mpsc::channel();
    spawn_reader(stdout, output_limit_bytes, stdout_capture.clone(), done_tx.clone());
    spawn_reader(stderr, output_limit_bytes, stderr_capture.clone(), done_tx);

    let started = Instant::now();
    let mut interrupted = None;
    let status = loop {
        if cancel.is_cancelled() {
            interrupted = Some(Interrupted::Cancelled);
            break None;
        }
        let slice = match timeout {
            Some(limit) => {
                let remaining = limit.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    interrupted = Some(Interrupted::TimedOut);
                    break None;
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break Some(status);
        }
    };

    let status = match (status, interrupted) {
        (Some(status), _) => Some(status),
        (None, reason) => {
            warn!(?reason, "stopping command, killing process tree");
            kill_tree(&mut child);
            match child.wait_timeout(READER_GRACE).context("wait command after kill")? {
                Some(status) => Some(status),
                None => {
                    warn!("killed command did not exit within grace period");
                    None
                }
            }
        }
    };

    wait_for_readers(&done_rx, 2);
    let (stdout, stdout_truncated) = take_capture(&stdout_capture)?;
    let (stderr, stderr_truncated) = take_capture(&stderr_capture)?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), ?interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        interrupted,
    })
}

#[cfg(unix)]
fn own_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

// `taskkill /T` follows parent ids, so no grouping is needed.
#[cfg(not(unix))]
fn own_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn tree_kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("kill");
    cmd.args(["-s", "KILL", "--"]).arg(format!("-{pid}"));
    cmd
}

#[cfg(not(unix))]
fn tree_kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/T", "/F", "/PID"]).arg(pid.to_string());
    cmd
}

/// Kill the child and everything it started. Falls back to killing the
/// child alone when the tree kill cannot run.
fn kill_tree(child: &mut Child) {
    let pid = child.id();
    match tree_kill_command(pid)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
    {
        Ok(out) if out.status.success() => debug!(pid, "killed process tree"),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            warn!(pid, stderr = %stderr.trim(), "tree kill failed");
        }
        Err(err) => warn!(pid, err = %err, "cannot run tree kill"),
    }
    // Already dead after a successful tree kill; reaped below either way.
    if let Err(err) = child.kill() {
        debug!(pid, err = %err, "direct kill after tree kill");
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    capture: SharedCapture,
    done: Sender<()>,
) {
    thread::spawn(move || {
        if let Err(err) = read_stream_limited(reader, limit, &capture) {
            warn!(err = %err, "output reader failed");
        }
        // The receiver is gone once the caller stopped waiting.
        let _ = done.send(());
    });
}

fn wait_for_readers(done: &Receiver<()>, readers: usize) {
    let deadline = Instant::now() + READER_GRACE;
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done.recv_timeout(remaining).is_err() {
            warn!("output reader still running, returning partial output");
            return;
        }
    }
}

fn take_capture(capture: &SharedCapture) -> Result<(Vec<u8>, usize)> {
    let mut guard = capture
        .lock()
        .map_err(|_| anyhow!("output reader thread panicked"))?;
    Ok((std::mem::take(&mut guard.buf), guard.truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, capture: &SharedCapture) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = capture
            .lock()
            .map_err(|_| anyhow!("output capture poisoned"))?;
        let remaining = limit.saturating_sub(guard.buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            guard.buf.extend_from_slice(&chunk[..keep]);
            guard.truncated += n.saturating_sub(keep);
        } else {
            guard.truncated += n;
        }
    }

    Ok(())
}
