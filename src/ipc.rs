//! One-shot parent/child channels
//!
//! Two pipes coordinate a spawn. The report channel carries exactly one
//! readiness-or-failure message from child to parent; the stop channel
//! carries the parent's stop signal to the child. Endpoints consume
//! themselves on use, so sending twice is unrepresentable, and extra data
//! on the receiving side is a logged, ignored protocol violation.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::time::{Duration, Instant};

use log::error;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnError};

/// Failure class a worker can report before becoming ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The privilege drop failed inside the child.
    Resolution,
    /// The application's own startup code failed.
    Load,
}

/// The single message a worker sends over the report channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    Ready,
    Failed {
        kind: FailureKind,
        message: String,
        category: Option<String>,
    },
}

/// Create the child-to-parent report channel for one spawn. The fds are
/// close-on-exec: fork keeps them across the spawn itself, but helper
/// processes the application execs do not inherit them.
pub fn report_channel() -> Result<(ReportReader, ReportWriter)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SpawnError::Infrastructure(format!("cannot create report pipe: {}", e)))?;
    Ok((ReportReader { fd: read }, ReportWriter { fd: write }))
}

/// Create the parent-to-child stop channel for one spawn. Close-on-exec,
/// like the report channel.
pub fn stop_channel() -> Result<(StopReceiver, StopSender)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SpawnError::Infrastructure(format!("cannot create stop pipe: {}", e)))?;
    Ok((StopReceiver { fd: read }, StopSender { fd: write }))
}

/// Parent end of the report channel.
pub struct ReportReader {
    fd: OwnedFd,
}

impl ReportReader {
    /// Block until the worker's single report arrives or `timeout` elapses.
    ///
    /// Reads stop at the first newline-terminated message, under a running
    /// deadline, so an inherited copy of the write end held open by some
    /// helper process the application forked cannot extend the wait past
    /// the timeout. Returns `Ok(None)` when the channel closes without a
    /// message, which means the child died before reporting. Anything
    /// after the first message is logged and ignored.
    pub fn recv(self, timeout: Duration) -> Result<Option<WorkerReport>> {
        let deadline = Instant::now() + timeout;
        let mut file = File::from(self.fd);
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SpawnError::Timeout(timeout));
            }
            let millis = i32::try_from(remaining.as_millis()).unwrap_or(i32::MAX).max(1);
            let poll_timeout = PollTimeout::try_from(millis).map_err(|e| {
                SpawnError::Infrastructure(format!("invalid spawn timeout: {}", e))
            })?;
            let ready = {
                let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, poll_timeout).map_err(|e| {
                    SpawnError::Infrastructure(format!("poll on report pipe failed: {}", e))
                })?
            };
            if ready == 0 {
                return Err(SpawnError::Timeout(timeout));
            }

            let count = match file.read(&mut chunk) {
                Ok(count) => count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if count == 0 {
                break; // EOF
            }
            buf.extend_from_slice(&chunk[..count]);
            if chunk[..count].contains(&b'\n') {
                break;
            }
        }

        if buf.is_empty() {
            return Ok(None);
        }
        let mut lines = buf.split(|b| *b == b'\n');
        let first = lines.next().unwrap_or_default();
        if lines.any(|rest| !rest.is_empty()) {
            error!("protocol violation: extra message on one-shot report channel (ignored)");
        }
        let report = serde_json::from_slice(first)
            .map_err(|e| SpawnError::Infrastructure(format!("malformed worker report: {}", e)))?;
        Ok(Some(report))
    }
}

/// Child end of the report channel.
pub struct ReportWriter {
    fd: OwnedFd,
}

impl ReportWriter {
    /// Send the worker's single report and close the channel.
    pub fn send(self, report: &WorkerReport) -> Result<()> {
        let mut line = serde_json::to_vec(report)
            .map_err(|e| SpawnError::Infrastructure(format!("cannot encode worker report: {}", e)))?;
        line.push(b'\n');
        let mut file = File::from(self.fd);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Child end of the stop channel.
pub struct StopReceiver {
    fd: OwnedFd,
}

impl StopReceiver {
    /// Park until the parent signals stop. A byte and EOF both count: the
    /// parent closing its end (or dying) must release the worker.
    pub fn wait(self) {
        let mut file = File::from(self.fd);
        let mut buf = [0u8; 1];
        loop {
            match file.read(&mut buf) {
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                _ => return,
            }
        }
    }
}

/// Parent end of the stop channel.
#[derive(Debug)]
pub struct StopSender {
    fd: OwnedFd,
}

impl StopSender {
    /// Signal the worker to stop: write the stop byte, then close. The
    /// byte reaches the worker even while some unrelated child still holds
    /// an inherited copy of this write end; the close covers a worker that
    /// is not reading. A worker that already exited (EPIPE) is not an
    /// error.
    pub fn signal(self) {
        let mut file = File::from(self.fd);
        let _ = file.write_all(&[1]);
    }
}
