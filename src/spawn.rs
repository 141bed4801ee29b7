//! Parent-side spawn coordination
//!
//! `spawn` forks a worker process, waits for its single readiness-or-failure
//! report, and hands the caller a `WorkerHandle` on success. Every failure
//! path reaps the child; no handle is leaked alongside an error.

use std::panic::{catch_unwind, AssertUnwindSafe};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::bootstrap::{self, AppLoader};
use crate::env_codec;
use crate::error::{Result, SpawnError};
use crate::ipc::{self, FailureKind, ReportReader, StopSender, WorkerReport};
use crate::options::SpawnOptions;
use crate::privilege;

/// Spawn a worker process for the application under `options.app_root`.
///
/// Blocks until the worker either reports ready (returning a handle) or
/// reports a structured failure (returning the corresponding error). A
/// worker that dies silently or never reports within the spawn timeout is
/// an infrastructure error. Concurrent spawns are independent: each call
/// creates its own channels and its own child.
pub fn spawn(options: &SpawnOptions, loader: &mut dyn AppLoader) -> Result<WorkerHandle> {
    options.validate()?;
    let env = match &options.environment_variables {
        Some(blob) => env_codec::decode(blob)?,
        None => Vec::new(),
    };
    // Resolved before the child exists; the drop itself happens in the
    // child and is irreversible there.
    let identity = privilege::resolve(&options.entry_path(), options)?;

    let (report_rx, report_tx) = ipc::report_channel()?;
    let (stop_rx, stop_tx) = ipc::stop_channel()?;

    // SAFETY: the child only runs the bootstrap and exits; it never
    // returns into the caller's stack.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(report_rx);
            drop(stop_tx);
            // The bootstrap reports loader panics itself; this net catches
            // anything else so the child can never unwind back into the
            // caller's forked stack and run on as a duplicate process.
            let status = catch_unwind(AssertUnwindSafe(|| {
                bootstrap::run(options, &env, &identity, loader, report_tx, stop_rx)
            }))
            .unwrap_or(bootstrap::FAILURE_EXIT_STATUS);
            std::process::exit(status);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(report_tx);
            drop(stop_rx);
            debug!(
                "forked worker {} for {}",
                child,
                options.app_root.display()
            );
            await_report(child, stop_tx, report_rx, options)
        }
        Err(e) => Err(SpawnError::Infrastructure(format!(
            "cannot fork worker process: {}",
            e
        ))),
    }
}

fn await_report(
    child: Pid,
    stop: StopSender,
    report: ReportReader,
    options: &SpawnOptions,
) -> Result<WorkerHandle> {
    match report.recv(options.spawn_timeout) {
        Ok(Some(WorkerReport::Ready)) => {
            debug!("worker {} is ready", child);
            Ok(WorkerHandle {
                pid: child,
                stop: Some(stop),
            })
        }
        Ok(Some(WorkerReport::Failed {
            kind,
            message,
            category,
        })) => {
            stop.signal();
            let status = reap(child);
            debug!(
                "worker {} reported a startup failure (exit status {:?})",
                child, status
            );
            Err(match kind {
                FailureKind::Resolution => SpawnError::Resolution(message),
                FailureKind::Load => SpawnError::ApplicationLoad { message, category },
            })
        }
        Ok(None) => {
            stop.signal();
            let status = reap(child).unwrap_or(-1);
            Err(SpawnError::ChildDied {
                pid: child.as_raw(),
                status,
            })
        }
        Err(e) => {
            // The worker is in an unknown state; do not leak it.
            if let Err(kill_err) = kill(child, Signal::SIGKILL) {
                if kill_err != Errno::ESRCH {
                    warn!("cannot kill unresponsive worker {}: {}", child, kill_err);
                }
            }
            stop.signal();
            let _ = reap(child);
            Err(e)
        }
    }
}

/// Wait for the child and return its exit status where one is known. A
/// child already reaped elsewhere is not an error.
fn reap(child: Pid) -> Option<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, status)) => return Some(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Some(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::ECHILD) => return None,
            Err(e) => {
                warn!("waitpid for worker {} failed: {}", child, e);
                return None;
            }
        }
    }
}

/// Owned by the caller after a successful spawn: the worker's pid plus the
/// only means of stopping it. Exactly one handle exists per live worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Pid,
    stop: Option<StopSender>,
}

impl WorkerHandle {
    /// OS process id of the worker.
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Signal the worker to stop and wait for it to exit. The worker fires
    /// its stopping hooks between the signal and the exit.
    ///
    /// Idempotent: closing an already-closed handle, or one whose worker
    /// already exited, is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let stop = match self.stop.take() {
            Some(stop) => stop,
            None => return Ok(()),
        };
        stop.signal();
        if let Some(status) = reap(self.pid) {
            if status != 0 {
                warn!("worker {} exited with status {}", self.pid, status);
            }
        }
        debug!("worker {} stopped", self.pid);
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing worker {} failed: {}", self.pid, e);
        }
    }
}
