//! Worker-side bootstrap
//!
//! Everything here runs inside the freshly forked worker process. The
//! sequence is fixed: inject the environment, drop privileges, load the
//! application, fire the starting hooks, report readiness, then park on
//! the stop channel until the parent closes its handle.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use thiserror::Error;

use crate::env_codec;
use crate::hooks::{HookRegistry, HookResult, STARTING_WORKER_PROCESS, STOPPING_WORKER_PROCESS};
use crate::ipc::{FailureKind, ReportWriter, StopReceiver, WorkerReport};
use crate::options::SpawnOptions;
use crate::privilege::ResolvedIdentity;

/// Exit status of a worker that reported a startup failure.
pub(crate) const FAILURE_EXIT_STATUS: i32 = 1;

/// Error raised by an application's startup code.
///
/// The message (and optional category tag) survive the process boundary
/// byte-for-byte; the parent reconstructs a typed error from them rather
/// than the original error value.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoadError {
    pub message: String,
    pub category: Option<String>,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
        }
    }

    pub fn with_category(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: Some(category.into()),
        }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::with_category(e.to_string(), "io")
    }
}

/// Loads the application entry point inside the worker process.
///
/// `spawn` forks without exec, so the loader is ordinary caller code that
/// runs in the child after the privilege drop. It interprets the entry
/// file under the app root however the application framework requires,
/// and may register lifecycle hooks through the context.
pub trait AppLoader {
    fn load(&mut self, ctx: &mut WorkerContext) -> std::result::Result<(), LoadError>;
}

impl<F> AppLoader for F
where
    F: FnMut(&mut WorkerContext) -> std::result::Result<(), LoadError>,
{
    fn load(&mut self, ctx: &mut WorkerContext) -> std::result::Result<(), LoadError> {
        self(ctx)
    }
}

/// What the application sees while loading: its root, the forwarded
/// options, and the hook registration API. Owns the worker's hook
/// registry, which is built fresh for every spawn.
pub struct WorkerContext {
    app_root: PathBuf,
    entry_path: PathBuf,
    options: BTreeMap<String, String>,
    registry: HookRegistry,
}

impl WorkerContext {
    fn new(options: &SpawnOptions) -> Self {
        Self {
            app_root: options.app_root.clone(),
            entry_path: options.entry_path(),
            options: options.options.clone(),
            registry: HookRegistry::new(),
        }
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Path of the entry file the loader is expected to interpret.
    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    /// Options forwarded unchanged from the caller.
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// Register a lifecycle callback. The registration lives for the rest
    /// of this worker process.
    pub fn on_event<F>(&mut self, event: &str, hook: F)
    where
        F: FnMut() -> HookResult + Send + 'static,
    {
        self.registry.register(event, hook);
    }
}

/// Run the worker side of one spawn. Returns the process exit status; the
/// caller is expected to exit with it. A loader that panics is caught and
/// reported like any other load failure: the parent must see the message
/// the application produced, never a bare dead child.
pub(crate) fn run(
    options: &SpawnOptions,
    env: &[(String, String)],
    identity: &ResolvedIdentity,
    loader: &mut dyn AppLoader,
    report: ReportWriter,
    stop: StopReceiver,
) -> i32 {
    env_codec::apply(env);

    if let Err(e) = identity.apply() {
        report_failure(report, FailureKind::Resolution, e.to_string(), None);
        return FAILURE_EXIT_STATUS;
    }

    let mut ctx = WorkerContext::new(options);
    match catch_unwind(AssertUnwindSafe(|| loader.load(&mut ctx))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            report_failure(report, FailureKind::Load, e.message, e.category);
            return FAILURE_EXIT_STATUS;
        }
        Err(payload) => {
            let message = panic_message(payload);
            report_failure(report, FailureKind::Load, message, Some("panic".to_string()));
            return FAILURE_EXIT_STATUS;
        }
    }
    debug!("application loaded from {}", ctx.entry_path.display());

    // Hooks observe the lifecycle; they do not gate it.
    if let Err(e) = ctx.registry.fire(STARTING_WORKER_PROCESS) {
        warn!("{}", e);
    }

    if let Err(e) = report.send(&WorkerReport::Ready) {
        error!("cannot report readiness: {}", e);
        return FAILURE_EXIT_STATUS;
    }

    stop.wait();

    if let Err(e) = ctx.registry.fire(STOPPING_WORKER_PROCESS) {
        warn!("{}", e);
    }
    0
}

/// Best-effort text of a panic payload. Non-string payloads still produce
/// a stable message.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "application panicked while loading".to_string()
    }
}

fn report_failure(
    report: ReportWriter,
    kind: FailureKind,
    message: String,
    category: Option<String>,
) {
    error!("worker startup failed: {}", message);
    let failed = WorkerReport::Failed {
        kind,
        message,
        category,
    };
    if let Err(e) = report.send(&failed) {
        error!("cannot report startup failure: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc;
    use crate::options::DEFAULT_ENTRY_FILE;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn stub_options() -> (tempfile::TempDir, SpawnOptions) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_ENTRY_FILE), "app v1\n").unwrap();
        let options = SpawnOptions::new(dir.path()).option("framework", "rack");
        (dir, options)
    }

    /// Drives `run` in-process: the stop sender is released up front so the
    /// bootstrap never parks.
    fn drive(
        options: &SpawnOptions,
        env: &[(String, String)],
        loader: &mut dyn AppLoader,
    ) -> (i32, Option<WorkerReport>) {
        let (report_rx, report_tx) = ipc::report_channel().unwrap();
        let (stop_rx, stop_tx) = ipc::stop_channel().unwrap();
        stop_tx.signal();

        let status = run(
            options,
            env,
            &ResolvedIdentity::Unchanged,
            loader,
            report_tx,
            stop_rx,
        );
        let report = report_rx.recv(Duration::from_secs(1)).unwrap();
        (status, report)
    }

    #[test]
    fn successful_load_reports_ready_and_exits_cleanly() {
        let (_dir, options) = stub_options();
        let mut loader = |ctx: &mut WorkerContext| -> Result<(), LoadError> {
            assert_eq!(ctx.options().get("framework").unwrap(), "rack");
            assert!(ctx.entry_path().is_file());
            Ok(())
        };

        let (status, report) = drive(&options, &[], &mut loader);
        assert_eq!(status, 0);
        assert_eq!(report, Some(WorkerReport::Ready));
    }

    #[test]
    fn load_failure_is_reported_with_its_message() {
        let (_dir, options) = stub_options();
        let mut loader = |_ctx: &mut WorkerContext| -> Result<(), LoadError> {
            Err(LoadError::with_category("foo", "StandardError"))
        };

        let (status, report) = drive(&options, &[], &mut loader);
        assert_eq!(status, FAILURE_EXIT_STATUS);
        assert_eq!(
            report,
            Some(WorkerReport::Failed {
                kind: FailureKind::Load,
                message: "foo".to_string(),
                category: Some("StandardError".to_string()),
            })
        );
    }

    #[test]
    fn panicking_loader_is_reported_as_a_load_failure() {
        let (_dir, options) = stub_options();
        let mut loader = |_ctx: &mut WorkerContext| -> Result<(), LoadError> {
            panic!("application blew up at load time")
        };

        let (status, report) = drive(&options, &[], &mut loader);
        assert_eq!(status, FAILURE_EXIT_STATUS);
        assert_eq!(
            report,
            Some(WorkerReport::Failed {
                kind: FailureKind::Load,
                message: "application blew up at load time".to_string(),
                category: Some("panic".to_string()),
            })
        );
    }

    #[test]
    fn environment_is_applied_before_the_loader_runs() {
        let (_dir, options) = stub_options();
        let env = vec![(
            "APPSPAWN_BOOTSTRAP_TEST".to_string(),
            "injected".to_string(),
        )];
        let mut loader = |_ctx: &mut WorkerContext| -> Result<(), LoadError> {
            assert_eq!(std::env::var("APPSPAWN_BOOTSTRAP_TEST").unwrap(), "injected");
            Ok(())
        };

        let (status, _) = drive(&options, &env, &mut loader);
        assert_eq!(status, 0);
        std::env::remove_var("APPSPAWN_BOOTSTRAP_TEST");
    }

    #[test]
    fn hooks_fire_in_lifecycle_order() {
        let (_dir, options) = stub_options();
        let markers = Arc::new(Mutex::new(Vec::new()));

        let loader_markers = Arc::clone(&markers);
        let mut loader = move |ctx: &mut WorkerContext| -> Result<(), LoadError> {
            let starting = Arc::clone(&loader_markers);
            ctx.on_event(STARTING_WORKER_PROCESS, move || {
                starting.lock().unwrap().push("started");
                Ok(())
            });
            let stopping = Arc::clone(&loader_markers);
            ctx.on_event(STOPPING_WORKER_PROCESS, move || {
                stopping.lock().unwrap().push("stopped");
                Ok(())
            });
            loader_markers.lock().unwrap().push("loaded");
            Ok(())
        };

        let (status, report) = drive(&options, &[], &mut loader);
        assert_eq!(status, 0);
        assert_eq!(report, Some(WorkerReport::Ready));
        assert_eq!(*markers.lock().unwrap(), vec!["loaded", "started", "stopped"]);
    }

    #[test]
    fn failing_start_hook_does_not_prevent_readiness() {
        let (_dir, options) = stub_options();
        let mut loader = |ctx: &mut WorkerContext| -> Result<(), LoadError> {
            ctx.on_event(STARTING_WORKER_PROCESS, || Err("observer broke".into()));
            Ok(())
        };

        let (status, report) = drive(&options, &[], &mut loader);
        assert_eq!(status, 0);
        assert_eq!(report, Some(WorkerReport::Ready));
    }

    #[test]
    fn hooks_never_fire_when_the_load_fails() {
        let (_dir, options) = stub_options();
        let fired = Arc::new(Mutex::new(false));

        let loader_fired = Arc::clone(&fired);
        let mut loader = move |ctx: &mut WorkerContext| -> Result<(), LoadError> {
            let fired = Arc::clone(&loader_fired);
            ctx.on_event(STARTING_WORKER_PROCESS, move || {
                *fired.lock().unwrap() = true;
                Ok(())
            });
            Err(LoadError::new("broken at load"))
        };

        let (status, _) = drive(&options, &[], &mut loader);
        assert_eq!(status, FAILURE_EXIT_STATUS);
        assert!(!*fired.lock().unwrap());
    }
}
