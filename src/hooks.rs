//! Lifecycle hook registration and dispatch
//!
//! Each worker process owns exactly one registry, built fresh by the
//! bootstrap on every spawn; nothing is shared across worker processes.
//! Applications register callbacks by event name while loading, and the
//! bootstrap fires them at the two lifecycle transitions.

use std::collections::HashMap;
use std::error::Error as StdError;

use log::{debug, error};
use thiserror::Error;

/// Fired after the application has loaded, before readiness is reported.
pub const STARTING_WORKER_PROCESS: &str = "starting_worker_process";

/// Fired after the stop signal arrives, before the worker exits.
pub const STOPPING_WORKER_PROCESS: &str = "stopping_worker_process";

/// What a lifecycle callback returns.
pub type HookResult = std::result::Result<(), Box<dyn StdError + Send + Sync>>;

type Hook = Box<dyn FnMut() -> HookResult + Send>;

/// At least one callback failed during a `fire`. Hooks observe the
/// lifecycle rather than gate it, so callers typically log this and move
/// on; every registered callback still ran.
#[derive(Debug, Error)]
#[error("hook for {event:?} failed: {first} ({failed} of {fired} callbacks failed)")]
pub struct HookError {
    pub event: String,
    /// Message of the first failing callback.
    pub first: String,
    pub failed: usize,
    pub fired: usize,
}

/// Ordered, per-process registry of named lifecycle callbacks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the event's sequence. Callbacks fire in
    /// registration order.
    pub fn register<F>(&mut self, event: &str, hook: F)
    where
        F: FnMut() -> HookResult + Send + 'static,
    {
        self.hooks
            .entry(event.to_string())
            .or_default()
            .push(Box::new(hook));
    }

    /// Number of callbacks registered for an event.
    pub fn registered(&self, event: &str) -> usize {
        self.hooks.get(event).map_or(0, Vec::len)
    }

    /// Invoke every callback registered for `event`, in registration order,
    /// synchronously on the calling thread. All callbacks run even when an
    /// earlier one fails; each failure is logged and the first is returned.
    pub fn fire(&mut self, event: &str) -> std::result::Result<(), HookError> {
        let hooks = match self.hooks.get_mut(event) {
            Some(hooks) => hooks,
            None => {
                debug!("no hooks registered for {:?}", event);
                return Ok(());
            }
        };

        let fired = hooks.len();
        let mut failures: Vec<String> = Vec::new();
        for (index, hook) in hooks.iter_mut().enumerate() {
            if let Err(e) = hook() {
                error!("hook {} for {:?} failed: {}", index, event, e);
                failures.push(e.to_string());
            }
        }

        match failures.first() {
            None => Ok(()),
            Some(first) => Err(HookError {
                event: event.to_string(),
                first: first.clone(),
                failed: failures.len(),
                fired,
            }),
        }
    }
}
