//! appspawn: privilege-dropping worker process spawner
//!
//! Spawns an isolated worker process for a user-supplied application:
//! resolves the identity the worker must run as, injects a caller-packed
//! environment, loads the application entry point inside the child, and
//! propagates startup failures back across the process boundary with their
//! original message. While loading, the application can register callbacks
//! for the two lifecycle transitions (`starting_worker_process`,
//! `stopping_worker_process`).
//!
//! # Modules
//!
//! - **options**: caller-supplied spawn configuration
//! - **privilege**: identity resolution and the irreversible drop
//! - **env_codec**: the `key\0value\0` environment wire format
//! - **hooks**: per-process lifecycle hook registry
//! - **ipc**: one-shot report channel and stop channel
//! - **bootstrap**: everything that runs inside the worker
//! - **spawn**: parent-side coordination and the worker handle
//!
//! # Example
//!
//! ```ignore
//! use appspawn::{spawn, LoadError, SpawnOptions, WorkerContext};
//!
//! let options = SpawnOptions::new("/srv/app");
//! let mut loader = |ctx: &mut WorkerContext| -> Result<(), LoadError> {
//!     ctx.on_event(appspawn::STARTING_WORKER_PROCESS, || {
//!         // warm caches, open sockets, ...
//!         Ok(())
//!     });
//!     Ok(())
//! };
//! let mut worker = spawn(&options, &mut loader)?;
//! println!("worker pid: {}", worker.pid());
//! worker.close()?;
//! ```

pub mod bootstrap;
pub mod env_codec;
pub mod error;
pub mod hooks;
pub mod ipc;
pub mod options;
pub mod privilege;
pub mod spawn;

pub use bootstrap::{AppLoader, LoadError, WorkerContext};
pub use error::{Result, SpawnError};
pub use hooks::{
    HookError, HookRegistry, HookResult, STARTING_WORKER_PROCESS, STOPPING_WORKER_PROCESS,
};
pub use options::{
    SpawnOptions, DEFAULT_ENTRY_FILE, DEFAULT_LOWEST_USER, DEFAULT_SPAWN_TIMEOUT,
};
pub use privilege::{PrivilegePolicy, ResolvedIdentity};
pub use spawn::{spawn, WorkerHandle};
