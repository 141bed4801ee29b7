//! Caller-supplied spawn configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SpawnError};
use crate::privilege::PrivilegePolicy;

/// Name of the application entry file expected under the app root.
pub const DEFAULT_ENTRY_FILE: &str = "app.entry";

/// Fallback low-privilege identity used when no ownership signal is usable.
pub const DEFAULT_LOWEST_USER: &str = "nobody";

/// Default bound on the readiness handshake.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration for one spawn. Immutable once handed to `spawn`.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Absolute path to the application directory. Must exist and contain
    /// the entry file.
    pub app_root: PathBuf,
    /// Entry file name under `app_root`. Its owner anchors privilege
    /// resolution; the application loader interprets its contents.
    pub entry_file: String,
    /// Fallback identity when the entry file's owner is root or cannot be
    /// resolved.
    pub lowest_user: Option<String>,
    /// Explicit identity override. Requires a privileged caller; an
    /// unprivileged caller asking for a switch is rejected.
    pub user: Option<String>,
    /// base64-wrapped `key\0value\0...` blob of extra environment
    /// variables, already packed by the caller.
    pub environment_variables: Option<String>,
    /// How long the parent waits for the worker's readiness report.
    pub spawn_timeout: Duration,
    /// Precedence between the entry file's owner and the `lowest_user`
    /// floor when both are usable.
    pub privilege_policy: PrivilegePolicy,
    /// Additional options forwarded unchanged to the application loader.
    pub options: BTreeMap<String, String>,
}

impl SpawnOptions {
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            entry_file: DEFAULT_ENTRY_FILE.to_string(),
            lowest_user: Some(DEFAULT_LOWEST_USER.to_string()),
            user: None,
            environment_variables: None,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            privilege_policy: PrivilegePolicy::default(),
            options: BTreeMap::new(),
        }
    }

    /// Use a different entry file name under the app root.
    pub fn entry_file(mut self, name: impl Into<String>) -> Self {
        self.entry_file = name.into();
        self
    }

    /// Set the fallback low-privilege identity.
    pub fn lowest_user(mut self, name: impl Into<String>) -> Self {
        self.lowest_user = Some(name.into());
        self
    }

    /// Force the worker to run as a specific user.
    pub fn user(mut self, name: impl Into<String>) -> Self {
        self.user = Some(name.into());
        self
    }

    /// Supply a transport-encoded environment blob.
    pub fn environment_variables(mut self, blob: impl Into<String>) -> Self {
        self.environment_variables = Some(blob.into());
        self
    }

    /// Bound the readiness handshake.
    pub fn spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Choose the owner/floor precedence.
    pub fn privilege_policy(mut self, policy: PrivilegePolicy) -> Self {
        self.privilege_policy = policy;
        self
    }

    /// Forward an opaque option to the application loader.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Path of the entry file under the app root.
    pub fn entry_path(&self) -> PathBuf {
        self.app_root.join(&self.entry_file)
    }

    /// Check the options before any process is created. A missing entry
    /// file is a resolution failure per the privilege contract; everything
    /// else is an options problem.
    pub fn validate(&self) -> Result<()> {
        if !self.app_root.is_absolute() {
            return Err(SpawnError::InvalidOptions(format!(
                "app_root {} is not an absolute path",
                self.app_root.display()
            )));
        }
        if !self.app_root.is_dir() {
            return Err(SpawnError::InvalidOptions(format!(
                "app_root {} does not exist or is not a directory",
                self.app_root.display()
            )));
        }
        if self.entry_file.is_empty() || self.entry_file.contains('/') {
            return Err(SpawnError::InvalidOptions(format!(
                "entry_file {:?} must be a bare file name",
                self.entry_file
            )));
        }
        if self.spawn_timeout.is_zero() {
            return Err(SpawnError::InvalidOptions(
                "spawn_timeout must be non-zero".to_string(),
            ));
        }

        let entry = self.entry_path();
        if !entry.is_file() {
            return Err(SpawnError::Resolution(format!(
                "entry file {} not found",
                entry.display()
            )));
        }
        Ok(())
    }
}
