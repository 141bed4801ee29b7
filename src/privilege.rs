//! Privilege resolution and dropping
//!
//! The target identity is resolved in the parent, before the worker exists,
//! and applied in the child before any application code runs. The drop is
//! irreversible within the worker, so the identity is never recomputed.

use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::{debug, warn};
use nix::unistd::{initgroups, setgid, setuid, Gid, Uid, User};

use crate::error::{Result, SpawnError};
use crate::options::SpawnOptions;

/// Precedence between the entry file's owner and the configured
/// `lowest_user` floor when both resolve to usable identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivilegePolicy {
    /// The entry file's owner wins; the floor is only a fallback when the
    /// owner is root or cannot be resolved.
    #[default]
    OwnerWins,
    /// The floor wins whenever it resolves; the owner is only a fallback.
    FloorWins,
}

/// The identity a worker process must run as. Computed once per spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedIdentity {
    /// The caller is unprivileged; the worker keeps the caller's identity.
    Unchanged,
    /// Switch to this user before running any application code.
    Switch { user: String, uid: Uid, gid: Gid },
}

impl ResolvedIdentity {
    /// Drop to the resolved identity. Group privilege is dropped before
    /// user privilege: once the uid changes, the process can no longer
    /// change its groups.
    pub fn apply(&self) -> Result<()> {
        let (user, uid, gid) = match self {
            ResolvedIdentity::Unchanged => return Ok(()),
            ResolvedIdentity::Switch { user, uid, gid } => (user, *uid, *gid),
        };

        let name = CString::new(user.as_str())
            .map_err(|_| SpawnError::Resolution("user name contains a NUL byte".to_string()))?;
        initgroups(&name, gid).map_err(|e| {
            SpawnError::Resolution(format!("initgroups for {} failed: {}", user, e))
        })?;
        setgid(gid)
            .map_err(|e| SpawnError::Resolution(format!("setgid({}) failed: {}", gid, e)))?;
        setuid(uid)
            .map_err(|e| SpawnError::Resolution(format!("setuid({}) failed: {}", uid, e)))?;
        debug!("dropped privileges to {} (uid {}, gid {})", user, uid, gid);
        Ok(())
    }
}

/// Map spawn options and entry-file ownership to the identity the worker
/// must run as.
///
/// A privileged caller lowers to the entry file's owner (or the configured
/// floor, per policy); an unprivileged caller keeps its identity, and an
/// explicit override it cannot honor is rejected rather than ignored.
pub fn resolve(entry_path: &Path, options: &SpawnOptions) -> Result<ResolvedIdentity> {
    if !Uid::effective().is_root() {
        if options.user.is_some() {
            return Err(SpawnError::Resolution(
                "cannot switch to an explicit user: caller is not privileged".to_string(),
            ));
        }
        debug!("caller is unprivileged, worker keeps the current identity");
        return Ok(ResolvedIdentity::Unchanged);
    }

    if let Some(name) = &options.user {
        return lookup_user(name);
    }

    let metadata = std::fs::metadata(entry_path).map_err(|e| {
        SpawnError::Resolution(format!(
            "cannot stat entry file {}: {}",
            entry_path.display(),
            e
        ))
    })?;
    let owner = owner_identity(Uid::from_raw(metadata.uid()));
    let floor = floor_identity(options);
    select_identity(owner, floor, options.privilege_policy)
}

/// Pure precedence decision between an owner-derived identity and the
/// configured floor. Fails when neither is usable: a privileged caller must
/// never run application code as root by accident.
fn select_identity(
    owner: Option<ResolvedIdentity>,
    floor: Option<ResolvedIdentity>,
    policy: PrivilegePolicy,
) -> Result<ResolvedIdentity> {
    let chosen = match policy {
        PrivilegePolicy::OwnerWins => owner.or(floor),
        PrivilegePolicy::FloorWins => floor.or(owner),
    };
    chosen.ok_or_else(|| {
        SpawnError::Resolution(
            "no usable target identity: entry file owner is root or unresolvable \
             and no lowest_user fallback resolves"
                .to_string(),
        )
    })
}

/// The entry file's owner as a drop target, when usable. Root ownership is
/// no ownership signal at all, and an owner missing from the user database
/// falls through to the floor.
fn owner_identity(uid: Uid) -> Option<ResolvedIdentity> {
    if uid.is_root() {
        return None;
    }
    match User::from_uid(uid) {
        Ok(Some(user)) => Some(ResolvedIdentity::Switch {
            user: user.name,
            uid: user.uid,
            gid: user.gid,
        }),
        Ok(None) => {
            warn!("entry file owner uid {} has no user database entry", uid);
            None
        }
        Err(e) => {
            warn!("user lookup for uid {} failed: {}", uid, e);
            None
        }
    }
}

fn floor_identity(options: &SpawnOptions) -> Option<ResolvedIdentity> {
    let name = options.lowest_user.as_deref()?;
    match User::from_name(name) {
        Ok(Some(user)) => Some(ResolvedIdentity::Switch {
            user: user.name,
            uid: user.uid,
            gid: user.gid,
        }),
        Ok(None) => {
            warn!("lowest_user {:?} does not exist", name);
            None
        }
        Err(e) => {
            warn!("lowest_user lookup for {:?} failed: {}", name, e);
            None
        }
    }
}

/// An explicit override must exist; a typo here is a hard error, not a
/// fallback.
fn lookup_user(name: &str) -> Result<ResolvedIdentity> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(ResolvedIdentity::Switch {
            user: user.name,
            uid: user.uid,
            gid: user.gid,
        }),
        Ok(None) => Err(SpawnError::Resolution(format!(
            "user {:?} does not exist on this system",
            name
        ))),
        Err(e) => Err(SpawnError::Resolution(format!(
            "user lookup for {:?} failed: {}",
            name, e
        ))),
    }
}
