//! Filesystem identity (fs-uid/fs-gid) management.
//!
//! Two kinds of change exist: durable changes requested by the supervisor
//! ([`FsIdentity::apply`]) and escalation brackets ([`with_escalated`])
//! that must hand back the previous identity on every exit path.
//!
//! fs-uid/fs-gid are per-thread attributes. Callers run these functions on
//! the [`AffinityExecutor`](crate::affinity::AffinityExecutor) worker.

use std::sync::OnceLock;

use nix::unistd::{Gid, Group, Uid, setfsgid, setfsuid};
use stockade_common::constants::DISK_GROUP;
use stockade_common::error::{Result, StockadeError};

/// `setfsuid(-1)` / `setfsgid(-1)` always fail and report the current id.
const QUERY_ID: u32 = u32::MAX;

/// A filesystem identity of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsIdentity {
    /// Filesystem user id.
    pub uid: Uid,
    /// Filesystem group id.
    pub gid: Gid,
}

impl FsIdentity {
    /// Creates an identity from raw ids.
    #[must_use]
    pub const fn from_raw(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }

    /// Reads the calling thread's fs identity without changing it.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: setfsuid(Uid::from_raw(QUERY_ID)),
            gid: setfsgid(Gid::from_raw(QUERY_ID)),
        }
    }

    /// Durably switches the calling thread to this identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refused either id.
    pub fn apply(self) -> Result<()> {
        let _ = setfsuid(self.uid);
        let _ = setfsgid(self.gid);
        let now = Self::current();
        if now != self {
            return Err(StockadeError::Privilege {
                message: format!(
                    "requested fsuid={} fsgid={}, thread has fsuid={} fsgid={}",
                    self.uid, self.gid, now.uid, now.gid
                ),
            });
        }
        tracing::debug!(uid = %self.uid, gid = %self.gid, "fs identity set");
        Ok(())
    }
}

/// Open escalation bracket; restores the previous identity when closed.
///
/// Dropping the guard without calling [`EscalationGuard::restore`] still
/// restores, but can only log a failure.
#[derive(Debug)]
#[must_use = "dropping the guard restores the previous identity immediately"]
pub struct EscalationGuard {
    previous: FsIdentity,
    restored: bool,
}

impl EscalationGuard {
    /// Identity in effect before the escalation.
    #[must_use]
    pub const fn previous(&self) -> FsIdentity {
        self.previous
    }

    /// Closes the bracket.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::IdentityRestore`] if the thread did not
    /// return to its previous identity.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        restore_identity(self.previous)
    }
}

impl Drop for EscalationGuard {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = restore_identity(self.previous) {
                tracing::error!(error = %e, "identity restoration failed during unwind");
            }
        }
    }
}

/// Opens an escalation bracket, switching the thread to `target`.
///
/// The kernel reports no error when it refuses an fs id, so the switch is
/// read back before the guard is handed out.
///
/// # Errors
///
/// Returns [`StockadeError::Privilege`] if the thread did not reach
/// `target`, after putting the previous identity back, or
/// [`StockadeError::IdentityRestore`] if even that failed.
pub fn escalate(target: FsIdentity) -> Result<EscalationGuard> {
    let guard = EscalationGuard {
        previous: FsIdentity {
            uid: setfsuid(target.uid),
            gid: setfsgid(target.gid),
        },
        restored: false,
    };
    let now = FsIdentity::current();
    if now != target {
        guard.restore()?;
        return Err(StockadeError::Privilege {
            message: format!(
                "escalation to fsuid={} fsgid={} refused, thread reached fsuid={} fsgid={}",
                target.uid, target.gid, now.uid, now.gid
            ),
        });
    }
    tracing::trace!(
        from_uid = %guard.previous.uid,
        from_gid = %guard.previous.gid,
        to_uid = %target.uid,
        to_gid = %target.gid,
        "fs identity escalated"
    );
    Ok(guard)
}

/// Runs `work` with the thread escalated to `target`.
///
/// `work` never runs unless the escalation took effect. The previous
/// identity is restored whether `work` succeeds, fails, or panics. A
/// restoration failure takes precedence over the outcome of `work`.
///
/// # Errors
///
/// Returns [`StockadeError::Privilege`] if the escalation was refused, the
/// error from `work`, or [`StockadeError::IdentityRestore`].
pub fn with_escalated<R>(target: FsIdentity, work: impl FnOnce() -> Result<R>) -> Result<R> {
    let guard = escalate(target)?;
    let outcome = work();
    guard.restore()?;
    outcome
}

fn restore_identity(previous: FsIdentity) -> Result<()> {
    let _ = setfsuid(previous.uid);
    let _ = setfsgid(previous.gid);
    let now = FsIdentity::current();
    if now == previous {
        Ok(())
    } else {
        Err(StockadeError::IdentityRestore {
            message: format!(
                "expected fsuid={} fsgid={}, thread still has fsuid={} fsgid={}",
                previous.uid, previous.gid, now.uid, now.gid
            ),
        })
    }
}

/// Lazily resolved, write-once group id.
#[derive(Debug)]
pub struct GidCache {
    gid: OnceLock<Gid>,
}

impl GidCache {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gid: OnceLock::new(),
        }
    }

    /// Returns the cached gid, resolving it with `resolve` on first use.
    ///
    /// A failed resolution caches gid 0.
    pub fn get_or_resolve(&self, resolve: impl FnOnce() -> Option<Gid>) -> Gid {
        *self
            .gid
            .get_or_init(|| resolve().unwrap_or_else(|| Gid::from_raw(0)))
    }
}

impl Default for GidCache {
    fn default() -> Self {
        Self::new()
    }
}

static DISK_GID: GidCache = GidCache::new();

/// Returns the gid of the `disk` group, resolved once per process.
pub fn disk_gid() -> Gid {
    DISK_GID.get_or_resolve(|| lookup_group(DISK_GROUP))
}

fn lookup_group(name: &str) -> Option<Gid> {
    match Group::from_name(name) {
        Ok(Some(group)) => Some(group.gid),
        Ok(None) => {
            tracing::warn!(group = name, "group not found, falling back to gid 0");
            None
        }
        Err(e) => {
            tracing::warn!(group = name, error = %e, "group lookup failed, falling back to gid 0");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn on_fresh_thread<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> R {
        std::thread::spawn(f).join().unwrap()
    }

    /// An identity the calling thread is allowed to switch to.
    fn reachable_target() -> FsIdentity {
        if Uid::effective().is_root() {
            FsIdentity::from_raw(0, disk_gid().as_raw())
        } else {
            FsIdentity::current()
        }
    }

    /// Drops only the calling thread to `uid`; the libc wrapper would
    /// change every thread of the test binary.
    fn drop_thread_uid(uid: u32) {
        // SAFETY: raw setresuid affects the calling thread only and takes
        // plain integer arguments.
        let rc = unsafe { libc::syscall(libc::SYS_setresuid, uid, uid, uid) };
        assert_eq!(rc, 0, "setresuid: {}", std::io::Error::last_os_error());
    }

    #[test]
    fn cache_resolves_once() {
        let cache = GidCache::new();
        let calls = Cell::new(0);
        let first = cache.get_or_resolve(|| {
            calls.set(calls.get() + 1);
            Some(Gid::from_raw(6))
        });
        let second = cache.get_or_resolve(|| {
            calls.set(calls.get() + 1);
            Some(Gid::from_raw(99))
        });
        assert_eq!(first, Gid::from_raw(6));
        assert_eq!(second, Gid::from_raw(6));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failed_resolution_caches_gid_zero() {
        let cache = GidCache::new();
        assert_eq!(cache.get_or_resolve(|| None), Gid::from_raw(0));
        assert_eq!(cache.get_or_resolve(|| Some(Gid::from_raw(6))), Gid::from_raw(0));
    }

    #[test]
    fn disk_gid_is_stable() {
        assert_eq!(disk_gid(), disk_gid());
    }

    #[test]
    fn bracket_restores_identity_on_success() {
        on_fresh_thread(|| {
            let before = FsIdentity::current();
            let target = reachable_target();
            let value = with_escalated(target, || Ok(FsIdentity::current()));
            assert_eq!(value.unwrap(), target);
            assert_eq!(FsIdentity::current(), before);
        });
    }

    #[test]
    fn bracket_restores_identity_on_failure() {
        on_fresh_thread(|| {
            let before = FsIdentity::current();
            let outcome: Result<()> = with_escalated(reachable_target(), || {
                Err(StockadeError::Device {
                    message: "attach failed".into(),
                })
            });
            assert!(matches!(outcome, Err(StockadeError::Device { .. })));
            assert_eq!(FsIdentity::current(), before);
        });
    }

    #[test]
    fn dropped_guard_restores_identity() {
        on_fresh_thread(|| {
            let before = FsIdentity::current();
            drop(escalate(reachable_target()).unwrap());
            assert_eq!(FsIdentity::current(), before);
        });
    }

    #[test]
    fn refused_escalation_never_runs_the_work() {
        on_fresh_thread(|| {
            if Uid::effective().is_root() {
                drop_thread_uid(65534);
            }
            let before = FsIdentity::current();
            assert_ne!(before.uid, Uid::from_raw(0));

            let ran = Cell::new(false);
            let outcome = with_escalated(FsIdentity::from_raw(0, before.gid.as_raw()), || {
                ran.set(true);
                Ok(FsIdentity::current())
            });

            assert!(matches!(outcome, Err(StockadeError::Privilege { .. })));
            assert!(!ran.get());
            assert_eq!(FsIdentity::current(), before);
        });
    }

    #[test]
    fn applying_current_identity_succeeds() {
        on_fresh_thread(|| {
            let current = FsIdentity::current();
            current.apply().unwrap();
            assert_eq!(FsIdentity::current(), current);
        });
    }
}
