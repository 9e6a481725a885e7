//! Linux namespace management for container construction.
//!
//! Namespaces are created per thread with `unshare(2)` on the affinity
//! worker, so every later construction step and the forked container see
//! them while the rest of the process stays on the host.

pub mod ipc;
pub mod uts;

use nix::mount::MsFlags;
use nix::sched::{CloneFlags, unshare};
use stockade_common::config::NamespaceRequest;
use stockade_common::error::{Result, StockadeError};

/// Translates a namespace request into `unshare(2)` flags.
///
/// `CLONE_FS` is always included so root and working directory changes
/// stay private to the calling thread. A PID namespace applies to children
/// forked afterwards.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] for a user namespace, which cannot be
/// created from a multi-threaded process.
pub fn clone_flags(request: &NamespaceRequest) -> Result<CloneFlags> {
    if request.user {
        return Err(StockadeError::Config {
            message: "user namespaces cannot be created by a multi-threaded supervisor".into(),
        });
    }
    let mut flags = CloneFlags::CLONE_FS;
    for (wanted, flag) in [
        (request.mount, CloneFlags::CLONE_NEWNS),
        (request.pid, CloneFlags::CLONE_NEWPID),
        (request.network, CloneFlags::CLONE_NEWNET),
        (request.ipc, CloneFlags::CLONE_NEWIPC),
        (request.uts, CloneFlags::CLONE_NEWUTS),
    ] {
        if wanted {
            flags |= flag;
        }
    }
    Ok(flags)
}

/// Moves the calling thread into fresh namespaces as requested.
///
/// A new mount namespace gets recursive private propagation on `/` so
/// construction mounts never reach the host.
///
/// # Errors
///
/// Returns [`StockadeError::Namespace`] if `unshare(2)` or the propagation
/// change fails.
pub fn create_namespaces(request: &NamespaceRequest) -> Result<()> {
    let flags = clone_flags(request)?;
    tracing::info!(?flags, "creating namespaces");
    unshare(flags).map_err(|e| StockadeError::Namespace {
        message: format!("unshare {flags:?} failed: {e}"),
    })?;

    if flags.contains(CloneFlags::CLONE_NEWNS) {
        nix::mount::mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| StockadeError::Namespace {
            message: format!("making / private failed: {e}"),
        })?;
    }
    Ok(())
}
