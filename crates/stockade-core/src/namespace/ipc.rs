//! IPC namespace re-entry.
//!
//! Encryption tooling talks to a host-wide service and must run in the
//! host IPC namespace even after the container requested its own.

use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;

use nix::sched::{CloneFlags, setns};
use stockade_common::error::{Result, StockadeError};

/// Opens the IPC namespace handle of process `pid`.
///
/// # Errors
///
/// Returns [`StockadeError::Namespace`] if the handle cannot be opened.
pub fn namespace_of(pid: i32) -> Result<File> {
    open_handle(PathBuf::from(format!("/proc/{pid}/ns/ipc")))
}

/// Opens the IPC namespace handle of the calling thread.
///
/// # Errors
///
/// Returns [`StockadeError::Namespace`] if the handle cannot be opened.
pub fn current_namespace() -> Result<File> {
    open_handle(PathBuf::from("/proc/thread-self/ns/ipc"))
}

/// Moves the calling thread into the IPC namespace behind `handle`.
///
/// On failure the thread's membership is unchanged.
///
/// # Errors
///
/// Returns [`StockadeError::Namespace`] if `setns(2)` fails.
pub fn enter(handle: &File) -> Result<()> {
    setns(handle.as_fd(), CloneFlags::CLONE_NEWIPC).map_err(|e| StockadeError::Namespace {
        message: format!("setns IPC failed: {e}"),
    })?;
    tracing::debug!("joined IPC namespace");
    Ok(())
}

/// Runs `work` inside the IPC namespace of `master_pid`, then returns the
/// calling thread to the namespace it started in.
///
/// With `master_pid <= 0` the work runs where it is and no namespace is
/// touched. Once the host namespace has been joined, the return trip is
/// attempted whatever `work` returned. A failed return trip is reported as
/// [`StockadeError::NamespaceRestore`] and wins over the outcome of `work`.
///
/// The thread's namespace changes for the duration of the call, so this
/// should run on a thread that is discarded afterwards.
///
/// # Errors
///
/// Returns [`StockadeError::Namespace`] if either handle cannot be opened
/// or the host namespace cannot be joined; otherwise the result of `work`.
pub fn with_namespace_of<R>(master_pid: i32, work: impl FnOnce() -> Result<R>) -> Result<R> {
    if master_pid <= 0 {
        return work();
    }

    let own = current_namespace()?;
    let host = namespace_of(master_pid)?;
    enter(&host).map_err(|e| StockadeError::Namespace {
        message: format!("while joining host IPC namespace of pid {master_pid}: {e}"),
    })?;

    let outcome = work();

    enter(&own).map_err(|e| StockadeError::NamespaceRestore {
        message: format!("while rejoining container IPC namespace: {e}"),
    })?;
    outcome
}

fn open_handle(path: PathBuf) -> Result<File> {
    File::open(&path).map_err(|e| StockadeError::Namespace {
        message: format!("cannot open {}: {e}", path.display()),
    })
}
