//! Root filesystem switching.
//!
//! Three strategies, all ending with the working directory at the new `/`:
//! - `pivot`: `pivot_root(2)` with new and old root both set to `.`, then
//!   the old root is made a recursive slave and lazily detached.
//! - `move`: the new root is moved onto `/` and chrooted into.
//! - `chroot`: plain `chroot(2)`, for containers without a mount namespace.
//!
//! A failure at any step leaves the root partially switched. Callers must
//! abort the construction rather than start a process.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::ChrootMethod;

/// Switches the root filesystem to `root` with the given strategy.
///
/// `root` may be `.` to use the current directory.
///
/// # Errors
///
/// Returns [`StockadeError::RootSwitch`] naming the step that failed.
pub fn switch_root(root: &Path, method: ChrootMethod) -> Result<()> {
    let root = enter_root(root)?;
    tracing::info!(root = %root.display(), %method, "switching root filesystem");

    match method {
        ChrootMethod::Pivot => pivot(&root)?,
        ChrootMethod::Move => move_root(&root)?,
        ChrootMethod::Chroot => chroot_only(&root)?,
    }

    tracing::debug!("changing directory to / after root switch");
    nix::unistd::chdir("/").map_err(|e| step_error("chdir /", e))?;
    Ok(())
}

fn enter_root(root: &Path) -> Result<PathBuf> {
    if root == Path::new(".") {
        return Ok(std::env::current_dir().unwrap_or_else(|_| root.to_path_buf()));
    }
    tracing::debug!(root = %root.display(), "changing directory to new root");
    nix::unistd::chdir(root).map_err(|e| StockadeError::RootSwitch {
        step: "chdir to new root",
        message: format!("{}: {e}", root.display()),
    })?;
    Ok(root.to_path_buf())
}

fn pivot(root: &Path) -> Result<()> {
    // The only handle left on the host root once pivot_root returns.
    let old_root = File::open("/").map_err(|e| StockadeError::RootSwitch {
        step: "open host root",
        message: e.to_string(),
    })?;

    tracing::debug!(root = %root.display(), "pivot_root");
    nix::unistd::pivot_root(".", ".").map_err(|e| StockadeError::RootSwitch {
        step: "pivot_root",
        message: format!("{}: {e}", root.display()),
    })?;

    // SAFETY: `old_root` is an open directory descriptor owned by this
    // function for the duration of the call.
    if unsafe { libc::fchdir(old_root.as_raw_fd()) } < 0 {
        return Err(step_error("fchdir to old root", Errno::last()));
    }

    tracing::debug!("applying slave propagation to old root");
    nix::mount::mount(
        None::<&str>,
        ".",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| step_error("slave propagation on old root", e))?;

    tracing::debug!("detaching old root");
    nix::mount::umount2(".", MntFlags::MNT_DETACH).map_err(|e| step_error("detach old root", e))?;
    Ok(())
}

fn move_root(root: &Path) -> Result<()> {
    tracing::debug!(root = %root.display(), "moving new root onto /");
    nix::mount::mount(
        Some("."),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| StockadeError::RootSwitch {
        step: "move new root",
        message: format!("{}: {e}", root.display()),
    })?;
    chroot_only(root)
}

fn chroot_only(root: &Path) -> Result<()> {
    tracing::debug!(root = %root.display(), "chroot");
    nix::unistd::chroot(".").map_err(|e| step_error("chroot", e))
}

fn step_error(step: &'static str, errno: Errno) -> StockadeError {
    StockadeError::RootSwitch {
        step,
        message: errno.to_string(),
    }
}
