//! Directory creation and working-directory changes.

use std::path::Path;

use nix::sys::stat::{Mode, umask};
use stockade_common::error::{Result, StockadeError};

/// Creates `path` with exactly `mode`, ignoring the process umask.
///
/// The umask is cleared around `mkdir(2)` and restored whatever the
/// outcome.
///
/// # Errors
///
/// Returns [`StockadeError::Io`] if `mkdir(2)` fails.
pub fn make_dir(path: &Path, mode: u32) -> Result<()> {
    let perm = Mode::from_bits_truncate(mode as libc::mode_t);
    let previous = umask(Mode::empty());
    let created = nix::unistd::mkdir(path, perm);
    let _ = umask(previous);

    created.map_err(|e| StockadeError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    tracing::debug!(path = %path.display(), mode = format_args!("{mode:o}"), "directory created");
    Ok(())
}

/// Changes the calling thread's working directory.
///
/// # Errors
///
/// Returns [`StockadeError::Io`] if `chdir(2)` fails.
pub fn change_dir(path: &Path) -> Result<()> {
    nix::unistd::chdir(path).map_err(|e| StockadeError::Io {
        path: path.to_path_buf(),
        source: e.into(),
    })?;
    tracing::debug!(path = %path.display(), "working directory changed");
    Ok(())
}
