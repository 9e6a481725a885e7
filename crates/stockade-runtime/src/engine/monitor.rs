//! Container process monitoring.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use stockade_common::error::{Result, StockadeError};

/// Fault signals that must keep their default disposition.
const SYNCHRONOUS_SIGNALS: [i32; 3] = [libc::SIGBUS, libc::SIGTRAP, libc::SIGSYS];

/// Signals the supervisor listens for while a container runs: every
/// catchable standard signal except hardware faults.
#[must_use]
pub fn monitored_signals() -> Vec<i32> {
    Signal::iterator()
        .map(|signal| signal as i32)
        .filter(|raw| !signal_hook::consts::FORBIDDEN.contains(raw))
        .filter(|raw| !SYNCHRONOUS_SIGNALS.contains(raw))
        .collect()
}

/// Forwards every signal except `SIGCHLD` to `pid`; on `SIGCHLD` reaps
/// without blocking and returns once `pid` itself has been reaped.
///
/// # Errors
///
/// Returns [`StockadeError::Process`] if `waitpid(2)` fails or `signals`
/// ends before `pid` exited.
pub fn monitor_pid(pid: Pid, signals: &mut dyn Iterator<Item = i32>) -> Result<WaitStatus> {
    for raw in signals {
        let Ok(signal) = Signal::try_from(raw) else {
            tracing::debug!(signal = raw, "ignoring unknown signal");
            continue;
        };

        if signal == Signal::SIGCHLD {
            if let Some(status) = reap(pid)? {
                tracing::info!(%pid, ?status, "container process reaped");
                return Ok(status);
            }
            continue;
        }

        match kill(pid, signal) {
            Ok(()) => tracing::debug!(%pid, ?signal, "signal forwarded"),
            Err(Errno::ESRCH) => tracing::debug!(%pid, ?signal, "container already gone"),
            Err(e) => tracing::warn!(%pid, ?signal, error = %e, "signal forwarding failed"),
        }
    }

    Err(StockadeError::Process {
        message: format!("signal stream ended before pid {pid} exited"),
    })
}

fn reap(pid: Pid) -> Result<Option<WaitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                return Ok(Some(status));
            }
            Ok(status) => tracing::debug!(%pid, ?status, "non-terminal wait status"),
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(StockadeError::Process {
                    message: format!("waitpid {pid} failed: {e}"),
                });
            }
        }
    }
}
