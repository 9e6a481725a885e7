//! Engine lifecycles.
//!
//! An engine turns a constructed container into a running process. The
//! supervisor forks, the child calls [`EngineOperations::start_process`]
//! and the parent drives monitoring and cleanup.

pub mod imgbuild;
pub mod monitor;
pub mod oci;
pub mod registry;
pub mod standard;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use nix::sys::wait::WaitStatus;
use nix::unistd::{Gid, Pid, Uid, getgid, getuid};
use stockade_common::config::CommonConfig;
use stockade_common::error::{Result, StockadeError};

pub use registry::{EngineFactory, EngineRegistration, EngineRegistry};

/// Byte the supervisor writes to release the container process.
pub const GO_BYTE: u8 = 1;

/// Lifecycle operations of one engine variant.
pub trait EngineOperations: Send {
    /// Parses the engine payload carried by `common`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Config`] for a malformed payload.
    fn init_config(&mut self, common: CommonConfig) -> Result<()>;

    /// Returns the parsed engine configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    fn config(&self) -> Result<serde_json::Value>;

    /// Runs in the forked child: waits for the go byte, then becomes the
    /// container process. Only returns on failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the control channel or exec failed.
    fn start_process(&mut self, control: &mut UnixStream) -> Result<()>;

    /// Relays signals to `pid` until it has been reaped.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Process`] if reaping failed or the signal
    /// stream ended first.
    fn monitor_container(
        &mut self,
        pid: Pid,
        signals: &mut dyn Iterator<Item = i32>,
    ) -> Result<WaitStatus> {
        monitor::monitor_pid(pid, signals)
    }

    /// Releases engine resources once the container is gone or its
    /// construction failed.
    ///
    /// # Errors
    ///
    /// Returns an error if cleanup itself failed.
    fn cleanup_container(
        &mut self,
        fatal: Option<&StockadeError>,
        status: Option<WaitStatus>,
    ) -> Result<()> {
        match (fatal, status) {
            (Some(error), _) => tracing::error!(error = %error, "container construction failed"),
            (None, Some(status)) => tracing::info!(?status, "container exited"),
            (None, None) => tracing::debug!("cleanup without container"),
        }
        Ok(())
    }

    /// Runs in the parent after fork, before the go byte is sent.
    ///
    /// # Errors
    ///
    /// An error aborts the launch and kills the child.
    fn post_start_process(&mut self, pid: Pid) -> Result<()> {
        tracing::debug!(%pid, "container process forked");
        Ok(())
    }
}

/// Blocks until the supervisor writes the go byte.
///
/// # Errors
///
/// Returns [`StockadeError::Process`] if the channel closed first.
pub fn wait_for_go(control: &mut UnixStream) -> Result<()> {
    let mut byte = [0_u8; 1];
    match control.read(&mut byte) {
        Ok(1) => Ok(()),
        Ok(_) => Err(StockadeError::Process {
            message: "control channel closed before start".into(),
        }),
        Err(e) => Err(StockadeError::Process {
            message: format!("reading control channel: {e}"),
        }),
    }
}

/// A process to exec inside the container.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Program and arguments.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries; the environment is otherwise empty.
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Target user id; unchanged when `None`.
    pub uid: Option<u32>,
    /// Target group id; unchanged when `None`.
    pub gid: Option<u32>,
}

impl ProcessSpec {
    /// Replaces the calling process. Only returns on failure.
    pub fn exec(&self) -> StockadeError {
        let Some((program, args)) = self.args.split_first() else {
            return StockadeError::Config {
                message: "process has no arguments".into(),
            };
        };

        let mut command = Command::new(program);
        let _ = command.args(args).env_clear().envs(self.env.iter().filter_map(|entry| {
            entry.split_once('=')
        }));
        if let Some(cwd) = &self.cwd {
            let _ = command.current_dir(cwd);
        }
        if let Some(gid) = self.gid.filter(|gid| Gid::from_raw(*gid) != getgid()) {
            let _ = command.gid(gid);
        }
        if let Some(uid) = self.uid.filter(|uid| Uid::from_raw(*uid) != getuid()) {
            let _ = command.uid(uid);
        }

        let error = command.exec();
        StockadeError::Process {
            message: format!("exec {program} failed: {error}"),
        }
    }
}

/// Writes one line to stderr from a forked container child.
///
/// Between fork and exec the child must not go through the tracing
/// subscriber: its writer lock may be held by a thread that no longer
/// exists in the child.
pub fn report_from_child(message: &str) {
    let line = format!("{}: {message}\n", env!("CARGO_PKG_NAME"));
    let _ = nix::unistd::write(std::io::stderr(), line.as_bytes());
}

/// Parses the engine payload of `common` into `T`.
///
/// # Errors
///
/// Returns [`StockadeError::Config`] naming the engine.
pub fn parse_payload<T: serde::de::DeserializeOwned>(common: &CommonConfig) -> Result<T> {
    serde_json::from_value(common.engine_config.clone()).map_err(|e| StockadeError::Config {
        message: format!("{} engine payload: {e}", common.engine_name),
    })
}

/// Maps a wait status to a shell-style exit code.
#[must_use]
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 255,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nix::sys::signal::Signal;

    use super::*;

    #[test]
    fn go_byte_releases_waiter() {
        let (mut parent, mut child) = UnixStream::pair().unwrap();
        parent.write_all(&[GO_BYTE]).unwrap();
        wait_for_go(&mut child).unwrap();
    }

    #[test]
    fn closed_channel_is_process_error() {
        let (parent, mut child) = UnixStream::pair().unwrap();
        drop(parent);
        assert!(matches!(
            wait_for_go(&mut child),
            Err(StockadeError::Process { .. })
        ));
    }

    #[test]
    fn empty_process_cannot_exec() {
        let err = ProcessSpec::default().exec();
        assert!(matches!(err, StockadeError::Config { .. }));
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        let pid = Pid::from_raw(42);
        assert_eq!(exit_code(WaitStatus::Exited(pid, 3)), 3);
        assert_eq!(
            exit_code(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            137
        );
    }

    #[test]
    fn malformed_payload_names_the_engine() {
        #[derive(Debug, serde::Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            args: Vec<String>,
        }
        let common =
            CommonConfig::new("standard").with_engine_config(serde_json::json!({"args": 7}));
        let err = parse_payload::<Payload>(&common).unwrap_err();
        assert!(err.to_string().contains("standard engine payload"));
    }
}
