//! LUKS device unlocking through `cryptsetup`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use stockade_common::constants::{CRYPT_NAME_PREFIX, CRYPTSETUP_BIN, DEVICE_MAPPER_DIR};
use stockade_common::error::{Result, StockadeError};
use stockade_common::types::{CryptArgs, CryptReply};

use crate::namespace::ipc;

/// A `cryptsetup` binary able to open LUKS2 devices.
#[derive(Debug, Clone)]
pub struct CryptDevice {
    binary: PathBuf,
}

impl CryptDevice {
    /// Finds `cryptsetup` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Device`] if it is not installed.
    pub fn locate() -> Result<Self> {
        let binary = which::which(CRYPTSETUP_BIN).map_err(|e| StockadeError::Device {
            message: format!("{CRYPTSETUP_BIN} not found: {e}"),
        })?;
        Ok(Self { binary })
    }

    /// Uses the given binary.
    #[must_use]
    pub const fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Opens `loop_device` under a fresh mapping name and returns the name.
    ///
    /// The key is written to the tool's stdin and never touches disk or the
    /// command line.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Device`] if the tool cannot run or fails.
    pub fn open(&self, key: &[u8], loop_device: &Path) -> Result<String> {
        let name = format!("{CRYPT_NAME_PREFIX}{}", uuid::Uuid::new_v4().simple());
        tracing::debug!(device = %loop_device.display(), name, "opening encrypted device");

        let mut child = Command::new(&self.binary)
            .args(["open", "--type", "luks2", "--key-file", "-"])
            .arg(loop_device)
            .arg(&name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StockadeError::Device {
                message: format!("cannot run {}: {e}", self.binary.display()),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A tool that exits early closes the pipe; its status tells why.
            if let Err(e) = stdin.write_all(key) {
                tracing::debug!(error = %e, "key pipe closed early");
            }
        }

        let output = child.wait_with_output().map_err(|e| StockadeError::Device {
            message: format!("waiting for {} failed: {e}", self.binary.display()),
        })?;
        if !output.status.success() {
            return Err(StockadeError::Device {
                message: format!(
                    "unlocking {} failed ({}): {}",
                    loop_device.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        tracing::info!(device = %loop_device.display(), name, "encrypted device opened");
        Ok(name)
    }
}

/// Returns the device-mapper node for mapping `name`.
#[must_use]
pub fn mapped_device_path(name: &str) -> PathBuf {
    Path::new(DEVICE_MAPPER_DIR).join(name)
}

/// Unlocks the encrypted device in `args`.
///
/// With a positive `master_pid` the tool runs on a dedicated thread that
/// joins the host IPC namespace for the duration and is then discarded.
///
/// # Errors
///
/// Returns [`StockadeError::Device`] on tool failures,
/// [`StockadeError::Namespace`] if the host namespace cannot be joined, or
/// [`StockadeError::NamespaceRestore`] if the way back failed.
pub fn unlock(args: CryptArgs) -> Result<CryptReply> {
    let device = CryptDevice::locate()?;
    let CryptArgs {
        key,
        loop_device,
        master_pid,
    } = args;

    let name = if master_pid > 0 {
        on_pinned_thread(move || {
            ipc::with_namespace_of(master_pid, || device.open(&key, &loop_device))
        })?
    } else {
        device.open(&key, &loop_device)?
    };

    Ok(CryptReply {
        device: mapped_device_path(&name),
    })
}

fn on_pinned_thread<R, F>(work: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("stockade-crypt".into())
        .spawn(work)
        .map_err(|e| StockadeError::Internal {
            message: format!("cannot spawn unlock thread: {e}"),
        })?;
    handle.join().map_err(|_| StockadeError::Internal {
        message: "unlock thread panicked".into(),
    })?
}
