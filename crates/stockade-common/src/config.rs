//! Configuration models for the Stockade runtime.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StockadeError};
use crate::types::{ContainerId, EngineName};

/// Runtime-wide defaults, loaded once by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StockadeConfig {
    /// Base directory for runtime state.
    pub state_dir: PathBuf,
    /// Upper bound on loop device indexes scanned per attachment.
    pub max_loop_devices: u32,
}

impl Default for StockadeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(crate::constants::DEFAULT_STATE_DIR),
            max_loop_devices: crate::constants::DEFAULT_MAX_LOOP_DEVICES,
        }
    }
}

impl StockadeConfig {
    /// Loads the configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed,
    /// or if it sets `max_loop_devices` to zero.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(StockadeError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };
        let config: Self = serde_json::from_str(&content)?;
        if config.max_loop_devices == 0 {
            return Err(StockadeError::Config {
                message: "max_loop_devices must be greater than zero".into(),
            });
        }
        Ok(config)
    }
}

/// Namespaces requested for the container.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceRequest {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

/// Identity the contained process runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// Configuration shared by every engine variant.
///
/// `engine_config` is opaque here; only the engine registered under
/// `engine_name` knows how to interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Engine selected for this container.
    pub engine_name: EngineName,
    /// Container instance identifier.
    #[serde(default)]
    pub container_id: ContainerId,
    /// Namespaces requested for the container.
    #[serde(default)]
    pub namespaces: NamespaceRequest,
    /// Identity of the contained process; the supervisor's own when absent.
    #[serde(default)]
    pub identity: Option<ProcessIdentity>,
    /// Engine-specific payload.
    #[serde(default)]
    pub engine_config: serde_json::Value,
}

impl CommonConfig {
    /// Creates a configuration for the named engine with an empty payload.
    #[must_use]
    pub fn new(engine_name: impl Into<String>) -> Self {
        Self {
            engine_name: EngineName::new(engine_name),
            container_id: ContainerId::generate(),
            namespaces: NamespaceRequest::default(),
            identity: None,
            engine_config: serde_json::Value::Null,
        }
    }

    /// Sets the engine-specific payload.
    #[must_use]
    pub fn with_engine_config(mut self, payload: serde_json::Value) -> Self {
        self.engine_config = payload;
        self
    }
}
