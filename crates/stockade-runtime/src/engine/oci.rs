//! OCI bundle engine.
//!
//! Only the `process` section of the runtime spec is interpreted; root
//! filesystem and mounts are prepared by the construction plan.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use stockade_common::config::CommonConfig;
use stockade_common::error::{Result, StockadeError};

use super::{EngineOperations, ProcessSpec, parse_payload, wait_for_go};

/// Name of the runtime spec inside a bundle.
pub const BUNDLE_CONFIG: &str = "config.json";

/// Subset of the OCI runtime spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciSpec {
    /// Spec version.
    #[serde(rename = "ociVersion", default)]
    pub oci_version: String,
    /// Container process.
    #[serde(default)]
    pub process: Option<OciProcess>,
    /// Container root.
    #[serde(default)]
    pub root: Option<OciRoot>,
    /// Container hostname.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// `process` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciProcess {
    /// Allocate a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// Identity of the process.
    #[serde(default)]
    pub user: OciUser,
    /// Program and arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
}

/// `process.user` section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciUser {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

/// `root` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciRoot {
    /// Root filesystem, relative to the bundle.
    pub path: PathBuf,
    /// Mount the root read-only.
    #[serde(default)]
    pub readonly: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

/// Payload of the `oci` engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciConfig {
    /// Bundle directory.
    pub bundle: PathBuf,
    /// Runtime spec; read from `<bundle>/config.json` when absent.
    #[serde(default)]
    pub spec: Option<OciSpec>,
}

/// Reads the runtime spec of `bundle`.
///
/// # Errors
///
/// Returns [`StockadeError::Io`] if the file is unreadable or
/// [`StockadeError::Config`] if it is not a valid spec.
pub fn load_bundle_spec(bundle: &Path) -> Result<OciSpec> {
    let path = bundle.join(BUNDLE_CONFIG);
    let content = std::fs::read_to_string(&path).map_err(|e| StockadeError::Io {
        path: path.clone(),
        source: e,
    })?;
    serde_json::from_str(&content).map_err(|e| StockadeError::Config {
        message: format!("{}: {e}", path.display()),
    })
}

/// The `oci` engine.
#[derive(Debug, Default)]
pub struct OciEngine {
    config: OciConfig,
}

impl OciEngine {
    /// Registry name.
    pub const NAME: &'static str = "oci";

    /// Registry factory.
    #[must_use]
    pub fn boxed() -> Box<dyn EngineOperations> {
        Box::new(Self::default())
    }

    fn process(&self) -> Result<&OciProcess> {
        self.config
            .spec
            .as_ref()
            .and_then(|spec| spec.process.as_ref())
            .ok_or_else(|| StockadeError::Config {
                message: "OCI spec has no process section".into(),
            })
    }
}

impl EngineOperations for OciEngine {
    fn init_config(&mut self, common: CommonConfig) -> Result<()> {
        let mut config: OciConfig = parse_payload(&common)?;
        if config.spec.is_none() {
            config.spec = Some(load_bundle_spec(&config.bundle)?);
        }
        self.config = config;

        let process = self.process()?;
        if process.args.is_empty() {
            return Err(StockadeError::Config {
                message: "OCI process.args must not be empty".into(),
            });
        }
        tracing::debug!(
            container = %common.container_id,
            bundle = %self.config.bundle.display(),
            "oci engine configured"
        );
        Ok(())
    }

    fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn start_process(&mut self, control: &mut UnixStream) -> Result<()> {
        wait_for_go(control)?;
        let process = self.process()?;
        let spec = ProcessSpec {
            args: process.args.clone(),
            env: process.env.clone(),
            cwd: Some(process.cwd.clone()),
            uid: Some(process.user.uid),
            gid: Some(process.user.gid),
        };
        Err(spec.exec())
    }
}
