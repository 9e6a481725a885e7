//! Plain container engine: exec a command inside the constructed root.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stockade_common::config::{CommonConfig, ProcessIdentity};
use stockade_common::error::{Result, StockadeError};

use super::{EngineOperations, ProcessSpec, parse_payload, wait_for_go};

/// Payload of the `standard` engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardConfig {
    /// Program and arguments.
    pub args: Vec<String>,
    /// `KEY=VALUE` environment entries.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// The `standard` engine.
#[derive(Debug, Default)]
pub struct StandardEngine {
    config: StandardConfig,
    identity: Option<ProcessIdentity>,
}

impl StandardEngine {
    /// Registry name.
    pub const NAME: &'static str = "standard";

    /// Registry factory.
    #[must_use]
    pub fn boxed() -> Box<dyn EngineOperations> {
        Box::new(Self::default())
    }
}

impl EngineOperations for StandardEngine {
    fn init_config(&mut self, common: CommonConfig) -> Result<()> {
        let config: StandardConfig = parse_payload(&common)?;
        if config.args.is_empty() {
            return Err(StockadeError::Config {
                message: "standard engine needs at least one argument".into(),
            });
        }
        tracing::debug!(container = %common.container_id, program = %config.args[0], "standard engine configured");
        self.config = config;
        self.identity = common.identity;
        Ok(())
    }

    fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn start_process(&mut self, control: &mut UnixStream) -> Result<()> {
        wait_for_go(control)?;
        let spec = ProcessSpec {
            args: self.config.args.clone(),
            env: self.config.env.clone(),
            cwd: self.config.cwd.clone(),
            uid: self.identity.map(|id| id.uid),
            gid: self.identity.map(|id| id.gid),
        };
        Err(spec.exec())
    }
}
