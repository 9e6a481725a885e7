//! Image build engine.
//!
//! Instead of exec'ing a long-running process, the child runs the recipe's
//! `%post` and `%test` scripts inside the constructed root and exits:
//! `0` when the build succeeded, `255` when either script failed.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};
use stockade_common::config::CommonConfig;
use stockade_common::constants::{
    BUILD_ENV_PREFIX, BUILD_FAILURE_EXIT_CODE, BUILD_HOME, BUILD_PASSTHROUGH_ENV, DEFAULT_PATH,
};
use stockade_common::error::{Result, StockadeError};

use super::{EngineOperations, parse_payload, report_from_child, wait_for_go};

/// Payload of the `imgbuild` engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Root filesystem being built.
    pub rootfs: PathBuf,
    /// Sections to run: `all`, `none`, or section names.
    #[serde(default = "default_sections")]
    pub sections: Vec<String>,
    /// Skip `%test`.
    #[serde(default)]
    pub no_test: bool,
    /// `KEY=VALUE` entries the build environment is derived from.
    #[serde(default)]
    pub env: Vec<String>,
    /// `%post` script body.
    #[serde(default)]
    pub post: Option<String>,
    /// `%test` script body.
    #[serde(default)]
    pub test: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::new(),
            sections: default_sections(),
            no_test: false,
            env: Vec::new(),
            post: None,
            test: None,
        }
    }
}

fn default_sections() -> Vec<String> {
    vec!["all".to_owned()]
}

impl BuildConfig {
    /// Returns whether section `name` is selected. The first `none`, `all`
    /// or matching name in the list decides.
    #[must_use]
    pub fn runs_section(&self, name: &str) -> bool {
        for section in &self.sections {
            match section.as_str() {
                "none" => return false,
                "all" => return true,
                s if s == name => return true,
                _ => {}
            }
        }
        false
    }
}

/// Builds the script environment from `source` entries.
///
/// Only `PATH`, `HOME`, unprefixed `STOCKADEENV_*` entries and the
/// passthrough variables survive.
#[must_use]
pub fn build_environment(source: &[String]) -> Vec<(String, String)> {
    let mut env = vec![
        ("PATH".to_owned(), DEFAULT_PATH.to_owned()),
        ("HOME".to_owned(), BUILD_HOME.to_owned()),
    ];
    for entry in source {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if let Some(stripped) = key.strip_prefix(BUILD_ENV_PREFIX) {
            if !stripped.is_empty() {
                env.push((stripped.to_owned(), value.to_owned()));
            }
        } else if BUILD_PASSTHROUGH_ENV.contains(&key) {
            env.push((key.to_owned(), value.to_owned()));
        }
    }
    env
}

/// The `imgbuild` engine.
#[derive(Debug, Default)]
pub struct ImageBuildEngine {
    config: BuildConfig,
}

impl ImageBuildEngine {
    /// Registry name.
    pub const NAME: &'static str = "imgbuild";

    /// Registry factory.
    #[must_use]
    pub fn boxed() -> Box<dyn EngineOperations> {
        Box::new(Self::default())
    }

    /// Runs the selected sections and returns the exit code of the build.
    #[must_use]
    pub fn run_sections(&self) -> i32 {
        let env = build_environment(&self.config.env);

        if self.config.runs_section("post") {
            if let Some(script) = non_empty(self.config.post.as_deref()) {
                if let Err(e) = run_script("post", script, &env) {
                    report_from_child(&e.to_string());
                    return BUILD_FAILURE_EXIT_CODE;
                }
            }
        }

        if self.config.runs_section("test") && !self.config.no_test {
            if let Some(script) = non_empty(self.config.test.as_deref()) {
                if let Err(e) = run_script("test", script, &env) {
                    report_from_child(&e.to_string());
                    return BUILD_FAILURE_EXIT_CODE;
                }
            }
        }
        0
    }
}

impl EngineOperations for ImageBuildEngine {
    fn init_config(&mut self, common: CommonConfig) -> Result<()> {
        self.config = parse_payload(&common)?;
        tracing::debug!(
            rootfs = %self.config.rootfs.display(),
            sections = ?self.config.sections,
            "imgbuild engine configured"
        );
        Ok(())
    }

    fn config(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.config)?)
    }

    fn start_process(&mut self, control: &mut UnixStream) -> Result<()> {
        wait_for_go(control)?;
        std::process::exit(self.run_sections())
    }
}

fn non_empty(script: Option<&str>) -> Option<&str> {
    script.filter(|s| !s.trim().is_empty())
}

fn run_script(section: &str, script: &str, env: &[(String, String)]) -> Result<()> {
    let status = Command::new("/bin/sh")
        .args(["-e", "-c", script])
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .status()
        .map_err(|e| StockadeError::Process {
            message: format!("cannot run %{section}: {e}"),
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(StockadeError::Process {
            message: format!("%{section} exited with {status}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn engine(payload: serde_json::Value) -> ImageBuildEngine {
        let mut engine = ImageBuildEngine::default();
        engine
            .init_config(CommonConfig::new("imgbuild").with_engine_config(payload))
            .unwrap();
        engine
    }

    #[test]
    fn section_selection_follows_first_decisive_entry() {
        let mut config = BuildConfig::default();
        assert!(config.runs_section("post"));

        config.sections = vec!["test".into()];
        assert!(config.runs_section("test"));
        assert!(!config.runs_section("post"));

        config.sections = vec!["none".into(), "all".into()];
        assert!(!config.runs_section("post"));
    }

    #[test]
    fn environment_is_cleaned() {
        let env = build_environment(&[
            "STOCKADEENV_FOO=bar".into(),
            "STOCKADE_ROOTFS=/tmp/rootfs".into(),
            "SECRET_TOKEN=hunter2".into(),
            "STOCKADEENV_=ignored".into(),
            "garbage".into(),
        ]);
        assert!(env.contains(&("PATH".into(), DEFAULT_PATH.into())));
        assert!(env.contains(&("HOME".into(), "/root".into())));
        assert!(env.contains(&("FOO".into(), "bar".into())));
        assert!(env.contains(&("STOCKADE_ROOTFS".into(), "/tmp/rootfs".into())));
        assert!(!env.iter().any(|(k, _)| k == "SECRET_TOKEN"));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn successful_post_exits_zero() {
        let engine = engine(json!({"rootfs": "/r", "post": "true"}));
        assert_eq!(engine.run_sections(), 0);
    }

    #[test]
    fn failing_post_exits_with_build_failure() {
        let engine = engine(json!({"rootfs": "/r", "post": "exit 3"}));
        assert_eq!(engine.run_sections(), BUILD_FAILURE_EXIT_CODE);
    }

    #[test]
    fn failing_test_fails_the_build() {
        let engine = engine(json!({"rootfs": "/r", "post": "true", "test": "exit 1"}));
        assert_eq!(engine.run_sections(), BUILD_FAILURE_EXIT_CODE);
    }

    #[test]
    fn failing_post_skips_test() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("tested");
        let engine = engine(json!({
            "rootfs": "/r",
            "post": "exit 1",
            "test": format!("touch {}", marker.display())
        }));
        assert_eq!(engine.run_sections(), BUILD_FAILURE_EXIT_CODE);
        assert!(!marker.exists());
    }

    #[test]
    fn scripts_see_only_the_clean_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let engine = engine(json!({
            "rootfs": "/r",
            "env": ["STOCKADEENV_GREETING=hello", "LEAK=1"],
            "post": format!("[ \"$GREETING\" = hello ] && [ -z \"$LEAK\" ] && touch {}", out.display())
        }));
        assert_eq!(engine.run_sections(), 0);
        assert!(out.exists());
    }

    #[test]
    fn none_skips_every_section() {
        let engine = engine(json!({"rootfs": "/r", "sections": ["none"], "post": "exit 1"}));
        assert_eq!(engine.run_sections(), 0);
    }

    #[test]
    fn no_test_skips_test() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let engine = engine(json!({
            "rootfs": "/r",
            "no_test": true,
            "test": format!("touch {}", marker.display())
        }));
        assert_eq!(engine.run_sections(), 0);
        assert!(!marker.exists());
    }
}
