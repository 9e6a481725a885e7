//! Container construction supervisor.
//!
//! The supervisor owns one construction from start to exit:
//! 1. look up the engine and initialise its configuration;
//! 2. create the requested namespaces on the affinity worker;
//! 3. serve the engine's catalogue over a socket pair and replay the
//!    construction plan through it, stopping at the first failure;
//! 4. fork the container from the worker, release it with the go byte,
//!    monitor it and clean up.

use std::io::Write;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use serde::{Deserialize, Serialize};
use signal_hook::iterator::Signals;
use stockade_common::config::{CommonConfig, StockadeConfig};
use stockade_common::constants::BUILD_FAILURE_EXIT_CODE;
use stockade_common::error::{Result, StockadeError};
use stockade_core::affinity::AffinityExecutor;
use stockade_core::namespace;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use crate::engine::monitor::monitored_signals;
use crate::engine::{EngineOperations, EngineRegistry, GO_BYTE, report_from_child};
use crate::rpc::{Methods, PrivilegedClient, PrivilegedServer, Request};

/// Ordered privileged requests that build the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstructionPlan {
    /// Requests in execution order.
    pub steps: Vec<Request>,
}

impl ConstructionPlan {
    /// Fills runtime defaults into steps that left them unset: a loop
    /// attachment with `max_devices == 0` scans the configured range.
    pub fn apply_defaults(&mut self, config: &StockadeConfig) {
        for step in &mut self.steps {
            if let Request::LoopDevice(args) = step {
                if args.max_devices == 0 {
                    args.max_devices = config.max_loop_devices;
                }
            }
        }
    }
}

/// Everything needed for one `stockade run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Engine selection and shared configuration.
    pub common: CommonConfig,
    /// Construction steps.
    #[serde(default)]
    pub plan: ConstructionPlan,
}

impl RunConfig {
    /// Loads a run configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Io`] if unreadable or
    /// [`StockadeError::Config`] if malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StockadeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| StockadeError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }
}

/// An engine instance ready to be launched.
pub struct PreparedEngine {
    /// Lifecycle operations, configured.
    pub engine: Box<dyn EngineOperations>,
    /// Operation catalogue for the engine's server.
    pub methods: Arc<dyn Methods>,
}

impl std::fmt::Debug for PreparedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedEngine").finish_non_exhaustive()
    }
}

/// Drives container constructions.
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Arc<EngineRegistry>,
    executor: AffinityExecutor,
}

impl Supervisor {
    /// Creates a supervisor over a built registry and the affinity worker.
    #[must_use]
    pub const fn new(registry: Arc<EngineRegistry>, executor: AffinityExecutor) -> Self {
        Self { registry, executor }
    }

    /// Looks up the engine named in `common` and initialises it.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::NotFound`] for an unknown engine or the
    /// engine's configuration error.
    pub fn prepare(&self, common: CommonConfig) -> Result<PreparedEngine> {
        let registration = self.registry.lookup(&common.engine_name)?;
        let mut engine = registration.instantiate();
        engine.init_config(common)?;
        Ok(PreparedEngine {
            engine,
            methods: Arc::clone(&registration.methods),
        })
    }

    /// Starts an in-process server for `methods` over a socket pair.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::Transport`] if the socket pair fails.
    pub fn start_server(
        &self,
        methods: Arc<dyn Methods>,
    ) -> Result<(PrivilegedClient<UnixStream>, JoinHandle<Result<()>>)> {
        let (client, server_end) = UnixStream::pair().map_err(|e| StockadeError::Transport {
            message: format!("socketpair failed: {e}"),
        })?;
        let server = PrivilegedServer::new(methods, self.executor.clone());
        let task = tokio::spawn(async move { server.serve_stream(server_end).await });
        Ok((PrivilegedClient::new(client), task))
    }

    /// Replays `plan` through `client`, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first step's error.
    pub async fn construct<S>(client: &mut PrivilegedClient<S>, plan: &ConstructionPlan) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for (index, step) in plan.steps.iter().enumerate() {
            tracing::debug!(step = index, method = step.method(), "construction step");
            if let Err(error) = client.call(step).await {
                tracing::error!(step = index, method = step.method(), error = %error, "construction aborted");
                return Err(error);
            }
        }
        tracing::info!(steps = plan.steps.len(), "container constructed");
        Ok(())
    }

    /// Runs one container to completion and returns its wait status.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of any phase.
    pub async fn run(&self, config: RunConfig) -> Result<WaitStatus> {
        let namespaces = config.common.namespaces.clone();
        let PreparedEngine {
            mut engine,
            methods,
        } = self.prepare(config.common)?;

        if let Err(error) = self
            .executor
            .run(move || namespace::create_namespaces(&namespaces))
        {
            let _ = engine.cleanup_container(Some(&error), None);
            return Err(error);
        }

        let (mut client, server) = self.start_server(methods)?;
        let constructed = Self::construct(&mut client, &config.plan).await;
        drop(client);
        let served = server.await.unwrap_or_else(|e| {
            Err(StockadeError::Internal {
                message: format!("server task failed: {e}"),
            })
        });
        if let Err(error) = constructed.and(served) {
            let _ = engine.cleanup_container(Some(&error), None);
            return Err(error);
        }

        let executor = self.executor.clone();
        tokio::task::spawn_blocking(move || launch(&executor, engine))
            .await
            .unwrap_or_else(|e| {
                Err(StockadeError::Internal {
                    message: format!("launch task failed: {e}"),
                })
            })
    }
}

/// Forks the container from the affinity worker and supervises it.
///
/// Signal handlers are installed before the fork so no `SIGCHLD` is lost.
///
/// # Errors
///
/// Returns fork, post-start, control channel or monitoring errors.
pub fn launch(executor: &AffinityExecutor, engine: Box<dyn EngineOperations>) -> Result<WaitStatus> {
    let mut signals = Signals::new(monitored_signals()).map_err(|e| StockadeError::Process {
        message: format!("installing signal handlers: {e}"),
    })?;
    let (mut control, child_control) =
        StdUnixStream::pair().map_err(|e| StockadeError::Transport {
            message: format!("control socketpair failed: {e}"),
        })?;

    let (pid, mut engine) = executor.run(move || fork_container(engine, child_control))?;
    tracing::info!(%pid, "container process started");

    let released = engine.post_start_process(pid).and_then(|()| {
        control
            .write_all(&[GO_BYTE])
            .map_err(|e| StockadeError::Process {
                message: format!("sending go byte: {e}"),
            })
    });
    if let Err(error) = released {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        let _ = engine.cleanup_container(Some(&error), None);
        return Err(error);
    }

    match engine.monitor_container(pid, &mut signals.forever()) {
        Ok(status) => {
            engine.cleanup_container(None, Some(status))?;
            Ok(status)
        }
        Err(error) => {
            let _ = engine.cleanup_container(Some(&error), None);
            Err(error)
        }
    }
}

fn fork_container(
    mut engine: Box<dyn EngineOperations>,
    mut control: StdUnixStream,
) -> Result<(Pid, Box<dyn EngineOperations>)> {
    // SAFETY: the child only waits on its control channel and then execs
    // or exits; it never returns into the worker loop and never logs
    // through tracing.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok((child, engine)),
        Ok(ForkResult::Child) => {
            let code = match engine.start_process(&mut control) {
                Ok(()) => 0,
                Err(error) => {
                    report_from_child(&format!("container process failed to start: {error}"));
                    BUILD_FAILURE_EXIT_CODE
                }
            };
            std::process::exit(code)
        }
        Err(e) => Err(StockadeError::Process {
            message: format!("fork failed: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_config_reads_plan_as_array() {
        let config: RunConfig = serde_json::from_value(json!({
            "common": {"engine_name": "standard", "engine_config": {"args": ["/bin/true"]}},
            "plan": [
                {"method": "Mkdir", "args": {"path": "/tmp/x", "mode": 493}},
                {"method": "SetHostname", "args": {"hostname": "box"}}
            ]
        }))
        .unwrap();
        assert_eq!(config.plan.steps.len(), 2);
        assert_eq!(config.plan.steps[1].method(), "SetHostname");
    }

    #[test]
    fn unset_loop_bounds_take_the_runtime_default() {
        let mut plan: ConstructionPlan = serde_json::from_value(json!([
            {"method": "LoopDevice", "args": {"image": "/a.img", "mode": 0, "max_devices": 0}},
            {"method": "LoopDevice", "args": {"image": "/b.img", "mode": 0, "max_devices": 4}}
        ]))
        .unwrap();
        plan.apply_defaults(&StockadeConfig::default());

        let bounds: Vec<u32> = plan
            .steps
            .iter()
            .filter_map(|step| match step {
                Request::LoopDevice(args) => Some(args.max_devices),
                _ => None,
            })
            .collect();
        assert_eq!(bounds, [256, 4]);
    }

    #[test]
    fn missing_run_config_is_io_error() {
        let err = RunConfig::load(Path::new("/nonexistent/run.json")).unwrap_err();
        assert!(matches!(err, StockadeError::Io { .. }));
    }

    #[test]
    fn unknown_engine_fails_preparation() {
        let supervisor = Supervisor::new(
            Arc::new(EngineRegistry::with_builtin()),
            AffinityExecutor::spawn().unwrap(),
        );
        let err = supervisor
            .prepare(CommonConfig::new("singularity"))
            .unwrap_err();
        assert!(matches!(err, StockadeError::NotFound { .. }));
    }
}
