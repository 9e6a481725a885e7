//! `stockade run` — Construct and run a container.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use stockade_common::config::StockadeConfig;
use stockade_core::affinity::AffinityExecutor;
use stockade_runtime::engine::{EngineRegistry, exit_code};
use stockade_runtime::supervisor::{RunConfig, Supervisor};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Run configuration: engine selection, payload and construction plan.
    #[arg(long)]
    pub config: PathBuf,
}

/// Executes the `run` command.
///
/// The process exits with the container's exit code.
///
/// # Errors
///
/// Returns an error if the run configuration is invalid or construction
/// fails.
pub fn execute(args: &RunArgs, config: &StockadeConfig) -> anyhow::Result<()> {
    let mut run = RunConfig::load(&args.config)?;
    run.plan.apply_defaults(config);
    tracing::info!(
        engine = %run.common.engine_name,
        container = %run.common.container_id,
        steps = run.plan.steps.len(),
        "starting container construction"
    );

    let supervisor = Supervisor::new(
        Arc::new(EngineRegistry::with_builtin()),
        AffinityExecutor::spawn()?,
    );
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    let status = runtime.block_on(supervisor.run(run))?;

    let code = exit_code(status);
    tracing::info!(code, "container finished");
    std::process::exit(code)
}
