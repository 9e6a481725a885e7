//! `stockade serve` — Serve an engine's privileged operations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use stockade_common::config::StockadeConfig;
use stockade_common::types::EngineName;
use stockade_core::affinity::AffinityExecutor;
use stockade_runtime::engine::EngineRegistry;
use stockade_runtime::rpc::PrivilegedServer;

/// Socket name under the state directory when `--socket` is omitted.
const DEFAULT_SOCKET_NAME: &str = "privileged.sock";

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Unix socket to listen on.
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Engine whose operation catalogue is served.
    #[arg(long, default_value = "standard")]
    pub engine: String,
}

/// Executes the `serve` command.
///
/// Accepts a single supervisor connection and serves it until it closes.
///
/// # Errors
///
/// Returns an error for an unknown engine, a socket failure, or once the
/// server has been poisoned.
pub fn execute(args: ServeArgs, config: &StockadeConfig) -> anyhow::Result<()> {
    let registry = EngineRegistry::with_builtin();
    let registration = registry.lookup(&EngineName::new(args.engine.clone()))?;
    let socket = args
        .socket
        .unwrap_or_else(|| config.state_dir.join(DEFAULT_SOCKET_NAME));

    let executor = AffinityExecutor::spawn()?;
    let server = PrivilegedServer::new(Arc::clone(&registration.methods), executor);
    tracing::info!(engine = %args.engine, socket = %socket.display(), "starting privileged server");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    let served = runtime.block_on(server.serve_unix_socket(&socket));
    if let Err(e) = std::fs::remove_file(&socket) {
        tracing::debug!(error = %e, "socket cleanup skipped");
    }
    served?;
    Ok(())
}
