//! CLI command definitions and dispatch.

pub mod engines;
pub mod run;
pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stockade_common::config::StockadeConfig;

/// Stockade — privileged construction runtime for containers.
#[derive(Parser, Debug)]
#[command(name = "stockade", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Runtime configuration file.
    #[arg(long, global = true, default_value = stockade_common::constants::DEFAULT_CONFIG_FILE)]
    pub config_file: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the registered engines.
    Engines(engines::EnginesArgs),
    /// Serve an engine's privileged operations on a Unix socket.
    Serve(serve::ServeArgs),
    /// Construct and run a container from a run configuration.
    Run(run::RunArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = StockadeConfig::load(&cli.config_file)?;
    match cli.command {
        Command::Engines(args) => engines::execute(&args),
        Command::Serve(args) => serve::execute(args, &config),
        Command::Run(args) => run::execute(&args, &config),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_takes_socket_and_engine() {
        let cli = Cli::try_parse_from([
            "stockade",
            "serve",
            "--socket",
            "/run/stockade.sock",
            "--engine",
            "oci",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.engine, "oci");
        assert_eq!(args.socket, Some(PathBuf::from("/run/stockade.sock")));
    }

    #[test]
    fn json_logging_is_selectable() {
        let cli = Cli::try_parse_from(["stockade", "--log-format", "json", "engines"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
