//! `stockade engines` — List the registered engines.

use clap::Args;
use stockade_runtime::engine::EngineRegistry;

/// Arguments for the `engines` command.
#[derive(Args, Debug)]
pub struct EnginesArgs {}

/// Executes the `engines` command.
///
/// # Errors
///
/// Never fails; kept fallible for dispatch uniformity.
#[allow(clippy::unnecessary_wraps)]
pub fn execute(_args: &EnginesArgs) -> anyhow::Result<()> {
    let registry = EngineRegistry::with_builtin();
    for name in registry.names() {
        println!("{name}");
    }
    Ok(())
}
