mod decompose;
mod evaluate;
mod inspect;
mod list;
mod reassemble;
mod reset;

use std::path::Path;

use anyhow::{ensure, Result};
use clap::Parser;
use env_logger::Builder;
use guest_cli_wrapper::GuestTool;
use log::LevelFilter;

use crate::cmd::decompose::Decompose;
use crate::cmd::evaluate::Evaluate;
use crate::cmd::inspect::Inspect;
use crate::cmd::list::List;
use crate::cmd::reassemble::Reassemble;
use crate::cmd::reset::Reset;
use crate::config::Config;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;

/// A tool for storing virtual machine images in decomposed form and
/// rebuilding them on demand.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub(crate) struct Args {
    /// Set the logging level. One of [off|error|warn|info|debug|trace]. You
    /// can also leave this unset and use the RUST_LOG env variable. See
    /// https://github.com/rust-cli/env_logger/
    #[clap(long = "log-level")]
    pub(crate) log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    pub(crate) subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    /// Show what the repository currently stores.
    List(List),

    /// Inspect VMIs and declare their main services.
    Inspect(Inspect),

    /// Decompose VMIs into the repository.
    Decompose(Decompose),

    /// Reassemble stored VMIs into bootable images.
    Reassemble(Reassemble),

    /// Benchmark decomposition, reassembly, or similarity.
    Evaluate(Evaluate),

    /// Delete and re-seed the repository.
    Reset(Reset),
}

/// Entrypoint for the `vmsever` command line program.
pub(super) async fn run(args: Args) -> Result<()> {
    let config = Config::default_layout();
    match args.subcommand {
        Subcommand::List(list_args) => list_args.run(&config).await,
        Subcommand::Inspect(inspect_args) => inspect_args.run(&config).await,
        Subcommand::Decompose(decompose_args) => decompose_args.run(&config).await,
        Subcommand::Reassemble(reassemble_args) => reassemble_args.run(&config).await,
        Subcommand::Evaluate(evaluate_args) => evaluate_args.run(&config).await,
        Subcommand::Reset(reset_args) => reset_args.run(&config).await,
    }
}

/// use `level` if present, or else use `RUST_LOG` if present, or else use a
/// default.
pub(super) fn init_logger(level: Option<LevelFilter>) {
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            // RUST_LOG exists and level does not; use the environment variable.
            Builder::from_default_env().init();
        }
        _ => {
            // use provided log level or default for this crate only.
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

/// Paths given on the command line must be relative to the working
/// directory.
pub(crate) fn require_relative(path: &Path) -> Result<()> {
    ensure!(
        !path.is_absolute(),
        "'{}' is not a valid path. Please try again with a path relative to the working directory",
        path.display()
    );
    Ok(())
}

pub(crate) fn guest_tool() -> Result<GuestTool> {
    Ok(GuestTool::from_environment()?)
}
