// cellar/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::sync::Arc;

use cellar_common::error::Result;
use cellar_common::model::BuildSelections;
use cellar_common::{Cache, Config};
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;

pub mod fetch;
pub mod info;
pub mod install;
pub mod list;
pub mod status;
pub mod test;

use crate::cli::fetch::FetchArgs;
use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::test::TestArgs;

/// Variant flags (`--with-<option>`, `--without-<option>`) are accepted
/// anywhere on the command line by `install` and `info`.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "cellar", bin_name = "cellar")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build and install formulas and their dependencies from source
    Install(InstallArgs),
    /// Run a formula's post-install checks against its installed keg
    Test(TestArgs),
    /// Download and verify sources into the cache without building
    Fetch(FetchArgs),
    /// Show a formula's dependencies, options and resolved build flags
    Info(Info),
    /// List installed kegs
    List(List),
}

impl Command {
    fn takes_variants(&self) -> bool {
        matches!(self, Self::Install(_) | Self::Info(_) | Self::Fetch(_))
    }

    pub async fn run(
        &self,
        config: &Config,
        cache: Arc<Cache>,
        variants: &BuildSelections,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        if !variants.is_default() && !self.takes_variants() {
            warn!("Ignoring --with-/--without- flags for this command");
        }
        match self {
            Self::Install(command) => command.run(config, cache, variants, cancel).await,
            Self::Test(command) => command.run(config, cancel).await,
            Self::Fetch(command) => command.run(config, cache, variants, cancel).await,
            Self::Info(command) => command.run(config, variants).await,
            Self::List(command) => command.run(config).await,
        }
    }
}
