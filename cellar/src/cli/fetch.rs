// cellar/src/cli/fetch.rs

use std::sync::Arc;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::Result;
use cellar_common::formulary::Formulary;
use cellar_common::model::BuildSelections;
use cellar_core::fetch::{FetchedMain, Fetcher};
use clap::Args;
use colored::Colorize;
use tokio::sync::watch;

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Check out the VCS head instead of the release archive
    #[arg(long = "HEAD")]
    head: bool,
}

impl FetchArgs {
    pub async fn run(
        &self,
        config: &Config,
        cache: Arc<Cache>,
        variants: &BuildSelections,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let formulary = Formulary::new(config);
        for name in &self.names {
            let formula = formulary.load_formula(name)?;
            let mut selections = variants.clone();
            selections.head = self.head;
            formula.check_selections(&selections)?;

            let fetched = Fetcher::new(config, &cache, name.as_str())
                .with_cancel(Some(cancel.clone()))
                .fetch_all(&formula, &selections)
                .await?;
            match &fetched.main {
                FetchedMain::Archive { path, .. } => {
                    println!("{} {}: {}", "✓".green(), name.cyan(), path.display());
                }
                FetchedMain::Head { checkout, commit, .. } => {
                    println!(
                        "{} {}: {} @ {}",
                        "✓".green(),
                        name.cyan(),
                        checkout.display(),
                        commit
                    );
                }
            }
            for (res, path) in &fetched.resources {
                println!("    resource {}: {}", res.name, path.display());
            }
            for patch in &fetched.patches {
                println!("    patch {}", patch.name);
            }
        }
        Ok(())
    }
}
