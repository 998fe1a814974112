// cellar/src/cli/install.rs

use std::sync::Arc;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::Result;
use cellar_common::model::BuildSelections;
use clap::Args;
use tokio::sync::watch;
use tracing::instrument;

use crate::pipeline::runner::{self, PipelineFlags};

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Build the named formulas from their VCS head (needs CELLAR_ALLOW_HEAD=1)
    #[arg(long = "HEAD")]
    head: bool,
    /// Rebuild even when a matching keg is installed
    #[arg(long)]
    force: bool,
    #[arg(long)]
    include_optional: bool,
    #[arg(long)]
    skip_recommended: bool,
    /// Packages built concurrently (overrides CELLAR_JOBS)
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,
}

impl InstallArgs {
    #[instrument(skip(self, config, cache, variants, cancel), fields(targets = ?self.names))]
    pub async fn run(
        &self,
        config: &Config,
        cache: Arc<Cache>,
        variants: &BuildSelections,
        cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut config = config.clone();
        if let Some(jobs) = self.jobs {
            config.jobs = jobs.max(1);
        }

        let mut selections = variants.clone();
        selections.head = self.head;
        let flags = PipelineFlags {
            selections,
            include_optional: self.include_optional,
            skip_recommended: self.skip_recommended,
            force: self.force,
        };

        runner::run_pipeline(&self.names, &config, cache, &flags, cancel).await
    }
}
