// cellar-core/src/pipeline/worker.rs
use std::sync::Arc;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::Result;
use cellar_common::model::artifact::InstalledArtifact;
use cellar_common::pipeline::{PipelineEvent, WorkerJob};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument};

use crate::install::{install_formula, InstallContext, InstallLocks};

/// Everything a pool thread needs; cloned once per job.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub locks: InstallLocks,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub cancel: Option<watch::Receiver<bool>>,
    /// Runtime the async install state machine is driven on.
    pub runtime: Handle,
    pub force: bool,
}

#[instrument(skip_all, fields(job_id = %worker_job.request.target_id, attempt = %worker_job.attempt_id))]
pub(super) fn execute_sync_job(worker_job: WorkerJob, ctx: &WorkerContext) -> Result<InstalledArtifact> {
    let install_ctx = InstallContext {
        config: &ctx.config,
        cache: &ctx.cache,
        locks: &ctx.locks,
        event_tx: Some(ctx.event_tx.clone()),
        cancel: ctx.cancel.clone(),
        force: ctx.force,
    };
    debug!(
        "[{}] Running install state machine on the shared runtime",
        worker_job.request.target_id
    );
    ctx.runtime
        .block_on(install_formula(&worker_job, &install_ctx))
}
