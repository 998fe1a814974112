// cellar-core/src/pipeline/mod.rs
pub mod engine;
pub mod worker;

use cellar_common::pipeline::{PlannedJob, WorkerJob};

pub use engine::{start_worker_pool_manager, JobOutcome};
pub use worker::WorkerContext;

/// Wraps `request` for dispatch with a fresh attempt id.
pub fn worker_job(request: PlannedJob) -> WorkerJob {
    WorkerJob {
        request,
        attempt_id: uuid::Uuid::new_v4().simple().to_string(),
    }
}
