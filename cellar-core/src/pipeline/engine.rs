// cellar-core/src/pipeline/engine.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cellar_common::error::Result;
use cellar_common::model::artifact::{InstalledArtifact, VerificationStatus};
use cellar_common::pipeline::{PipelineEvent, WorkerJob};
use crossbeam_channel::Receiver as CrossbeamReceiver;
use threadpool::ThreadPool;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::worker::{self, WorkerContext};

/// Result of one dispatched job, as handed back to the runner.
#[derive(Debug)]
pub struct JobOutcome {
    pub target_id: String,
    pub result: Result<InstalledArtifact>,
}

/// Feeds jobs from `worker_job_rx` into a pool of `config.jobs` threads
/// until the sender side is dropped, then waits for the pool to drain.
/// Every job ends in exactly one `JobSuccess` or `JobFailed` event and one
/// `JobOutcome` on `outcome_tx`.
#[instrument(skip_all, name = "core_worker_manager")]
pub fn start_worker_pool_manager(
    ctx: WorkerContext,
    worker_job_rx: CrossbeamReceiver<WorkerJob>,
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    success_count: Arc<AtomicUsize>,
    fail_count: Arc<AtomicUsize>,
) -> Result<()> {
    let num_workers = ctx.config.jobs.max(1);
    let pool = ThreadPool::new(num_workers);
    debug!("Core worker pool manager started with {} workers.", num_workers);

    for worker_job in worker_job_rx {
        let job_id = worker_job.request.target_id.clone();
        debug!("[{}] Received job from channel, submitting to pool.", job_id);

        let ctx_clone = ctx.clone();
        let success_count_clone = Arc::clone(&success_count);
        let fail_count_clone = Arc::clone(&fail_count);
        let outcome_tx_clone = outcome_tx.clone();

        let _ = ctx.event_tx.send(PipelineEvent::JobDispatched {
            target_id: job_id.clone(),
        });

        pool.execute(move || {
            let job_result = worker::execute_sync_job(worker_job, &ctx_clone);
            debug!(
                "[{}] Worker job finished, result ok: {}",
                job_id,
                job_result.is_ok()
            );
            match &job_result {
                Ok(artifact) => {
                    success_count_clone.fetch_add(1, Ordering::Relaxed);
                    let _ = ctx_clone.event_tx.send(PipelineEvent::JobSuccess {
                        target_id: job_id.clone(),
                        version: artifact.version.clone(),
                        verified: artifact.receipt.verification == VerificationStatus::Passed,
                    });
                }
                Err(err) => {
                    fail_count_clone.fetch_add(1, Ordering::Relaxed);
                    let _ = ctx_clone
                        .event_tx
                        .send(PipelineEvent::job_failed(job_id.clone(), err));
                }
            }
            let outcome = JobOutcome {
                target_id: job_id,
                result: job_result,
            };
            if outcome_tx_clone.send(outcome).is_err() {
                warn!("Runner stopped listening before a job outcome was delivered");
            }
        });
    }
    pool.join();
    debug!("Worker pool drained.");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use cellar_common::cache::Cache;
    use cellar_common::model::{BuildSelections, DependencyPresence};
    use cellar_common::pipeline::PlannedJob;
    use tokio::sync::broadcast;

    use super::*;
    use crate::install::InstallLocks;
    use crate::test_support::{test_config, toy_formula, write_tar_gz};

    #[test]
    fn pool_reports_each_job_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let tarball = dir.path().join("mirror/toy-1.0.tar.gz");
        write_tar_gz(&tarball, "toy-1.0", &[("build.sh", "#!/bin/sh\necho toy\n")]);
        let good = toy_formula("toy", &tarball, "");
        let bad = toy_formula(
            "broken",
            &tarball,
            "[[install.steps]]\nname = \"explode\"\nprogram = \"false\"\n",
        );

        let rt = tokio::runtime::Runtime::new().unwrap();
        let (event_tx, mut event_rx) = broadcast::channel(256);
        let ctx = WorkerContext {
            cache: Arc::new(Cache::new(&config).unwrap()),
            config,
            locks: InstallLocks::new(),
            event_tx,
            cancel: None,
            runtime: rt.handle().clone(),
            force: false,
        };
        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        for formula in [good, bad] {
            job_tx
                .send(WorkerJob {
                    request: PlannedJob {
                        target_id: formula.name.clone(),
                        formula: Arc::new(formula),
                        selections: BuildSelections::default(),
                        presence: DependencyPresence::new(),
                        is_target: true,
                        depends_on: vec![],
                    },
                    attempt_id: uuid::Uuid::new_v4().to_string(),
                })
                .unwrap();
        }
        drop(job_tx);

        let success = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicUsize::new(0));
        start_worker_pool_manager(
            ctx,
            job_rx,
            outcome_tx,
            Arc::clone(&success),
            Arc::clone(&fail),
        )
        .unwrap();
        assert_eq!(success.load(Ordering::Relaxed), 1);
        assert_eq!(fail.load(Ordering::Relaxed), 1);

        let mut outcomes = Vec::new();
        while let Ok(outcome) = outcome_rx.try_recv() {
            outcomes.push((outcome.target_id, outcome.result.map_err(|e| e.exit_code())));
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, "broken");
        assert_eq!(outcomes[0].1.as_ref().unwrap_err(), &5);
        assert!(outcomes[1].1.is_ok());

        let mut finished = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            match event {
                PipelineEvent::JobSuccess { target_id, .. } => finished.push(format!("ok:{target_id}")),
                PipelineEvent::JobFailed { target_id, stage, .. } => {
                    assert_eq!(stage, Some(cellar_common::error::InstallStage::Building));
                    finished.push(format!("failed:{target_id}"))
                }
                _ => {}
            }
        }
        finished.sort();
        assert_eq!(finished, vec!["failed:broken", "ok:toy"]);
    }
}
