// cellar/src/pipeline/runner.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::{CellarError, Result};
use cellar_common::formulary::Formulary;
use cellar_common::model::BuildSelections;
use cellar_common::pipeline::{JobProcessingState, PipelineEvent, PlannedJob, WorkerJob};
use cellar_core::{start_worker_pool_manager, worker_job, InstallLocks, JobOutcome, WorkerContext};
use colored::Colorize;
use crossbeam_channel::{bounded as crossbeam_bounded, Sender as CrossbeamSender};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, instrument, warn};

use super::planner::OperationPlanner;

const WORKER_JOB_CHANNEL_SIZE: usize = 100;
const EVENT_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct PipelineFlags {
    /// `--with-*`, `--without-*` and `--HEAD` as given on the command line.
    pub selections: BuildSelections,
    pub include_optional: bool,
    pub skip_recommended: bool,
    pub force: bool,
}

pub(crate) fn get_panic_message(e: Box<dyn std::any::Any + Send>) -> String {
    match e.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match e.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}

/// Per-job state for one pipeline run. A job is dispatched only once all of
/// its in-plan dependencies succeeded; a failure skips everything that
/// transitively depends on it.
pub(crate) struct JobBoard {
    jobs: Vec<PlannedJob>,
    states: HashMap<String, JobProcessingState>,
}

impl JobBoard {
    pub fn new(jobs: Vec<PlannedJob>) -> Self {
        let states = jobs
            .iter()
            .map(|j| (j.target_id.clone(), JobProcessingState::WaitingForDependencies))
            .collect();
        Self { jobs, states }
    }

    fn state(&self, id: &str) -> Option<&JobProcessingState> {
        self.states.get(id)
    }

    /// Waiting jobs whose dependencies all succeeded, in plan order. They
    /// are marked dispatched.
    pub fn take_ready(&mut self) -> Vec<PlannedJob> {
        let ready: Vec<PlannedJob> = self
            .jobs
            .iter()
            .filter(|job| {
                matches!(
                    self.state(&job.target_id),
                    Some(JobProcessingState::WaitingForDependencies)
                ) && job
                    .depends_on
                    .iter()
                    .all(|dep| matches!(self.state(dep), Some(JobProcessingState::Succeeded)))
            })
            .cloned()
            .collect();
        for job in &ready {
            self.states
                .insert(job.target_id.clone(), JobProcessingState::Dispatched);
        }
        ready
    }

    pub fn mark_succeeded(&mut self, id: &str) {
        self.states.insert(id.to_string(), JobProcessingState::Succeeded);
    }

    /// Records the failure and returns every job skipped because of it.
    pub fn mark_failed(&mut self, id: &str, err: CellarError) -> Vec<String> {
        self.states
            .insert(id.to_string(), JobProcessingState::Failed(Arc::new(err)));
        let mut skipped = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(failed) = frontier.pop() {
            for job in &self.jobs {
                if !job.depends_on.contains(&failed) {
                    continue;
                }
                if matches!(
                    self.state(&job.target_id),
                    Some(JobProcessingState::WaitingForDependencies)
                ) {
                    self.states.insert(
                        job.target_id.clone(),
                        JobProcessingState::Skipped(id.to_string()),
                    );
                    skipped.push(job.target_id.clone());
                    frontier.push(job.target_id.clone());
                }
            }
        }
        skipped
    }

    /// Skips every job not yet dispatched.
    pub fn cancel_waiting(&mut self) -> Vec<String> {
        let mut skipped = Vec::new();
        for job in &self.jobs {
            if matches!(
                self.state(&job.target_id),
                Some(JobProcessingState::WaitingForDependencies)
            ) {
                skipped.push(job.target_id.clone());
            }
        }
        for id in &skipped {
            self.states.insert(
                id.clone(),
                JobProcessingState::Skipped("cancelled".to_string()),
            );
        }
        skipped
    }

    pub fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, JobProcessingState::Dispatched))
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(JobProcessingState::is_terminal)
    }

    pub fn skipped_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, JobProcessingState::Skipped(_)))
            .count()
    }

    /// First failure in plan order.
    pub fn first_failure(&self) -> Option<Arc<CellarError>> {
        self.jobs.iter().find_map(|job| match self.state(&job.target_id) {
            Some(JobProcessingState::Failed(err)) => Some(Arc::clone(err)),
            _ => None,
        })
    }

    pub fn failures(&self) -> Vec<(String, Arc<CellarError>)> {
        self.jobs
            .iter()
            .filter_map(|job| match self.state(&job.target_id) {
                Some(JobProcessingState::Failed(err)) => {
                    Some((job.target_id.clone(), Arc::clone(err)))
                }
                _ => None,
            })
            .collect()
    }
}

fn dispatch_ready(
    board: &mut JobBoard,
    worker_job_tx: &CrossbeamSender<WorkerJob>,
    event_tx: &broadcast::Sender<PipelineEvent>,
) {
    for job in board.take_ready() {
        let id = job.target_id.clone();
        debug!("RUNNER: Dispatching '{}'", id);
        if worker_job_tx.send(worker_job(job)).is_err() {
            error!("RUNNER: Worker pool is gone; cannot dispatch '{}'", id);
            let err = CellarError::Generic("worker pool stopped".to_string());
            let _ = event_tx.send(PipelineEvent::job_failed(id.clone(), &err));
            for skipped in board.mark_failed(&id, err) {
                let _ = event_tx.send(PipelineEvent::JobSkipped {
                    target_id: skipped,
                    failed_dependency: id.clone(),
                });
            }
        }
    }
}

/// Plans `targets`, then builds the plan on the worker pool. Returns the
/// first job failure (in plan order) so the caller can map it to an exit
/// code.
#[instrument(skip_all, fields(targets = ?targets))]
pub async fn run_pipeline(
    targets: &[String],
    config: &Config,
    cache: Arc<Cache>,
    flags: &PipelineFlags,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let start_time = Instant::now();
    let final_success_count = Arc::new(AtomicUsize::new(0));
    let final_fail_count = Arc::new(AtomicUsize::new(0));

    let (event_tx, _) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
    let status_handle = tokio::spawn(crate::cli::status::handle_events(
        config.clone(),
        event_tx.subscribe(),
    ));

    let formulary = Formulary::new(config);
    let planned = OperationPlanner::new(config, &formulary, flags, event_tx.clone())
        .plan_operations(targets)
        .await;
    let planned = match planned {
        Ok(ops) => ops,
        Err(e) => {
            error!("RUNNER: Fatal planning error: {}", e);
            let _ = event_tx.send(PipelineEvent::LogError {
                message: format!("Fatal planning error: {e}"),
            });
            let _ = event_tx.send(PipelineEvent::PipelineFinished {
                duration_secs: start_time.elapsed().as_secs_f64(),
                success_count: 0,
                fail_count: targets.len(),
            });
            drop(event_tx);
            if let Err(join_err) = status_handle.await {
                error!("RUNNER: Status task join error after planning failure: {}", join_err);
            }
            return Err(e);
        }
    };

    let _ = event_tx.send(PipelineEvent::PlanningFinished {
        job_count: planned.jobs.len(),
    });
    let mut already: Vec<&String> = planned.already_installed.iter().collect();
    already.sort();
    for name in already.into_iter().filter(|n| targets.contains(*n)) {
        let _ = event_tx.send(PipelineEvent::LogInfo {
            message: format!("{} is already installed.", name.cyan()),
        });
    }

    let mut board = JobBoard::new(planned.jobs);
    let total_jobs = board.jobs.len();

    let (worker_job_tx, worker_job_rx) = crossbeam_bounded::<WorkerJob>(WORKER_JOB_CHANNEL_SIZE);
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<JobOutcome>();
    let worker_ctx = WorkerContext {
        config: config.clone(),
        cache: Arc::clone(&cache),
        locks: InstallLocks::new(),
        event_tx: event_tx.clone(),
        cancel: Some(cancel.clone()),
        runtime: tokio::runtime::Handle::current(),
        force: flags.force,
    };
    let core_success_count = Arc::clone(&final_success_count);
    let core_fail_count = Arc::clone(&final_fail_count);
    let core_handle = std::thread::spawn(move || {
        start_worker_pool_manager(
            worker_ctx,
            worker_job_rx,
            outcome_tx,
            core_success_count,
            core_fail_count,
        )
    });

    if total_jobs > 0 {
        let _ = event_tx.send(PipelineEvent::PipelineStarted { total_jobs });
    }
    dispatch_ready(&mut board, &worker_job_tx, &event_tx);

    let mut cancel_seen = false;
    debug!("RUNNER: Entering main loop with {} job(s)", total_jobs);
    while !board.all_terminal() {
        tokio::select! {
            biased;
            Some(outcome) = outcome_rx.recv() => {
                let id = outcome.target_id;
                match outcome.result {
                    Ok(_) => {
                        debug!("RUNNER: '{}' succeeded", id);
                        board.mark_succeeded(&id);
                    }
                    Err(err) => {
                        debug!("RUNNER: '{}' failed: {}", id, err);
                        for skipped in board.mark_failed(&id, err) {
                            let _ = event_tx.send(PipelineEvent::JobSkipped {
                                target_id: skipped,
                                failed_dependency: id.clone(),
                            });
                        }
                    }
                }
                if !cancel_seen {
                    dispatch_ready(&mut board, &worker_job_tx, &event_tx);
                }
            }
            requested = async { cancel.wait_for(|c| *c).await.is_ok() }, if !cancel_seen => {
                cancel_seen = true;
                if requested {
                    warn!("RUNNER: Cancellation requested; waiting for {} running job(s)", board.in_flight());
                    let _ = event_tx.send(PipelineEvent::LogWarn {
                        message: "Interrupted; stopping after running jobs finish".to_string(),
                    });
                    for skipped in board.cancel_waiting() {
                        let _ = event_tx.send(PipelineEvent::JobSkipped {
                            target_id: skipped,
                            failed_dependency: "cancelled".to_string(),
                        });
                    }
                }
            }
            else => {
                warn!("RUNNER: Outcome channel closed with {} job(s) unfinished", board.in_flight());
                break;
            }
        }
    }
    debug!("RUNNER: Main loop finished");

    drop(worker_job_tx);
    match core_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("RUNNER: Core worker pool manager thread failed: {}", e);
            final_fail_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                "RUNNER: Core worker pool manager thread panicked: {:?}",
                get_panic_message(e)
            );
            final_fail_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    let success_total = final_success_count.load(Ordering::Relaxed);
    let fail_total = final_fail_count.load(Ordering::Relaxed) + board.skipped_count();
    if let Err(e) = event_tx.send(PipelineEvent::PipelineFinished {
        duration_secs: start_time.elapsed().as_secs_f64(),
        success_count: success_total,
        fail_count: fail_total,
    }) {
        warn!("RUNNER: Failed to send PipelineFinished event: {:?}", e);
    }
    drop(event_tx);
    if let Err(e) = status_handle.await {
        warn!("RUNNER: Status handler task failed or panicked: {}", e);
    }

    for (id, err) in board.failures() {
        error!("RUNNER: '{}' failed: {}", id, err);
    }
    if let Some(err) = board.first_failure() {
        return Err(Arc::unwrap_or_clone(err));
    }
    if cancel_seen && *cancel.borrow() {
        return Err(CellarError::Cancelled("interrupted before all jobs ran".to_string()));
    }
    if !board.all_terminal() {
        return Err(CellarError::Generic(
            "pipeline stopped before every job finished".to_string(),
        ));
    }
    Ok(())
}
