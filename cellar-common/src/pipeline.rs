// cellar-common/src/pipeline.rs
use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dependency::ResolvedGraph;
use crate::error::{CellarError, InstallStage};
use crate::model::{BuildSelections, DependencyPresence, Formula};

/// One package to build, as decided by the planner.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub target_id: String,
    pub formula: Arc<Formula>,
    pub selections: BuildSelections,
    pub presence: DependencyPresence,
    /// Named on the command line rather than pulled in as a dependency.
    pub is_target: bool,
    /// In-plan dependencies that must succeed first.
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub request: PlannedJob,
    /// Fresh for every dispatch; names the attempt's scratch directory.
    pub attempt_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
    },
    PlanningStarted,
    PlanningFinished {
        job_count: usize,
    },
    JobDispatched {
        target_id: String,
    },
    StageStarted {
        target_id: String,
        stage: InstallStage,
    },
    StepStarted {
        target_id: String,
        step: String,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadFinished {
        target_id: String,
        url: String,
        size_bytes: u64,
    },
    JobSuccess {
        target_id: String,
        version: String,
        verified: bool,
    },
    JobFailed {
        target_id: String,
        stage: Option<InstallStage>,
        error: String,
    },
    /// Not attempted because a dependency failed.
    JobSkipped {
        target_id: String,
        failed_dependency: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
    LogError {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: String, error: &CellarError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            stage: error.failed_stage(),
            error: error.to_string(),
        }
    }
}

/// Processing state of a job inside the runner.
#[derive(Debug, Clone)]
pub enum JobProcessingState {
    WaitingForDependencies,
    Dispatched,
    Succeeded,
    Failed(Arc<CellarError>),
    /// A dependency failed; the job never ran.
    Skipped(String),
}

impl JobProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobProcessingState::Succeeded
                | JobProcessingState::Failed(_)
                | JobProcessingState::Skipped(_)
        )
    }
}

/// Planner output.
#[derive(Debug, Default)]
pub struct PlannedOperations {
    /// Dependencies first.
    pub jobs: Vec<PlannedJob>,
    pub already_installed: HashSet<String>,
    pub resolved_graph: Option<Arc<ResolvedGraph>>,
}
