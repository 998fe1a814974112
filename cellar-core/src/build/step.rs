// cellar-core/src/build/step.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cellar_aio::process::{run_command_async, CommandOutput, CommandSpec};
use cellar_common::error::{CellarError, InstallStage, Result};
use cellar_common::model::procedure::{StepDir, StepSpec};
use cellar_common::pipeline::PipelineEvent;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

use super::env::BuildEnvironment;
use super::flags::Placeholders;

const OUTPUT_TAIL_LINES: usize = 30;

/// Directories a step's `dir` can name.
#[derive(Debug, Clone)]
pub struct StepDirs {
    pub source: PathBuf,
    pub build: PathBuf,
    pub prefix: PathBuf,
    pub scratch: PathBuf,
}

impl StepDirs {
    pub fn get(&self, dir: StepDir) -> &Path {
        match dir {
            StepDir::Source => &self.source,
            StepDir::Build => &self.build,
            StepDir::Prefix => &self.prefix,
            StepDir::Scratch => &self.scratch,
        }
    }
}

/// A step with every placeholder expanded, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    /// Stage a failure of this step is reported in.
    pub stage: InstallStage,
}

impl ResolvedStep {
    pub fn new(name: impl Into<String>, program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            env: BTreeMap::new(),
            stdin: None,
            stage: InstallStage::Building,
        }
    }

    pub fn in_stage(mut self, stage: InstallStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Expands a formula step. An argument that is exactly `{flags}` is
    /// replaced by the rendered flag arguments, one argument each. The
    /// step's declared stage wins over `default_stage`.
    pub fn from_spec(
        spec: &StepSpec,
        placeholders: &Placeholders<'_>,
        dirs: &StepDirs,
        flag_args: &[String],
        default_stage: InstallStage,
    ) -> Result<Self> {
        let mut args = Vec::with_capacity(spec.args.len());
        for arg in &spec.args {
            if arg == "{flags}" {
                args.extend(flag_args.iter().cloned());
            } else {
                args.push(placeholders.expand(arg)?);
            }
        }
        let mut env = BTreeMap::new();
        for (k, v) in &spec.env {
            env.insert(k.clone(), placeholders.expand(v)?);
        }
        let stdin = spec
            .stdin
            .as_deref()
            .map(|s| placeholders.expand(s))
            .transpose()?;
        Ok(Self {
            name: spec.name.clone(),
            program: placeholders.expand(&spec.program)?,
            args,
            cwd: dirs.get(spec.dir).to_path_buf(),
            env,
            stdin,
            stage: spec.stage.unwrap_or(default_stage),
        })
    }
}

/// Runs resolved steps inside a [`BuildEnvironment`], with the configured
/// timeout, cancellation and progress events.
pub struct StepRunner {
    pub env: BuildEnvironment,
    pub timeout: Option<Duration>,
    pub cancel: Option<watch::Receiver<bool>>,
    pub log_file: Option<PathBuf>,
    pub target_id: String,
    pub event_tx: Option<broadcast::Sender<PipelineEvent>>,
}

impl StepRunner {
    pub fn new(target_id: impl Into<String>, env: BuildEnvironment) -> Self {
        Self {
            env,
            timeout: None,
            cancel: None,
            log_file: None,
            target_id: target_id.into(),
            event_tx: None,
        }
    }

    /// Runs `step` and returns its output whatever the exit status.
    /// Only a missing program, an IO failure or cancellation is an error.
    pub async fn run(&self, step: &ResolvedStep) -> Result<CommandOutput> {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(PipelineEvent::StepStarted {
                target_id: self.target_id.clone(),
                step: step.name.clone(),
            });
        }
        let program = self
            .env
            .find_program(&step.program, &step.cwd)
            .map_err(|e| CellarError::BuildStepFailure {
                step: step.name.clone(),
                status: e.to_string(),
            })?;
        debug!("[{}] ==> {} {}", self.target_id, program.display(), step.args.join(" "));
        let spec = CommandSpec {
            program: program.to_string_lossy().into_owned(),
            args: step.args.clone(),
            cwd: Some(step.cwd.clone()),
            env: self.env.with_overrides(&step.env),
            stdin: step.stdin.clone(),
            log_file: self.log_file.clone(),
        };
        run_command_async(&spec, self.timeout, self.cancel.clone()).await
    }

    /// Runs `step`; a non-zero exit or a timeout is a `BuildStepFailure`.
    pub async fn run_checked(&self, step: &ResolvedStep) -> Result<CommandOutput> {
        let output = self.run(step).await?;
        if output.success() {
            return Ok(output);
        }
        error!(
            "[{}] Step '{}' failed ({}). Last output:\n{}",
            self.target_id,
            step.name,
            output.status_string(),
            tail(&output.stderr, &output.stdout)
        );
        Err(CellarError::BuildStepFailure {
            step: step.name.clone(),
            status: output.status_string(),
        })
    }
}

fn tail(stderr: &str, stdout: &str) -> String {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}
