// cellar-core/src/verify.rs
//! Post-install verification: runs a formula's test procedure against the
//! freshly installed keg inside a throwaway scratch directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cellar_aio::process::CommandOutput;
use cellar_common::config::Config;
use cellar_common::error::{CellarError, InstallStage, Result};
use cellar_common::model::artifact::VerificationStatus;
use cellar_common::model::procedure::Assertion;
use cellar_common::model::{DependencyPresence, Formula};
use cellar_common::pipeline::PipelineEvent;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::build::{BuildEnvironment, Placeholders, ResolvedStep, StepDirs, StepRunner};

pub struct Verifier<'a> {
    config: &'a Config,
    formula: &'a Formula,
    presence: &'a DependencyPresence,
    keg_path: &'a Path,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
    cancel: Option<watch::Receiver<bool>>,
    log_file: Option<PathBuf>,
}

impl<'a> Verifier<'a> {
    pub fn new(
        config: &'a Config,
        formula: &'a Formula,
        presence: &'a DependencyPresence,
        keg_path: &'a Path,
    ) -> Self {
        Self {
            config,
            formula,
            presence,
            keg_path,
            event_tx: None,
            cancel: None,
            log_file: None,
        }
    }

    pub fn with_events(mut self, event_tx: Option<broadcast::Sender<PipelineEvent>>) -> Self {
        self.event_tx = event_tx;
        self
    }

    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    /// Runs the test procedure. `Ok(NotRun)` when the formula declares none;
    /// any failing step or assertion is an `InstallationVerification` error.
    /// The scratch directory is removed whatever the outcome.
    pub async fn run(&self) -> Result<VerificationStatus> {
        let Some(test) = &self.formula.test else {
            debug!("{} declares no test procedure", self.formula.name);
            return Ok(VerificationStatus::NotRun);
        };

        tokio::fs::create_dir_all(self.config.tmp_dir()).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-test-", self.formula.name))
            .tempdir_in(self.config.tmp_dir())?;
        let scratch_path = scratch.path().to_path_buf();

        for fixture in &test.fixtures {
            let path = scratch_path.join(&fixture.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &fixture.contents).await?;
        }

        let mut env = BuildEnvironment::new(self.config, self.presence, &scratch_path)?;
        env.prepend_path(self.keg_path.join("bin"))?;

        let mut presence = self.presence.clone();
        presence.insert(self.formula.name.clone(), self.keg_path);
        let mut placeholders = Placeholders::new(&presence);
        placeholders
            .set_path("prefix", self.keg_path)
            .set_path("scratch", &scratch_path)
            .set("name", self.formula.name.clone())
            .set("version", self.formula.version.clone());
        let dirs = StepDirs {
            source: scratch_path.clone(),
            build: scratch_path.clone(),
            prefix: self.keg_path.to_path_buf(),
            scratch: scratch_path.clone(),
        };

        let mut runner = StepRunner::new(self.formula.name.clone(), env);
        runner.timeout = self.config.build_timeout;
        runner.cancel = self.cancel.clone();
        runner.event_tx = self.event_tx.clone();
        runner.log_file = self.log_file.clone();

        info!("[{}] ==> Testing installation", self.formula.name);
        let mut outputs: HashMap<String, CommandOutput> = HashMap::new();
        for spec in &test.steps {
            let step = ResolvedStep::from_spec(spec, &placeholders, &dirs, &[], InstallStage::Verifying)?;
            let output = match runner.run(&step).await {
                Ok(output) => output,
                Err(CellarError::BuildStepFailure { step, status }) => {
                    return Err(self.failure(format!("test step '{step}': {status}")))
                }
                Err(e) => return Err(e),
            };
            if !output.success() {
                warn!(
                    "[{}] Test step '{}' {}: {}",
                    self.formula.name,
                    step.name,
                    output.status_string(),
                    output.stderr.trim()
                );
                return Err(self.failure(format!(
                    "test step '{}' {}",
                    step.name,
                    output.status_string()
                )));
            }
            outputs.insert(step.name, output);
        }

        for assertion in &test.assertions {
            let Some(output) = outputs.get(assertion.step()) else {
                return Err(self.failure(format!(
                    "assertion refers to step '{}' which did not run",
                    assertion.step()
                )));
            };
            check_assertion(assertion, output)
                .map_err(|msg| self.failure(format!("step '{}': {msg}", assertion.step())))?;
        }

        debug!(
            "[{}] {} test steps and {} assertions passed",
            self.formula.name,
            test.steps.len(),
            test.assertions.len()
        );
        Ok(VerificationStatus::Passed)
    }

    fn failure(&self, message: String) -> CellarError {
        CellarError::InstallationVerification {
            name: self.formula.name.clone(),
            version: self.formula.version_str_full(),
            message,
        }
    }
}

fn check_assertion(assertion: &Assertion, output: &CommandOutput) -> std::result::Result<(), String> {
    match assertion {
        Assertion::Success { .. } => {
            if output.success() {
                Ok(())
            } else {
                Err(output.status_string())
            }
        }
        Assertion::Below { threshold, .. } => check_below(&output.stdout, *threshold),
        Assertion::Equals { expected, .. } => check_equals(&output.stdout, expected),
        Assertion::RoundTrip { tolerance, .. } => check_round_trip(&output.stdout, *tolerance),
    }
}

fn numbers(line: &str) -> impl Iterator<Item = f64> + '_ {
    line.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '=' | '(' | ')' | '[' | ']')))
        .filter_map(|tok| tok.parse::<f64>().ok())
}

fn check_below(stdout: &str, threshold: f64) -> std::result::Result<(), String> {
    let value = stdout
        .lines()
        .flat_map(numbers)
        .last()
        .ok_or_else(|| "no numeric value in output".to_string())?;
    // NaN compares false and fails here.
    if value < threshold {
        Ok(())
    } else {
        Err(format!("{value:e} is not below {threshold:e}"))
    }
}

fn check_equals(stdout: &str, expected: &str) -> std::result::Result<(), String> {
    let actual = stdout.trim();
    if actual == expected.trim() {
        Ok(())
    } else {
        Err(format!("expected {:?}, got {:?}", expected.trim(), actual))
    }
}

fn check_round_trip(stdout: &str, tolerance: f64) -> std::result::Result<(), String> {
    let mut pairs = 0usize;
    let mut worst = 0.0f64;
    for (lineno, line) in stdout.lines().enumerate() {
        let mut nums = numbers(line);
        let (Some(original), Some(reconstructed)) = (nums.next(), nums.next()) else {
            continue;
        };
        pairs += 1;
        let diff = (original - reconstructed).abs();
        if !(diff <= tolerance) {
            return Err(format!(
                "line {}: {original} and {reconstructed} differ by {diff:e} (tolerance {tolerance:e})",
                lineno + 1
            ));
        }
        worst = worst.max(diff);
    }
    if pairs == 0 {
        return Err("no value pairs in output".to_string());
    }
    debug!("Round trip over {pairs} pairs, worst difference {worst:e}");
    Ok(())
}
