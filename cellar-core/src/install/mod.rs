// cellar-core/src/install/mod.rs
//! The per-package state machine: fetch, resolve flags, configure, build,
//! install, verify. Nothing becomes visible under `opt/` until every stage
//! has passed (or verification failed under the `keep` policy).

use std::path::{Path, PathBuf};

use cellar_aio::fs::{list_files_relative, remove_dir_if_exists, replace_symlink};
use cellar_common::cache::Cache;
use cellar_common::config::{Config, VerifyFailurePolicy};
use cellar_common::error::{CellarError, InstallStage, Result};
use cellar_common::keg::{is_complete_keg, KegRegistry};
use cellar_common::model::artifact::{
    InstallReceipt, InstalledArtifact, ReceiptDependency, VerificationStatus, INCOMPLETE_MARKER,
    RECEIPT_FILENAME,
};
use cellar_common::model::{BuildSelections, DependencyPresence, Formula};
use cellar_common::pipeline::{PipelineEvent, WorkerJob};
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use crate::build::{resolve_flags, BuildEnvironment, BuildExecutor, StepRunner};
use crate::fetch::{stage_sources, Fetcher};
use crate::verify::Verifier;

pub mod lock;

pub use lock::{InstallGuard, InstallLocks};

/// Shared state a worker needs to run one install.
pub struct InstallContext<'a> {
    pub config: &'a Config,
    pub cache: &'a Cache,
    pub locks: &'a InstallLocks,
    pub event_tx: Option<broadcast::Sender<PipelineEvent>>,
    pub cancel: Option<watch::Receiver<bool>>,
    /// Rebuild even when a complete keg for the same version exists.
    pub force: bool,
}

impl InstallContext<'_> {
    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn stage(&self, target_id: &str, stage: InstallStage) {
        debug!("[{}] Stage: {}", target_id, stage);
        self.emit(PipelineEvent::StageStarted {
            target_id: target_id.to_string(),
            stage,
        });
    }
}

/// Directory name of the keg a build with `selections` produces.
pub fn keg_version(formula: &Formula, selections: &BuildSelections) -> String {
    if selections.head && formula.head.is_some() {
        "HEAD".to_string()
    } else {
        formula.version_str_full()
    }
}

/// Runs one job to completion. On failure the keg is removed (and a keg
/// displaced by `--force` restored), so no partial install is discoverable.
#[instrument(skip_all, fields(target = %job.request.target_id, attempt = %job.attempt_id))]
pub async fn install_formula(job: &WorkerJob, ctx: &InstallContext<'_>) -> Result<InstalledArtifact> {
    let formula = job.request.formula.as_ref();
    let name = formula.name.as_str();
    let version = keg_version(formula, &job.request.selections);
    let _guard = ctx.locks.acquire(ctx.config, name, &version).await?;

    let keg_path = ctx.config.formula_keg_path(name, &version);
    let opt_path = ctx.config.formula_opt_path(name);

    if !ctx.force && !job.request.selections.head && is_complete_keg(&keg_path) {
        let receipt = InstallReceipt::read(&keg_path)?;
        if same_variants(&receipt, &job.request.selections) {
            info!("{} {} is already installed", name, version);
            return Ok(InstalledArtifact {
                name: name.to_string(),
                version,
                keg_path,
                opt_path,
                receipt,
            });
        }
        info!("{} {} was built with other variants; rebuilding", name, version);
    }
    let displaced = clear_keg_slot(&keg_path, &job.attempt_id)?;

    let attempt_dir = ctx.config.attempt_dir(name, &version, &job.attempt_id);
    let mut attempt = Attempt {
        ctx,
        job,
        formula,
        version,
        keg_path,
        opt_path,
        attempt_dir,
        published: false,
    };
    let result = attempt.run().await;
    attempt.finish(&result, displaced);
    result
}

fn same_variants(receipt: &InstallReceipt, selections: &BuildSelections) -> bool {
    receipt.with.iter().eq(selections.with.iter()) && receipt.without.iter().eq(selections.without.iter())
}

/// Makes room for a new keg at `keg_path`. A leftover incomplete keg is
/// deleted; a complete one is renamed aside and its new path returned.
fn clear_keg_slot(keg_path: &Path, attempt_id: &str) -> Result<Option<PathBuf>> {
    if !keg_path.exists() {
        return Ok(None);
    }
    if !is_complete_keg(keg_path) {
        warn!("Removing incomplete keg left at {}", keg_path.display());
        remove_dir_if_exists(keg_path)?;
        return Ok(None);
    }
    let version = keg_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let aside = keg_path.with_file_name(format!(".{version}.displaced-{attempt_id}"));
    debug!("Setting {} aside at {}", keg_path.display(), aside.display());
    std::fs::rename(keg_path, &aside)?;
    Ok(Some(aside))
}

struct Attempt<'a, 'c> {
    ctx: &'a InstallContext<'c>,
    job: &'a WorkerJob,
    formula: &'a Formula,
    version: String,
    keg_path: PathBuf,
    opt_path: PathBuf,
    attempt_dir: PathBuf,
    /// Marker removed and opt link switched.
    published: bool,
}

impl Attempt<'_, '_> {
    fn target_id(&self) -> &str {
        &self.job.request.target_id
    }

    fn name(&self) -> &str {
        &self.formula.name
    }

    async fn run(&mut self) -> Result<InstalledArtifact> {
        let ctx = self.ctx;
        let job: &WorkerJob = self.job;
        let formula: &Formula = self.formula;
        let request = &job.request;
        let name = formula.name.clone();
        let target_id = self.target_id().to_string();

        ctx.stage(&target_id, InstallStage::Fetching);
        let mut fetcher = Fetcher::new(ctx.config, ctx.cache, target_id.clone()).with_cancel(ctx.cancel.clone());
        if let Some(tx) = &ctx.event_tx {
            fetcher = fetcher.with_events(tx.clone());
        }
        let staged = async {
            let fetched = fetcher.fetch_all(formula, &request.selections).await?;
            stage_sources(&fetched, &self.attempt_dir).await
        }
        .await
        .map_err(|e| e.in_stage(&name, InstallStage::Fetching))?;
        if !staged.is_reproducible() {
            warn!("[{}] Building from a VCS head; the result is not reproducible", target_id);
        }

        ctx.stage(&target_id, InstallStage::Resolving);
        let flags = resolve_flags(formula, &request.selections, &request.presence)
            .map_err(|e| e.in_stage(&name, InstallStage::Resolving))?;
        debug!("[{}] Flags: {}", target_id, flags.to_cmake_args().join(" "));

        let home = self.attempt_dir.join("home");
        let prepare = async {
            tokio::fs::create_dir_all(&self.keg_path).await?;
            tokio::fs::write(self.keg_path.join(INCOMPLETE_MARKER), &job.attempt_id).await?;
            tokio::fs::create_dir_all(&home).await?;
            tokio::fs::create_dir_all(ctx.config.logs_dir()).await?;
            BuildEnvironment::new(ctx.config, &request.presence, &home)
        };
        let env = prepare
            .await
            .map_err(|e| e.in_stage(&name, InstallStage::Configuring))?;
        let log_file = self.log_file();
        let mut runner = StepRunner::new(target_id.clone(), env);
        runner.timeout = ctx.config.build_timeout;
        runner.cancel = ctx.cancel.clone();
        runner.log_file = Some(log_file.clone());
        runner.event_tx = ctx.event_tx.clone();

        let executor = BuildExecutor {
            formula,
            selections: &request.selections,
            presence: &request.presence,
            flags: &flags,
            source_dir: staged.root.clone(),
            build_dir: self.attempt_dir.join("build"),
            prefix: self.keg_path.clone(),
            scratch_dir: home.clone(),
            make_jobs: ctx.config.make_jobs,
        };
        let mut reached = InstallStage::Configuring;
        let report = executor
            .run(&runner, |stage| {
                reached = stage;
                ctx.stage(&target_id, stage);
            })
            .await?;
        debug!("[{}] Ran {} build steps", target_id, report.steps_run.len());

        if reached < InstallStage::Installing {
            ctx.stage(&target_id, InstallStage::Installing);
        }
        let mut receipt = (|| -> Result<InstallReceipt> {
            let files = list_files_relative(&self.keg_path)?
                .into_iter()
                .filter(|p| p != Path::new(INCOMPLETE_MARKER) && p != Path::new(RECEIPT_FILENAME))
                .collect::<Vec<_>>();
            if files.is_empty() {
                return Err(CellarError::Generic(format!(
                    "install steps put nothing into {}",
                    self.keg_path.display()
                )));
            }
            let receipt = InstallReceipt {
                name: name.clone(),
                version: self.version.clone(),
                installed_at: Utc::now(),
                source: staged.provenance.clone(),
                flags_fingerprint: flags.fingerprint(),
                flags: flags.clone(),
                with: request.selections.with.iter().cloned().collect(),
                without: request.selections.without.iter().cloned().collect(),
                dependencies: request
                    .presence
                    .iter()
                    .map(|(dep, path)| ReceiptDependency {
                        name: dep.clone(),
                        path: path.clone(),
                    })
                    .collect(),
                bindings_installed: report.bindings_installed,
                verification: VerificationStatus::NotRun,
                files,
            };
            receipt.write(&self.keg_path)?;
            Ok(receipt)
        })()
        .map_err(|e| e.in_stage(&name, InstallStage::Installing))?;

        ctx.stage(&target_id, InstallStage::Verifying);
        let verified = Verifier::new(ctx.config, formula, &request.presence, &self.keg_path)
            .with_events(ctx.event_tx.clone())
            .with_cancel(ctx.cancel.clone())
            .with_log_file(Some(log_file))
            .run()
            .await;
        match verified {
            Ok(status) => {
                receipt.verification = status;
                receipt
                    .write(&self.keg_path)
                    .and_then(|_| self.publish())
                    .map_err(|e| e.in_stage(&name, InstallStage::Installing))?;
            }
            Err(e @ CellarError::InstallationVerification { .. })
                if ctx.config.verify_failure_policy == VerifyFailurePolicy::Keep =>
            {
                warn!("[{}] {}; keeping the keg flagged as unverified", target_id, e);
                receipt.verification = VerificationStatus::Failed {
                    message: e.to_string(),
                };
                receipt
                    .write(&self.keg_path)
                    .and_then(|_| self.publish())
                    .map_err(|e| e.in_stage(&name, InstallStage::Installing))?;
                return Err(e.in_stage(&name, InstallStage::Verifying));
            }
            Err(e) => return Err(e.in_stage(&name, InstallStage::Verifying)),
        }

        ctx.stage(&target_id, InstallStage::Installed);
        info!("[{}] Installed {} {}", target_id, name, self.version);
        Ok(InstalledArtifact {
            name,
            version: self.version.clone(),
            keg_path: self.keg_path.clone(),
            opt_path: self.opt_path.clone(),
            receipt,
        })
    }

    fn log_file(&self) -> PathBuf {
        self.ctx
            .config
            .logs_dir()
            .join(format!("{}-{}-{}.log", self.name(), self.version, self.job.attempt_id))
    }

    /// Completes the keg and points `opt/<name>` at it.
    fn publish(&mut self) -> Result<()> {
        std::fs::remove_file(self.keg_path.join(INCOMPLETE_MARKER))?;
        self.published = true;
        replace_symlink(&self.keg_path, &self.opt_path)
    }

    fn finish(&self, result: &Result<InstalledArtifact>, displaced: Option<PathBuf>) {
        let cancelled = matches!(result.as_ref().map_err(|e| e.root()), Err(CellarError::Cancelled(_)));
        if result.is_err() && !self.published {
            if let Err(e) = remove_dir_if_exists(&self.keg_path) {
                warn!("[{}] Could not remove failed keg {}: {}", self.target_id(), self.keg_path.display(), e);
            }
            if let Some(aside) = &displaced {
                if let Err(e) = std::fs::rename(aside, &self.keg_path) {
                    warn!("[{}] Could not restore {}: {}", self.target_id(), aside.display(), e);
                }
            }
            if let Some(parent) = self.keg_path.parent() {
                // Only succeeds when empty.
                let _ = std::fs::remove_dir(parent);
            }
        } else if let Some(aside) = &displaced {
            if let Err(e) = remove_dir_if_exists(aside) {
                warn!("[{}] Could not remove replaced keg {}: {}", self.target_id(), aside.display(), e);
            }
        }

        if result.is_err() && self.ctx.config.keep_failed_builds && !cancelled {
            warn!(
                "[{}] Keeping failed build directory {}",
                self.target_id(),
                self.attempt_dir.display()
            );
        } else if let Err(e) = remove_dir_if_exists(&self.attempt_dir) {
            warn!("[{}] Could not remove {}: {}", self.target_id(), self.attempt_dir.display(), e);
        }
    }
}

/// Runs the test procedure against the newest installed keg of `formula`
/// and records the outcome in its receipt.
pub async fn verify_installed(
    config: &Config,
    formula: &Formula,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<VerificationStatus> {
    let registry = KegRegistry::new(config.clone());
    let keg = registry
        .get_installed_keg(&formula.name)?
        .ok_or_else(|| CellarError::NotFound(format!("{} is not installed", formula.name)))?;
    let mut receipt = keg.receipt()?;
    let mut presence = DependencyPresence::new();
    for dep in &receipt.dependencies {
        presence.insert(dep.name.clone(), dep.path.clone());
    }

    let result = Verifier::new(config, formula, &presence, &keg.path)
        .with_cancel(cancel)
        .run()
        .await;
    match result {
        Ok(status) => {
            receipt.verification = status.clone();
            receipt.write(&keg.path)?;
            Ok(status)
        }
        Err(e @ CellarError::InstallationVerification { .. }) => {
            receipt.verification = VerificationStatus::Failed {
                message: e.to_string(),
            };
            receipt.write(&keg.path)?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;

    use cellar_common::error::FetchErrorKind;
    use cellar_common::pipeline::PlannedJob;

    use super::*;
    use crate::test_support::{file_url, sha256_hex, test_config, toy_formula, write_tar_gz};

    fn job(formula: Formula) -> WorkerJob {
        WorkerJob {
            request: PlannedJob {
                target_id: formula.name.clone(),
                formula: Arc::new(formula),
                selections: BuildSelections::default(),
                presence: DependencyPresence::new(),
                is_target: true,
                depends_on: vec![],
            },
            attempt_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn context<'a>(config: &'a Config, cache: &'a Cache, locks: &'a InstallLocks) -> InstallContext<'a> {
        InstallContext {
            config,
            cache,
            locks,
            event_tx: None,
            cancel: None,
            force: false,
        }
    }

    fn toy_tarball(dir: &Path) -> PathBuf {
        let tarball = dir.join("mirror/toy-1.0.tar.gz");
        write_tar_gz(&tarball, "toy-1.0", &[("build.sh", "#!/bin/sh\necho toy\n")]);
        tarball
    }

    #[tokio::test]
    async fn successful_install_publishes_keg() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let formula = toy_formula("toy", &toy_tarball(dir.path()), "");

        let artifact = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap();
        assert_eq!(artifact.keg_path, config.formula_keg_path("toy", "1.0"));
        assert!(is_complete_keg(&artifact.keg_path));
        assert_eq!(
            std::fs::read_link(config.formula_opt_path("toy")).unwrap(),
            artifact.keg_path
        );
        let receipt = InstallReceipt::read(&artifact.keg_path).unwrap();
        assert!(receipt.source.reproducible);
        assert_eq!(receipt.verification, VerificationStatus::NotRun);
        assert!(receipt.files.contains(&PathBuf::from("bin/toy")));
        assert!(!receipt.files.contains(&PathBuf::from(INCOMPLETE_MARKER)));
        // Attempt scratch space is gone.
        let leftovers: Vec<_> = std::fs::read_dir(config.tmp_dir())
            .map(|rd| rd.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failed_build_leaves_no_keg() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let formula = toy_formula(
            "toy",
            &toy_tarball(dir.path()),
            "[[install.steps]]\nname = \"explode\"\nprogram = \"sh\"\nargs = [\"-c\", \"exit 2\"]\n",
        );

        let err = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert_eq!(err.failed_stage(), Some(InstallStage::Building));
        assert!(!config.formula_keg_path("toy", "1.0").exists());
        assert!(!config.formula_opt_path("toy").exists());
        let registry = KegRegistry::new(config.clone());
        assert!(registry.get_installed_keg("toy").unwrap().is_none());
    }

    #[tokio::test]
    async fn checksum_mismatch_stops_before_any_step() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let tarball = toy_tarball(dir.path());
        let marker = dir.path().join("step-ran");
        let formula = toy_formula(
            "toy",
            &tarball,
            &format!(
                "[[install.steps]]\nname = \"mark\"\nprogram = \"touch\"\nargs = [\"{}\"]\n",
                marker.display()
            ),
        );
        // Same name, different bytes.
        write_tar_gz(&tarball, "toy-1.0", &[("build.sh", "#!/bin/sh\necho tampered\n")]);

        let err = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.failed_stage(), Some(InstallStage::Fetching));
        assert!(matches!(
            err.root(),
            CellarError::Fetch {
                kind: FetchErrorKind::ChecksumMismatch,
                ..
            }
        ));
        assert!(!marker.exists());
        assert!(!config.formula_keg_path("toy", "1.0").exists());
    }

    /// Puts `sh` stand-ins for cmake and make first on the build PATH. The
    /// cmake component install of `dev` fails.
    fn fake_cmake_tools(root: &Path, config: &mut Config) {
        let bin = root.join("tools");
        std::fs::create_dir_all(&bin).unwrap();
        let cmake = "#!/bin/sh\ncase \"$1\" in\n  -DCOMPONENT=dev) echo 'dev component broken' >&2; exit 4 ;;\nesac\nexit 0\n";
        for (tool, script) in [("cmake", cmake), ("make", "#!/bin/sh\nexit 0\n")] {
            let path = bin.join(tool);
            std::fs::write(&path, script).unwrap();
            cellar_aio::fs::set_permissions(&path, 0o755).unwrap();
        }
        config.base_path.insert(0, bin);
    }

    #[tokio::test]
    async fn failed_component_install_reports_installing_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        fake_cmake_tools(dir.path(), &mut config);
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let tarball = toy_tarball(dir.path());
        let raw = format!(
            "name = \"toy\"\nversion = \"1.0\"\n\n[source]\nurl = \"{}\"\nsha256 = \"{}\"\n\n[install]\nsystem = \"cmake\"\ncomponents = [\"lib\", \"dev\"]\n",
            file_url(&tarball),
            sha256_hex(&tarball),
        );
        let formula = Formula::from_toml_str(&raw).unwrap();

        let (tx, mut rx) = broadcast::channel(1024);
        let mut ctx = context(&config, &cache, &locks);
        ctx.event_tx = Some(tx);
        let err = install_formula(&job(formula), &ctx).await.unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert_eq!(err.failed_stage(), Some(InstallStage::Installing));
        assert!(matches!(
            err.root(),
            CellarError::BuildStepFailure { step, .. } if step == "install-dev"
        ));
        assert!(!config.formula_keg_path("toy", "1.0").exists());

        let mut stages = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(PipelineEvent::StageStarted { stage, .. }) => stages.push(stage),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        let build_stages: Vec<_> = stages
            .into_iter()
            .filter(|s| *s >= InstallStage::Configuring)
            .collect();
        assert_eq!(
            build_stages,
            vec![
                InstallStage::Configuring,
                InstallStage::Building,
                InstallStage::Installing
            ]
        );
    }

    #[tokio::test]
    async fn existing_keg_is_not_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let formula = toy_formula("toy", &toy_tarball(dir.path()), "");
        let first = install_formula(&job(formula.clone()), &context(&config, &cache, &locks))
            .await
            .unwrap();
        std::fs::write(first.keg_path.join("BUILT"), "original\n").unwrap();

        let second = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap();
        assert_eq!(second.keg_path, first.keg_path);
        assert_eq!(
            std::fs::read_to_string(second.keg_path.join("BUILT")).unwrap(),
            "original\n"
        );
    }

    #[tokio::test]
    async fn failed_forced_rebuild_restores_previous_keg() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let tarball = toy_tarball(dir.path());
        let good = toy_formula("toy", &tarball, "");
        let first = install_formula(&job(good), &context(&config, &cache, &locks))
            .await
            .unwrap();

        let broken = toy_formula(
            "toy",
            &tarball,
            "[[install.steps]]\nname = \"explode\"\nprogram = \"sh\"\nargs = [\"-c\", \"exit 1\"]\n",
        );
        let mut ctx = context(&config, &cache, &locks);
        ctx.force = true;
        install_formula(&job(broken), &ctx).await.unwrap_err();
        assert!(is_complete_keg(&first.keg_path));
        let hidden: Vec<_> = std::fs::read_dir(config.formula_cellar_dir("toy"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty());
    }

    const ROUND_TRIP_TEST: &str = r#"
[[install.steps]]
name = "install-roundtrip"
program = "sh"
args = ["-c", "cp roundtrip.sh {prefix}/bin/roundtrip && chmod 755 {prefix}/bin/roundtrip"]
dir = "source"

[[test.fixtures]]
path = "samples.txt"
contents = "0.0\n0.25\n1.5\n-3.125\n1e-3\n"

[[test.steps]]
name = "transform"
program = "roundtrip"
args = ["samples.txt"]
dir = "scratch"

[[test.assertions]]
kind = "round_trip"
step = "transform"
tolerance = 1e-8
"#;

    /// Forward transform `2x + 1`, then back; `drift` is added on the way back.
    fn round_trip_script(drift: &str) -> String {
        format!(
            "#!/bin/sh\nawk '{{ f = $1 * 2 + 1; b = (f - 1) / 2 + {drift}; printf \"%.17g %.17g\\n\", $1, b }}' \"$1\"\n"
        )
    }

    #[tokio::test]
    async fn corrupted_installed_transform_fails_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let tarball = dir.path().join("mirror/toy-1.0.tar.gz");
        write_tar_gz(
            &tarball,
            "toy-1.0",
            &[
                ("build.sh", "#!/bin/sh\necho toy\n"),
                ("roundtrip.sh", &round_trip_script("0")),
            ],
        );
        let formula = toy_formula("toy", &tarball, ROUND_TRIP_TEST);

        let artifact = install_formula(&job(formula.clone()), &context(&config, &cache, &locks))
            .await
            .unwrap();
        let receipt = InstallReceipt::read(&artifact.keg_path).unwrap();
        assert_eq!(receipt.verification, VerificationStatus::Passed);

        // Damage the installed program, not the fixture.
        std::fs::write(artifact.keg_path.join("bin/roundtrip"), round_trip_script("0.001")).unwrap();
        let err = verify_installed(&config, &formula, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert!(matches!(err, CellarError::InstallationVerification { .. }));
        let receipt = InstallReceipt::read(&artifact.keg_path).unwrap();
        assert!(matches!(receipt.verification, VerificationStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn corrupted_build_output_fails_install_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.verify_failure_policy = VerifyFailurePolicy::Rollback;
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let tarball = dir.path().join("mirror/toy-1.0.tar.gz");
        write_tar_gz(
            &tarball,
            "toy-1.0",
            &[
                ("build.sh", "#!/bin/sh\necho toy\n"),
                ("roundtrip.sh", &round_trip_script("1e-6")),
            ],
        );
        let formula = toy_formula("toy", &tarball, ROUND_TRIP_TEST);

        let err = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert_eq!(err.failed_stage(), Some(InstallStage::Verifying));
        assert!(matches!(err.root(), CellarError::InstallationVerification { .. }));
        assert!(!config.formula_keg_path("toy", "1.0").exists());
    }

    #[tokio::test]
    async fn verification_failure_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.verify_failure_policy = VerifyFailurePolicy::Rollback;
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let formula = toy_formula(
            "toy",
            &toy_tarball(dir.path()),
            "[[test.steps]]\nname = \"run\"\nprogram = \"toy\"\n\n[[test.assertions]]\nkind = \"equals\"\nstep = \"run\"\nexpected = \"not toy\"\n",
        );
        let err = install_formula(&job(formula), &context(&config, &cache, &locks))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
        assert_eq!(err.failed_stage(), Some(InstallStage::Verifying));
        assert!(!config.formula_keg_path("toy", "1.0").exists());
    }

    #[tokio::test]
    async fn verification_failure_kept_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.verify_failure_policy = VerifyFailurePolicy::Keep;
        let cache = Cache::new(&config).unwrap();
        let locks = InstallLocks::new();
        let formula = toy_formula(
            "toy",
            &toy_tarball(dir.path()),
            "[[test.steps]]\nname = \"run\"\nprogram = \"toy\"\n\n[[test.assertions]]\nkind = \"equals\"\nstep = \"run\"\nexpected = \"not toy\"\n",
        );
        let err = install_formula(&job(formula.clone()), &context(&config, &cache, &locks))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 6);
        let keg = config.formula_keg_path("toy", "1.0");
        assert!(is_complete_keg(&keg));
        let receipt = InstallReceipt::read(&keg).unwrap();
        assert!(matches!(receipt.verification, VerificationStatus::Failed { .. }));

        // A later `cellar test` run re-checks and records the outcome.
        let again = verify_installed(&config, &formula, None).await.unwrap_err();
        assert_eq!(again.exit_code(), 6);
    }
}
