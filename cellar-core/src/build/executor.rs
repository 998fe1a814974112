// cellar-core/src/build/executor.rs
//! Turns a formula's install procedure into concrete configure/build/install
//! commands and runs them.

use std::path::{Path, PathBuf};

use cellar_common::error::{InstallStage, Result};
use cellar_common::model::procedure::{BindingsSpec, BuildSystem};
use cellar_common::model::{BuildFlagSet, BuildSelections, DependencyPresence, Formula};
use tracing::{debug, info};

use super::flags::Placeholders;
use super::step::{ResolvedStep, StepDirs, StepRunner};

const CMAKE_STD_ARGS: &[&str] = &[
    "-DCMAKE_BUILD_TYPE=Release",
    "-DCMAKE_FIND_FRAMEWORK=LAST",
    "-DCMAKE_VERBOSE_MAKEFILE=ON",
    "-Wno-dev",
];

/// What a finished build did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub steps_run: Vec<String>,
    pub bindings_installed: bool,
}

/// Inputs for one build attempt. `prefix` is the keg being populated.
pub struct BuildExecutor<'a> {
    pub formula: &'a Formula,
    pub selections: &'a BuildSelections,
    pub presence: &'a DependencyPresence,
    pub flags: &'a BuildFlagSet,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub prefix: PathBuf,
    pub scratch_dir: PathBuf,
    pub make_jobs: usize,
}

impl<'a> BuildExecutor<'a> {
    fn dirs(&self) -> StepDirs {
        StepDirs {
            source: self.source_dir.clone(),
            build: self.work_dir().to_path_buf(),
            prefix: self.prefix.clone(),
            scratch: self.scratch_dir.clone(),
        }
    }

    /// Where configure and make run.
    fn work_dir(&self) -> &Path {
        if self.formula.install.out_of_source {
            &self.build_dir
        } else {
            &self.source_dir
        }
    }

    fn placeholders(&self) -> Placeholders<'a> {
        let mut ph = Placeholders::new(self.presence);
        ph.set_path("prefix", &self.prefix)
            .set_path("source", &self.source_dir)
            .set_path("build", self.work_dir())
            .set_path("scratch", &self.scratch_dir)
            .set("jobs", self.make_jobs.to_string())
            .set("flags", self.flag_args().join(" "))
            .set("version", self.formula.version.clone())
            .set("name", self.formula.name.clone());
        ph
    }

    /// Flags rendered for the build system: `-DKEY=VALUE` for cmake,
    /// `KEY=VALUE` assignments otherwise.
    fn flag_args(&self) -> Vec<String> {
        match self.formula.install.system {
            BuildSystem::Cmake => self.flags.to_cmake_args(),
            _ => self
                .flags
                .iter()
                .map(|f| format!("{}={}", f.key, f.value))
                .collect(),
        }
    }

    /// The primary configure/build/install sequence, fully expanded.
    pub fn plan_steps(&self) -> Result<Vec<ResolvedStep>> {
        let install = &self.formula.install;
        let work = self.work_dir();
        let prefix = self.prefix.display().to_string();
        let jobs = format!("-j{}", self.make_jobs);
        let mut steps = Vec::new();

        match install.system {
            BuildSystem::Cmake => {
                steps.push(
                    ResolvedStep::new("configure", "cmake", work)
                        .in_stage(InstallStage::Configuring)
                        .arg(self.source_dir.display().to_string())
                        .arg(format!("-DCMAKE_INSTALL_PREFIX={prefix}"))
                        .args(CMAKE_STD_ARGS.iter().copied())
                        .args(self.flag_args())
                        .args(install.extra_args.iter().cloned()),
                );
                steps.push(ResolvedStep::new("build", "make", work).arg(jobs));
                if install.components.is_empty() {
                    steps.push(
                        ResolvedStep::new("install", "make", work)
                            .in_stage(InstallStage::Installing)
                            .arg("install"),
                    );
                } else {
                    for component in &install.components {
                        steps.push(
                            ResolvedStep::new(format!("install-{component}"), "cmake", work)
                                .in_stage(InstallStage::Installing)
                                .arg(format!("-DCOMPONENT={component}"))
                                .arg("-P")
                                .arg("cmake_install.cmake"),
                        );
                    }
                }
            }
            BuildSystem::Autotools => {
                let configure = if install.out_of_source {
                    self.source_dir.join("configure").display().to_string()
                } else {
                    "./configure".to_string()
                };
                steps.push(
                    ResolvedStep::new("configure", configure, work)
                        .in_stage(InstallStage::Configuring)
                        .arg(format!("--prefix={prefix}"))
                        .args(["--disable-dependency-tracking", "--disable-silent-rules"])
                        .args(self.flag_args())
                        .args(install.extra_args.iter().cloned()),
                );
                steps.push(ResolvedStep::new("build", "make", work).arg(jobs));
                steps.push(
                    ResolvedStep::new("install", "make", work)
                        .in_stage(InstallStage::Installing)
                        .arg("install"),
                );
            }
            BuildSystem::Make => {
                steps.push(
                    ResolvedStep::new("build", "make", &self.source_dir)
                        .arg(jobs)
                        .arg(format!("PREFIX={prefix}"))
                        .args(self.flag_args())
                        .args(install.extra_args.iter().cloned()),
                );
                steps.push(
                    ResolvedStep::new("install", "make", &self.source_dir)
                        .in_stage(InstallStage::Installing)
                        .arg("install")
                        .arg(format!("PREFIX={prefix}")),
                );
            }
            BuildSystem::Custom => {}
        }

        // Custom procedures build by default; steps after a standard
        // sequence extend the install.
        let default_stage = match install.system {
            BuildSystem::Custom => InstallStage::Building,
            _ => InstallStage::Installing,
        };
        let placeholders = self.placeholders();
        let dirs = self.dirs();
        let flag_args = self.flag_args();
        for spec in &install.steps {
            steps.push(ResolvedStep::from_spec(
                spec,
                &placeholders,
                &dirs,
                &flag_args,
                default_stage,
            )?);
        }
        Ok(steps)
    }

    /// The bindings phase, when declared and its condition holds.
    pub fn plan_bindings(&self) -> Result<Option<(&'a str, Vec<ResolvedStep>)>> {
        let formula: &'a Formula = self.formula;
        let Some(bindings) = &formula.install.bindings else {
            return Ok(None);
        };
        if !self.bindings_wanted(bindings) {
            debug!("Skipping {} bindings for {}", bindings.name, self.formula.name);
            return Ok(None);
        }
        let placeholders = self.placeholders();
        let dirs = self.dirs();
        let flag_args = self.flag_args();
        let steps = bindings
            .steps
            .iter()
            .map(|s| ResolvedStep::from_spec(s, &placeholders, &dirs, &flag_args, InstallStage::Installing))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((bindings.name.as_str(), steps)))
    }

    fn bindings_wanted(&self, bindings: &BindingsSpec) -> bool {
        let dep_ok = bindings
            .when_dependency
            .as_deref()
            .map_or(true, |d| self.presence.is_present(d));
        let opt_ok = bindings.when_option.as_deref().map_or(true, |o| {
            if self.formula.option(o).is_some() {
                self.selections.is_enabled(o)
            } else {
                self.presence.is_present(o)
            }
        });
        dep_ok && opt_ok
    }

    /// Runs the primary steps, then the bindings phase. Stops at the first
    /// failing step. `on_stage` hears each stage once, as the first step of
    /// that stage starts; stages never go backwards, so a step declared for
    /// an earlier stage runs under the current one. A failure is tagged with
    /// the current stage.
    pub async fn run(
        &self,
        runner: &StepRunner,
        mut on_stage: impl FnMut(InstallStage),
    ) -> Result<BuildReport> {
        tokio::fs::create_dir_all(&self.prefix).await?;
        tokio::fs::create_dir_all(self.work_dir()).await?;
        tokio::fs::create_dir_all(&self.scratch_dir).await?;

        let name = self.formula.name.as_str();
        let mut stage = InstallStage::Configuring;
        on_stage(stage);

        let mut report = BuildReport::default();
        for step in self.plan_steps().map_err(|e| e.in_stage(name, stage))? {
            if step.stage > stage {
                stage = step.stage;
                on_stage(stage);
            }
            info!("[{}] ==> {}", name, step.name);
            runner
                .run_checked(&step)
                .await
                .map_err(|e| e.in_stage(name, stage))?;
            report.steps_run.push(step.name);
        }
        if let Some((bindings, steps)) = self.plan_bindings().map_err(|e| e.in_stage(name, stage))? {
            if stage < InstallStage::Installing {
                stage = InstallStage::Installing;
                on_stage(stage);
            }
            info!("[{}] ==> Installing {} bindings", name, bindings);
            for step in steps {
                runner
                    .run_checked(&step)
                    .await
                    .map_err(|e| e.in_stage(name, stage))?;
                report.steps_run.push(step.name);
            }
            report.bindings_installed = true;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::flags::resolve_flags;
    use crate::test_support::nektar;

    fn presence(deps: &[&str]) -> DependencyPresence {
        let mut p = DependencyPresence::new();
        for d in deps {
            p.insert(*d, format!("/opt/cellar/opt/{d}"));
        }
        p
    }

    fn executor<'a>(
        formula: &'a Formula,
        sel: &'a BuildSelections,
        presence: &'a DependencyPresence,
        flags: &'a BuildFlagSet,
    ) -> BuildExecutor<'a> {
        BuildExecutor {
            formula,
            selections: sel,
            presence,
            flags,
            source_dir: "/tmp/attempt/src".into(),
            build_dir: "/tmp/attempt/build".into(),
            prefix: "/opt/cellar/Cellar/nektar/5.2.0".into(),
            scratch_dir: "/tmp/attempt/home".into(),
            make_jobs: 8,
        }
    }

    #[test]
    fn cmake_plan_installs_components() {
        let formula = nektar();
        let sel = BuildSelections::default();
        let p = presence(&["zlib", "mpi"]);
        let flags = resolve_flags(&formula, &sel, &p).unwrap();
        let exec = executor(&formula, &sel, &p, &flags);
        let steps = exec.plan_steps().unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "configure",
                "build",
                "install-ThirdParty",
                "install-lib",
                "install-solvers",
                "install-util",
                "install-dev"
            ]
        );
        let configure = &steps[0];
        assert_eq!(configure.cwd, PathBuf::from("/tmp/attempt/build"));
        assert_eq!(configure.args[0], "/tmp/attempt/src");
        assert!(configure
            .args
            .contains(&"-DCMAKE_INSTALL_PREFIX=/opt/cellar/Cellar/nektar/5.2.0".to_string()));
        assert!(configure.args.contains(&"-DNEKTAR_USE_MPI=ON".to_string()));
        assert!(configure.args.contains(&"-DNEKTAR_USE_PETSC=OFF".to_string()));
        assert_eq!(steps[1].args, vec!["-j8"]);
        assert_eq!(steps[2].args, vec!["-DCOMPONENT=ThirdParty", "-P", "cmake_install.cmake"]);

        let stages: Vec<InstallStage> = steps.iter().map(|s| s.stage).collect();
        assert_eq!(stages[0], InstallStage::Configuring);
        assert_eq!(stages[1], InstallStage::Building);
        assert!(stages[2..].iter().all(|s| *s == InstallStage::Installing));
    }

    #[test]
    fn bindings_follow_dependency_presence() {
        let formula = nektar();
        let sel = BuildSelections::default();
        let without = presence(&["zlib"]);
        let flags = resolve_flags(&formula, &sel, &without).unwrap();
        assert!(executor(&formula, &sel, &without, &flags)
            .plan_bindings()
            .unwrap()
            .is_none());

        let with = presence(&["zlib", "python"]);
        let flags = resolve_flags(&formula, &sel, &with).unwrap();
        let exec = executor(&formula, &sel, &with, &flags);
        let (name, steps) = exec.plan_bindings().unwrap().unwrap();
        assert_eq!(name, "python");
        assert_eq!(steps[0].stage, InstallStage::Installing);
        assert_eq!(
            steps[0].args,
            vec![
                "-m",
                "pip",
                "install",
                "--prefix=/opt/cellar/Cellar/nektar/5.2.0",
                "/tmp/attempt/build/python"
            ]
        );
    }

    #[test]
    fn autotools_plan() {
        let mut formula = nektar();
        formula.install.system = BuildSystem::Autotools;
        formula.install.out_of_source = false;
        formula.install.flags.clear();
        let sel = BuildSelections::default();
        let p = presence(&[]);
        let flags = BuildFlagSet::new();
        let exec = executor(&formula, &sel, &p, &flags);
        let steps = exec.plan_steps().unwrap();
        assert_eq!(steps[0].program, "./configure");
        assert_eq!(steps[0].cwd, PathBuf::from("/tmp/attempt/src"));
        assert_eq!(steps[0].args[0], "--prefix=/opt/cellar/Cellar/nektar/5.2.0");
        assert_eq!(steps.last().unwrap().args, vec!["install"]);
    }
}
