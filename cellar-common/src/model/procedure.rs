// cellar-common/src/model/procedure.rs
//! Declarative install and test procedures carried by a formula.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::InstallStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildSystem {
    #[default]
    Cmake,
    Autotools,
    Make,
    /// Only the declared `steps` run.
    Custom,
}

/// Working directory a step runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepDir {
    Source,
    #[default]
    Build,
    Prefix,
    /// Per-run scratch directory; only meaningful for test steps.
    Scratch,
}

/// One external command. Arguments may contain placeholders such as
/// `{prefix}`, `{source}`, `{build}`, `{jobs}` or `{opt:<dep>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: StepDir,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Text fed to the process on stdin.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Install stage an install step reports as (`configuring`, `building`
    /// or `installing`). Ignored for test steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<InstallStage>,
}

/// How a single build flag is derived from the resolved selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFlagRule", into = "RawFlagRule")]
pub enum FlagRule {
    /// Always emitted.
    Constant { key: String, value: String },
    /// Emitted as `on` when the dependency is present, `off` otherwise.
    DependencyToggle {
        key: String,
        dependency: String,
        on: String,
        off: String,
    },
    /// Emitted as `on` when the option is enabled, `off` otherwise.
    OptionToggle {
        key: String,
        option: String,
        on: String,
        off: String,
    },
    /// Emitted only when the dependency is present.
    WhenDependency {
        key: String,
        dependency: String,
        value: String,
    },
    /// Emitted only when the option is enabled.
    WhenOption {
        key: String,
        option: String,
        value: String,
    },
}

impl FlagRule {
    pub fn key(&self) -> &str {
        match self {
            Self::Constant { key, .. }
            | Self::DependencyToggle { key, .. }
            | Self::OptionToggle { key, .. }
            | Self::WhenDependency { key, .. }
            | Self::WhenOption { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RawFlagRule {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    when_dependency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    when_option: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    off: Option<String>,
}

impl TryFrom<RawFlagRule> for FlagRule {
    type Error = String;

    fn try_from(raw: RawFlagRule) -> Result<Self, Self::Error> {
        if raw.key.is_empty() {
            return Err("flag rule with empty key".to_string());
        }
        let toggle = |v: Option<String>, d: &str| v.unwrap_or_else(|| d.to_string());
        let rule = match (
            raw.dependency,
            raw.option,
            raw.when_dependency,
            raw.when_option,
            raw.value,
        ) {
            (None, None, None, None, Some(value)) => FlagRule::Constant {
                key: raw.key,
                value,
            },
            (Some(dependency), None, None, None, None) => FlagRule::DependencyToggle {
                key: raw.key,
                dependency,
                on: toggle(raw.on, "ON"),
                off: toggle(raw.off, "OFF"),
            },
            (None, Some(option), None, None, None) => FlagRule::OptionToggle {
                key: raw.key,
                option,
                on: toggle(raw.on, "ON"),
                off: toggle(raw.off, "OFF"),
            },
            (None, None, Some(dependency), None, Some(value)) => FlagRule::WhenDependency {
                key: raw.key,
                dependency,
                value,
            },
            (None, None, None, Some(option), Some(value)) => FlagRule::WhenOption {
                key: raw.key,
                option,
                value,
            },
            _ => {
                return Err(format!(
                    "flag rule '{}' must use exactly one of value, dependency, option, \
                     when_dependency + value or when_option + value",
                    raw.key
                ))
            }
        };
        Ok(rule)
    }
}

impl From<FlagRule> for RawFlagRule {
    fn from(rule: FlagRule) -> Self {
        match rule {
            FlagRule::Constant { key, value } => RawFlagRule {
                key,
                value: Some(value),
                ..Default::default()
            },
            FlagRule::DependencyToggle {
                key,
                dependency,
                on,
                off,
            } => RawFlagRule {
                key,
                dependency: Some(dependency),
                on: Some(on),
                off: Some(off),
                ..Default::default()
            },
            FlagRule::OptionToggle {
                key,
                option,
                on,
                off,
            } => RawFlagRule {
                key,
                option: Some(option),
                on: Some(on),
                off: Some(off),
                ..Default::default()
            },
            FlagRule::WhenDependency {
                key,
                dependency,
                value,
            } => RawFlagRule {
                key,
                when_dependency: Some(dependency),
                value: Some(value),
                ..Default::default()
            },
            FlagRule::WhenOption { key, option, value } => RawFlagRule {
                key,
                when_option: Some(option),
                value: Some(value),
                ..Default::default()
            },
        }
    }
}

/// Secondary install phase for language bindings, run after the main
/// install when its condition holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingsSpec {
    pub name: String,
    #[serde(default)]
    pub when_dependency: Option<String>,
    #[serde(default)]
    pub when_option: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstallProcedure {
    #[serde(default)]
    pub system: BuildSystem,
    /// Build with the out-of-source directory (`<source>/build`).
    #[serde(default = "default_true")]
    pub out_of_source: bool,
    #[serde(default)]
    pub flags: Vec<FlagRule>,
    /// Install components, in order. Empty means a plain `install` target.
    #[serde(default)]
    pub components: Vec<String>,
    /// Extra configure arguments passed after the generated flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// For `custom` builds the whole procedure; otherwise run after install.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub bindings: Option<BindingsSpec>,
}

fn default_true() -> bool {
    true
}

/// Boolean-looking values that build systems read as an on/off switch.
fn is_switch_value(value: &str) -> bool {
    matches!(
        value.to_ascii_uppercase().as_str(),
        "ON" | "OFF" | "TRUE" | "FALSE" | "YES" | "NO" | "1" | "0"
    )
}

impl InstallProcedure {
    pub(crate) fn validate(
        &self,
        has_dependency: impl Fn(&str) -> bool,
        has_option: impl Fn(&str) -> bool,
    ) -> Result<(), String> {
        let mut by_key: BTreeMap<&str, &FlagRule> = BTreeMap::new();
        for rule in &self.flags {
            match rule {
                FlagRule::DependencyToggle { dependency, .. }
                | FlagRule::WhenDependency { dependency, .. }
                    if !has_dependency(dependency) =>
                {
                    return Err(format!(
                        "flag '{}' references undeclared dependency '{dependency}'",
                        rule.key()
                    ))
                }
                FlagRule::OptionToggle { option, .. } | FlagRule::WhenOption { option, .. }
                    if !has_option(option) =>
                {
                    return Err(format!(
                        "flag '{}' references unknown option '{option}'",
                        rule.key()
                    ))
                }
                FlagRule::WhenDependency { value, .. } | FlagRule::WhenOption { value, .. }
                    if is_switch_value(value) =>
                {
                    return Err(format!(
                        "flag '{}' is a switch; use a `dependency` or `option` toggle so \
                         it is emitted as OFF instead of omitted",
                        rule.key()
                    ))
                }
                _ => {}
            }
            if let Some(existing) = by_key.insert(rule.key(), rule) {
                if existing != rule {
                    return Err(format!("conflicting rules for flag '{}'", rule.key()));
                }
            }
        }
        let build_stages = [
            InstallStage::Configuring,
            InstallStage::Building,
            InstallStage::Installing,
        ];
        let all_steps = self
            .steps
            .iter()
            .chain(self.bindings.iter().flat_map(|b| b.steps.iter()));
        for step in all_steps {
            if let Some(stage) = step.stage.filter(|s| !build_stages.contains(s)) {
                return Err(format!("step '{}' cannot run in the {stage} stage", step.name));
            }
        }
        if self.system == BuildSystem::Custom && self.steps.is_empty() {
            return Err("custom build system requires steps".to_string());
        }
        if let Some(bindings) = &self.bindings {
            if let Some(dep) = &bindings.when_dependency {
                if !has_dependency(dep) {
                    return Err(format!(
                        "bindings '{}' gated on undeclared dependency '{dep}'",
                        bindings.name
                    ));
                }
            }
            if let Some(opt) = &bindings.when_option {
                if !has_option(opt) {
                    return Err(format!(
                        "bindings '{}' gated on unknown option '{opt}'",
                        bindings.name
                    ));
                }
            }
            check_unique_steps(&bindings.steps)?;
        }
        check_unique_steps(&self.steps)
    }
}

/// A file written into the scratch directory before the test steps run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    pub path: String,
    pub contents: String,
}

/// A check applied to a test step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assertion {
    /// The step exits zero.
    Success { step: String },
    /// The last number printed by the step is strictly below `threshold`.
    Below { step: String, threshold: f64 },
    /// Trimmed stdout equals `expected` exactly.
    Equals { step: String, expected: String },
    /// The step prints two numbers (original, reconstructed) that agree
    /// within `tolerance`.
    RoundTrip { step: String, tolerance: f64 },
}

impl Assertion {
    pub fn step(&self) -> &str {
        match self {
            Self::Success { step }
            | Self::Below { step, .. }
            | Self::Equals { step, .. }
            | Self::RoundTrip { step, .. } => step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TestProcedure {
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl TestProcedure {
    pub(crate) fn validate(&self) -> Result<(), String> {
        check_unique_steps(&self.steps)?;
        for fixture in &self.fixtures {
            let path = std::path::Path::new(&fixture.path);
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(format!(
                    "fixture path '{}' must stay inside the scratch directory",
                    fixture.path
                ));
            }
        }
        for assertion in &self.assertions {
            if !self.steps.iter().any(|s| s.name == assertion.step()) {
                return Err(format!(
                    "assertion references unknown test step '{}'",
                    assertion.step()
                ));
            }
        }
        Ok(())
    }
}

fn check_unique_steps(steps: &[StepSpec]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(format!("step '{}' declared twice", step.name));
        }
    }
    Ok(())
}
