// cellar-common/src/model/formula.rs
//! Formula descriptors: how to fetch, configure, build and verify one package.
//!
//! A formula is plain data parsed from TOML or JSON. Everything that was
//! package-specific behaviour in a classic formula class (flag selection,
//! install steps, test programs) is expressed as fields here and interpreted
//! by the shared orchestrator in `cellar-core`.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::options::{BuildSelections, OptionSpec};
use super::procedure::{InstallProcedure, TestProcedure};
use crate::dependency::{Dependency, DependencyTag};
use crate::error::{CellarError, Result};

/// A versioned source archive with a recorded digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSource {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// A VCS head reference. Never checksummed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadSource {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// The source actually chosen for one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Archive(ArchiveSource),
    Head(HeadSource),
}

impl SourceSpec {
    pub fn url(&self) -> &str {
        match self {
            Self::Archive(a) => &a.url,
            Self::Head(h) => &h.url,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Self::Head(_))
    }
}

/// A unified diff applied to the staged tree before configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Inline diff payload.
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Leading path components stripped from file names in the diff (`patch -pN`).
    #[serde(default = "default_strip")]
    pub strip: usize,
}

fn default_strip() -> usize {
    1
}

impl PatchSpec {
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.url.as_ref().map(|u| u.rsplit('/').next().unwrap_or(u).to_string()))
            .unwrap_or_else(|| format!("patch-{index}"))
    }
}

/// An auxiliary download staged into the source tree, e.g. third-party
/// tarballs the upstream build would otherwise fetch on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSpec {
    pub name: String,
    pub url: String,
    pub sha256: String,
    /// Directory relative to the source root the resource is staged into.
    #[serde(default)]
    pub target: Option<String>,
    /// Extract the archive instead of copying the file verbatim.
    #[serde(default)]
    pub extract: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Formula {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub source: Option<ArchiveSource>,
    #[serde(default)]
    pub head: Option<HeadSource>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub options: Vec<OptionSpec>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub install: InstallProcedure,
    #[serde(default)]
    pub test: Option<TestProcedure>,
}

impl Formula {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let formula: Formula = toml::from_str(raw)?;
        formula.validate()?;
        Ok(formula)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let formula: Formula = serde_json::from_str(raw)?;
        formula.validate()?;
        Ok(formula)
    }

    /// Parses a descriptor file, picking the format from its extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!("Parsing formula descriptor {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(CellarError::ParseError(
                "formula",
                format!(
                    "Unsupported descriptor extension {:?} for {}",
                    other,
                    path.display()
                ),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version including the revision suffix; also the keg directory name.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    pub fn dependency(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    pub fn option(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Picks the source for a build. Head is used when requested or when the
    /// formula has no stable archive.
    pub fn source_for(&self, selections: &BuildSelections) -> Result<SourceSpec> {
        match (&self.source, &self.head, selections.head) {
            (_, Some(head), true) | (None, Some(head), false) => Ok(SourceSpec::Head(head.clone())),
            (Some(archive), _, false) => Ok(SourceSpec::Archive(archive.clone())),
            (_, None, true) => Err(CellarError::ValidationError(format!(
                "{} has no head source",
                self.name
            ))),
            (None, None, _) => Err(CellarError::ValidationError(format!(
                "{} declares no source",
                self.name
            ))),
        }
    }

    /// Whether the dependency named `dep` takes part in a build with `selections`.
    pub fn wants_dependency(&self, dep: &Dependency, selections: &BuildSelections) -> bool {
        if dep.tags.contains(DependencyTag::TEST) {
            return false;
        }
        if dep.tags.contains(DependencyTag::RECOMMENDED) {
            return !selections.without.contains(&dep.name) && !selections.skip_recommended;
        }
        if dep.tags.contains(DependencyTag::OPTIONAL) {
            let implied = self
                .options
                .iter()
                .any(|o| o.implies.as_deref() == Some(dep.name.as_str()) && selections.is_enabled(&o.name));
            return selections.with.contains(&dep.name) || selections.include_optional || implied;
        }
        true
    }

    /// Names accepted after `--with-` / `--without-` for this formula.
    pub fn option_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.options.iter().map(|o| o.name.clone()).collect();
        for dep in &self.dependencies {
            if dep.is_switchable() && !names.contains(&dep.name) {
                names.push(dep.name.clone());
            }
        }
        names
    }

    /// Rejects selections naming options this formula does not have.
    pub fn check_selections(&self, selections: &BuildSelections) -> Result<()> {
        let known = self.option_names();
        for name in selections.with.iter().chain(selections.without.iter()) {
            if !known.contains(name) {
                return Err(CellarError::ValidationError(format!(
                    "{} has no option '{}' (known: {})",
                    self.name,
                    name,
                    known.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CellarError::ValidationError(format!("{}: {msg}", self.name)));

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.+@".contains(c))
        {
            return Err(CellarError::ValidationError(format!(
                "Invalid formula name '{}'",
                self.name
            )));
        }
        if self.version.trim().is_empty() {
            return invalid("empty version".to_string());
        }
        if self.source.is_none() && self.head.is_none() {
            return invalid("needs a source archive or a head reference".to_string());
        }
        if let Some(archive) = &self.source {
            if !is_sha256_hex(&archive.sha256) {
                return invalid(format!("source sha256 '{}' is not a sha256 digest", archive.sha256));
            }
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.name.as_str()) {
                return invalid(format!("dependency '{}' declared twice", dep.name));
            }
            if dep.name == self.name {
                return invalid("depends on itself".to_string());
            }
        }

        let mut seen = HashSet::new();
        for opt in &self.options {
            if !seen.insert(opt.name.as_str()) {
                return invalid(format!("option '{}' declared twice", opt.name));
            }
            if let Some(dep) = &opt.implies {
                if self.dependency(dep).is_none() {
                    return invalid(format!("option '{}' implies unknown dependency '{dep}'", opt.name));
                }
            }
        }

        for (i, patch) in self.patches.iter().enumerate() {
            match (&patch.diff, &patch.url, &patch.sha256) {
                (Some(_), None, _) => {}
                (None, Some(_), Some(sha)) if is_sha256_hex(sha) => {}
                _ => {
                    return invalid(format!(
                        "patch '{}' needs either an inline diff or a url with a sha256",
                        patch.display_name(i)
                    ))
                }
            }
        }

        let mut seen = HashSet::new();
        for res in &self.resources {
            if !seen.insert(res.name.as_str()) {
                return invalid(format!("resource '{}' declared twice", res.name));
            }
            if !is_sha256_hex(&res.sha256) {
                return invalid(format!("resource '{}' has an invalid sha256", res.name));
            }
        }

        let option_names = self.option_names();
        self.install.validate(
            |dep| self.dependency(dep).is_some(),
            |opt| option_names.iter().any(|o| o == opt),
        )
        .map_err(|e| CellarError::ValidationError(format!("{}: {e}", self.name)))?;

        if let Some(test) = &self.test {
            test.validate()
                .map_err(|e| CellarError::ValidationError(format!("{}: {e}", self.name)))?;
        }
        Ok(())
    }
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dependency::RequirementLevel;

    pub(crate) const NEKTAR_TOML: &str = r#"
name = "nektar"
desc = "Nektar++ spectral/hp element framework"
homepage = "https://www.nektar.info/"
version = "5.2.0"

[source]
url = "https://www.nektar.info/src/nektar-v5.2.0.tar.bz2"
sha256 = "0E5B4B2E3A8F0A0A62F3D1C8F7A0C5E1B4F6E2D9C3B8A7F6E5D4C3B2A1F0E9D8"

[head]
url = "https://gitlab.nektar.info/nektar/nektar.git"

[[dependencies]]
name = "cmake"
level = "build"
kind = "build-tool"

[[dependencies]]
name = "boost"

[[dependencies]]
name = "zlib"

[[dependencies]]
name = "mpi"
level = "recommended"

[[dependencies]]
name = "petsc"
level = "optional"

[[dependencies]]
name = "python"
level = "optional"
kind = "language-runtime"

[[options]]
name = "demos"
description = "Compile Nektar++ demo executables"

[install]
system = "cmake"
components = ["ThirdParty", "lib", "solvers", "util", "dev"]

[[install.flags]]
key = "NEKTAR_BUILD_TESTS"
value = "OFF"

[[install.flags]]
key = "ZLIB_ROOT"
value = "{opt:zlib}"

[[install.flags]]
key = "NEKTAR_BUILD_DEMOS"
option = "demos"

[[install.flags]]
key = "NEKTAR_USE_MPI"
dependency = "mpi"

[[install.flags]]
key = "NEKTAR_USE_PETSC"
dependency = "petsc"

[[install.flags]]
key = "PETSC_DIR"
when_dependency = "petsc"
value = "{opt:petsc}/real"

[install.bindings]
name = "python"
when_dependency = "python"

[[install.bindings.steps]]
name = "python-bindings"
program = "python3"
args = ["-m", "pip", "install", "--prefix={prefix}", "{build}/python"]
"#;

    #[test]
    fn parses_nektar_descriptor() {
        let f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        assert_eq!(f.name(), "nektar");
        assert_eq!(f.version_str_full(), "5.2.0");
        assert_eq!(f.dependencies.len(), 6);
        assert_eq!(
            f.dependency("mpi").unwrap().level(),
            RequirementLevel::Recommended
        );
        assert_eq!(f.install.components.len(), 5);
        assert!(f.install.bindings.is_some());
        assert_eq!(
            f.option_names(),
            vec!["demos".to_string(), "mpi".into(), "petsc".into(), "python".into()]
        );
    }

    #[test]
    fn revision_suffixes_version() {
        let mut f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        f.revision = 2;
        assert_eq!(f.version_str_full(), "5.2.0_2");
    }

    #[test]
    fn source_selection_honours_head() {
        let f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        let stable = f.source_for(&BuildSelections::default()).unwrap();
        assert!(!stable.is_head());
        let head = f
            .source_for(&BuildSelections {
                head: true,
                ..Default::default()
            })
            .unwrap();
        assert!(head.is_head());
        assert_eq!(head.url(), "https://gitlab.nektar.info/nektar/nektar.git");
    }

    #[test]
    fn dependency_selection_defaults() {
        let f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        let defaults = BuildSelections::default();
        assert!(f.wants_dependency(f.dependency("boost").unwrap(), &defaults));
        assert!(f.wants_dependency(f.dependency("mpi").unwrap(), &defaults));
        assert!(!f.wants_dependency(f.dependency("petsc").unwrap(), &defaults));

        let mut sel = BuildSelections::default();
        sel.without.insert("mpi".into());
        sel.with.insert("petsc".into());
        assert!(!f.wants_dependency(f.dependency("mpi").unwrap(), &sel));
        assert!(f.wants_dependency(f.dependency("petsc").unwrap(), &sel));
    }

    #[test]
    fn rejects_bad_checksum_and_unknown_flag_references() {
        let bad_sha = NEKTAR_TOML.replace(
            "0E5B4B2E3A8F0A0A62F3D1C8F7A0C5E1B4F6E2D9C3B8A7F6E5D4C3B2A1F0E9D8",
            "nope",
        );
        assert!(matches!(
            Formula::from_toml_str(&bad_sha),
            Err(CellarError::ValidationError(_))
        ));

        let bad_ref = NEKTAR_TOML.replace("dependency = \"mpi\"", "dependency = \"vtk\"");
        assert!(matches!(
            Formula::from_toml_str(&bad_ref),
            Err(CellarError::ValidationError(_))
        ));
    }

    #[test]
    fn conditional_switch_flags_are_rejected() {
        let omitted_when_absent = NEKTAR_TOML.replace(
            "key = \"NEKTAR_USE_PETSC\"\ndependency = \"petsc\"",
            "key = \"NEKTAR_USE_PETSC\"\nwhen_dependency = \"petsc\"\nvalue = \"ON\"",
        );
        assert_ne!(omitted_when_absent, NEKTAR_TOML);
        let err = Formula::from_toml_str(&omitted_when_absent).unwrap_err();
        assert!(matches!(err, CellarError::ValidationError(_)));
        assert!(err.to_string().contains("NEKTAR_USE_PETSC"));
    }

    #[test]
    fn unknown_selection_is_rejected() {
        let f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        let mut sel = BuildSelections::default();
        sel.with.insert("demos".into());
        assert!(f.check_selections(&sel).is_ok());
        sel.with.insert("gui".into());
        assert!(f.check_selections(&sel).is_err());
    }

    #[test]
    fn json_descriptor_round_trips_through_serde() {
        let f = Formula::from_toml_str(NEKTAR_TOML).unwrap();
        let json = serde_json::to_string(&f).unwrap();
        let back = Formula::from_json_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
