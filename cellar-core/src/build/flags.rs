// cellar-core/src/build/flags.rs
//! Variant resolution: formula flag rules + user selections + dependency
//! presence become one ordered [`BuildFlagSet`].

use std::collections::BTreeMap;
use std::path::Path;

use cellar_common::error::{CellarError, Result};
use cellar_common::model::procedure::FlagRule;
use cellar_common::model::{BuildFlagSet, BuildSelections, DependencyPresence, Formula};
use tracing::debug;

/// Values substituted into `{...}` templates in flag values and step
/// arguments. `{opt:<dep>}` resolves through the dependency presence map;
/// `{{` and `}}` are literal braces.
#[derive(Debug, Clone)]
pub struct Placeholders<'a> {
    values: BTreeMap<&'static str, String>,
    presence: &'a DependencyPresence,
}

impl<'a> Placeholders<'a> {
    pub fn new(presence: &'a DependencyPresence) -> Self {
        Self {
            values: BTreeMap::new(),
            presence,
        }
    }

    pub fn set(&mut self, key: &'static str, value: impl Into<String>) -> &mut Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn set_path(&mut self, key: &'static str, path: &Path) -> &mut Self {
        self.set(key, path.to_string_lossy())
    }

    pub fn expand(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if let Some(after) = tail.strip_prefix("{{") {
                out.push('{');
                rest = after;
                continue;
            }
            if let Some(after) = tail.strip_prefix("}}") {
                out.push('}');
                rest = after;
                continue;
            }
            if tail.starts_with('}') {
                return Err(template_error(template, "unmatched '}'"));
            }
            let end = tail
                .find('}')
                .ok_or_else(|| template_error(template, "unterminated placeholder"))?;
            let key = &tail[1..end];
            out.push_str(&self.lookup(template, key)?);
            rest = &tail[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn lookup(&self, template: &str, key: &str) -> Result<String> {
        if let Some(dep) = key.strip_prefix("opt:") {
            return self
                .presence
                .opt_path(dep)
                .map(|p| p.to_string_lossy().into_owned())
                .ok_or_else(|| template_error(template, &format!("dependency '{dep}' is not present")));
        }
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| template_error(template, &format!("unknown placeholder '{{{key}}}'")))
    }
}

fn template_error(template: &str, message: &str) -> CellarError {
    CellarError::ValidationError(format!("in '{template}': {message}"))
}

/// Whether a name used by an option rule is switched on. Switchable
/// dependencies double as options, so for those presence decides.
fn option_enabled(
    formula: &Formula,
    option: &str,
    selections: &BuildSelections,
    presence: &DependencyPresence,
) -> bool {
    if formula.option(option).is_some() {
        selections.is_enabled(option)
    } else {
        presence.is_present(option)
    }
}

/// Computes the configure flags for one build. Same inputs always give the
/// same sequence; conditional templates are only expanded when their
/// condition holds.
pub fn resolve_flags(
    formula: &Formula,
    selections: &BuildSelections,
    presence: &DependencyPresence,
) -> Result<BuildFlagSet> {
    let placeholders = Placeholders::new(presence);
    let mut flags = BuildFlagSet::new();
    for rule in &formula.install.flags {
        match rule {
            FlagRule::Constant { key, value } => {
                flags.push(key, placeholders.expand(value)?)?;
            }
            FlagRule::DependencyToggle {
                key,
                dependency,
                on,
                off,
            } => {
                let value = if presence.is_present(dependency) { on } else { off };
                flags.push(key, value)?;
            }
            FlagRule::OptionToggle { key, option, on, off } => {
                let value = if option_enabled(formula, option, selections, presence) {
                    on
                } else {
                    off
                };
                flags.push(key, value)?;
            }
            FlagRule::WhenDependency {
                key,
                dependency,
                value,
            } => {
                if presence.is_present(dependency) {
                    flags.push(key, placeholders.expand(value)?)?;
                }
            }
            FlagRule::WhenOption { key, option, value } => {
                if option_enabled(formula, option, selections, presence) {
                    flags.push(key, placeholders.expand(value)?)?;
                }
            }
        }
    }
    debug!(
        "Resolved {} flags for {}: {:?}",
        flags.len(),
        formula.name,
        flags.to_cmake_args()
    );
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::nektar;

    fn presence(deps: &[&str]) -> DependencyPresence {
        let mut p = DependencyPresence::new();
        for d in deps {
            p.insert(*d, format!("/opt/cellar/opt/{d}"));
        }
        p
    }

    #[test]
    fn mpi_on_petsc_off() {
        let formula = nektar();
        let flags = resolve_flags(
            &formula,
            &BuildSelections::default(),
            &presence(&["cmake", "boost", "zlib", "mpi"]),
        )
        .unwrap();
        assert_eq!(flags.get("NEKTAR_USE_MPI"), Some("ON"));
        assert_eq!(flags.get("NEKTAR_USE_PETSC"), Some("OFF"));
        assert_eq!(flags.get("PETSC_DIR"), None);
        assert_eq!(flags.get("NEKTAR_BUILD_DEMOS"), Some("OFF"));
        assert_eq!(flags.get("ZLIB_ROOT"), Some("/opt/cellar/opt/zlib"));
        assert_eq!(
            flags.to_cmake_args(),
            vec![
                "-DNEKTAR_BUILD_TESTS=OFF",
                "-DZLIB_ROOT=/opt/cellar/opt/zlib",
                "-DNEKTAR_BUILD_DEMOS=OFF",
                "-DNEKTAR_USE_MPI=ON",
                "-DNEKTAR_USE_PETSC=OFF",
            ]
        );
    }

    #[test]
    fn conditional_template_expands_when_present() {
        let formula = nektar();
        let mut sel = BuildSelections::default();
        sel.push_flag("--with-petsc");
        sel.push_flag("--with-demos");
        let flags = resolve_flags(&formula, &sel, &presence(&["zlib", "petsc"])).unwrap();
        assert_eq!(flags.get("PETSC_DIR"), Some("/opt/cellar/opt/petsc/real"));
        assert_eq!(flags.get("NEKTAR_USE_PETSC"), Some("ON"));
        assert_eq!(flags.get("NEKTAR_USE_MPI"), Some("OFF"));
        assert_eq!(flags.get("NEKTAR_BUILD_DEMOS"), Some("ON"));
    }

    #[test]
    fn deterministic() {
        let formula = nektar();
        let p = presence(&["zlib", "mpi"]);
        let a = resolve_flags(&formula, &BuildSelections::default(), &p).unwrap();
        let b = resolve_flags(&formula, &BuildSelections::default(), &p).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn missing_required_template_dependency_is_an_error() {
        let formula = nektar();
        let err = resolve_flags(&formula, &BuildSelections::default(), &presence(&[])).unwrap_err();
        assert!(err.to_string().contains("zlib"));
    }

    #[test]
    fn placeholder_expansion() {
        let p = presence(&["boost"]);
        let mut ph = Placeholders::new(&p);
        ph.set("prefix", "/keg").set("jobs", "4");
        assert_eq!(ph.expand("--prefix={prefix}").unwrap(), "--prefix=/keg");
        assert_eq!(ph.expand("-j{jobs}").unwrap(), "-j4");
        assert_eq!(ph.expand("{opt:boost}/include").unwrap(), "/opt/cellar/opt/boost/include");
        assert_eq!(ph.expand("{{literal}}").unwrap(), "{literal}");
        assert!(ph.expand("{nope}").is_err());
        assert!(ph.expand("{prefix").is_err());
        assert!(ph.expand("a}b").is_err());
    }
}
