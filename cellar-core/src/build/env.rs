// cellar-core/src/build/env.rs
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use cellar_common::config::Config;
use cellar_common::error::{CellarError, Result};
use cellar_common::model::DependencyPresence;
use tracing::debug;

/// The exact environment every build, bindings and test step runs with.
///
/// Built from the configuration and the opt paths of the dependencies that
/// are present; nothing is taken from the calling process's environment.
/// Dependency directories come first on every search path, then the cellar
/// prefix, then the configured base PATH.
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
    path_dirs: Vec<PathBuf>,
}

impl BuildEnvironment {
    /// `home` doubles as `TMPDIR`; it should live inside the attempt's
    /// scratch space.
    pub fn new(config: &Config, presence: &DependencyPresence, home: &Path) -> Result<Self> {
        let dep_paths: Vec<&Path> = presence.iter().map(|(_, p)| p.as_path()).collect();
        debug!(
            "Creating BuildEnvironment with dependency paths: {:?}",
            dep_paths
        );

        let mut path_dirs: Vec<PathBuf> = Vec::new();
        for dep in &dep_paths {
            path_dirs.push(dep.join("bin"));
            path_dirs.push(dep.join("sbin"));
        }
        path_dirs.push(config.cellar_root().join("bin"));
        path_dirs.extend(config.base_path.iter().cloned());
        let mut unique = Vec::new();
        for dir in path_dirs {
            if !unique.contains(&dir) {
                unique.push(dir);
            }
        }
        let path_dirs = unique;

        let mut vars = BTreeMap::new();
        vars.insert("PATH".to_string(), join_paths(&path_dirs)?);
        vars.insert("HOME".to_string(), home.to_string_lossy().into_owned());
        vars.insert("TMPDIR".to_string(), home.to_string_lossy().into_owned());
        vars.insert("LC_ALL".to_string(), "C".to_string());
        vars.insert("MAKEFLAGS".to_string(), format!("-j{}", config.make_jobs));

        let mut prefixes: Vec<PathBuf> = dep_paths.iter().map(|p| p.to_path_buf()).collect();
        prefixes.push(config.cellar_root().to_path_buf());
        set_path_list(&mut vars, "CMAKE_PREFIX_PATH", &prefixes)?;

        let existing = |sub: &str| -> Vec<PathBuf> {
            prefixes
                .iter()
                .map(|p| p.join(sub))
                .filter(|p| p.is_dir())
                .collect()
        };
        let mut pkg_config = existing("lib/pkgconfig");
        pkg_config.extend(existing("share/pkgconfig"));
        set_path_list(&mut vars, "PKG_CONFIG_PATH", &pkg_config)?;
        set_path_list(&mut vars, "ACLOCAL_PATH", &existing("share/aclocal"))?;

        let cppflags: Vec<String> = existing("include")
            .iter()
            .map(|p| format!("-I{}", p.display()))
            .collect();
        let ldflags: Vec<String> = existing("lib")
            .iter()
            .map(|p| format!("-L{}", p.display()))
            .collect();
        if !cppflags.is_empty() {
            vars.insert("CPPFLAGS".to_string(), cppflags.join(" "));
        }
        if !ldflags.is_empty() {
            vars.insert("LDFLAGS".to_string(), ldflags.join(" "));
        }

        debug!("Build PATH: {}", vars.get("PATH").map(String::as_str).unwrap_or(""));
        Ok(Self { vars, path_dirs })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get_path_string(&self) -> &str {
        self.get("PATH").unwrap_or("")
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }

    /// Puts `dir` ahead of everything else on PATH.
    pub fn prepend_path(&mut self, dir: PathBuf) -> Result<()> {
        self.path_dirs.retain(|d| d != &dir);
        self.path_dirs.insert(0, dir);
        let joined = join_paths(&self.path_dirs)?;
        self.vars.insert("PATH".to_string(), joined);
        Ok(())
    }

    /// The environment for one step: the base variables overlaid with the
    /// step's own (already expanded) entries.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }

    /// Locates `program` on the build PATH. Names containing a slash are
    /// taken relative to `cwd`.
    pub fn find_program(&self, program: &str, cwd: &Path) -> Result<PathBuf> {
        if program.contains('/') {
            let path = cwd.join(program);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(CellarError::CommandExecError(format!(
                    "{} not found",
                    path.display()
                )))
            };
        }
        which::which_in(program, Some(self.get_path_string()), cwd).map_err(|_| {
            CellarError::CommandExecError(format!(
                "{program} command not found in build environment PATH"
            ))
        })
    }
}

fn join_paths(dirs: &[PathBuf]) -> Result<String> {
    env::join_paths(dirs)
        .map_err(|e| CellarError::Config(format!("Failed to join PATH: {e}")))?
        .into_string()
        .map_err(|s| CellarError::Config(format!("PATH contains non-UTF8 characters: {s:?}")))
}

fn set_path_list(vars: &mut BTreeMap<String, String>, key: &str, dirs: &[PathBuf]) -> Result<()> {
    if !dirs.is_empty() {
        vars.insert(key.to_string(), join_paths(dirs)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_dirs_lead_the_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path().join("prefix"));
        config.make_jobs = 3;
        config.base_path = vec![PathBuf::from("/usr/bin")];
        let zlib = dir.path().join("prefix/opt/zlib");
        std::fs::create_dir_all(zlib.join("include")).unwrap();
        std::fs::create_dir_all(zlib.join("lib/pkgconfig")).unwrap();
        let mut presence = DependencyPresence::new();
        presence.insert("zlib", &zlib);

        let home = dir.path().join("home");
        let env = BuildEnvironment::new(&config, &presence, &home).unwrap();
        let path = env.get_path_string();
        assert!(path.starts_with(&zlib.join("bin").to_string_lossy().into_owned()));
        assert!(path.ends_with("/usr/bin"));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j3"));
        assert_eq!(env.get("CPPFLAGS"), Some(format!("-I{}", zlib.join("include").display()).as_str()));
        assert!(env.get("PKG_CONFIG_PATH").unwrap().contains("zlib/lib/pkgconfig"));
        assert!(env.get("CMAKE_PREFIX_PATH").unwrap().starts_with(&zlib.to_string_lossy().into_owned()));
        assert_eq!(env.get("HOME"), Some(home.to_string_lossy().as_ref()));
        assert!(env.get("LDFLAGS").is_none());
    }

    #[test]
    fn overrides_layer_on_top() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let env = BuildEnvironment::new(&config, &DependencyPresence::new(), dir.path()).unwrap();
        let vars = env.with_overrides(&BTreeMap::from([("LC_ALL".to_string(), "en_US.UTF-8".to_string())]));
        assert_eq!(vars["LC_ALL"], "en_US.UTF-8");
        assert_eq!(env.get("LC_ALL"), Some("C"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_programs_on_build_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(dir.path().join("prefix"));
        config.base_path = vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")];
        let env = BuildEnvironment::new(&config, &DependencyPresence::new(), dir.path()).unwrap();
        assert!(env.find_program("sh", dir.path()).is_ok());
        assert!(env.find_program("definitely-not-a-real-tool", dir.path()).is_err());
        assert!(env.find_program("./configure", dir.path()).is_err());
    }
}
