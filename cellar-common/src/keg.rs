// cellar-common/src/keg.rs
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::config::Config;
use super::error::Result;
use super::model::artifact::{InstallReceipt, INCOMPLETE_MARKER, RECEIPT_FILENAME};

/// Represents information about an installed package (Keg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledKeg {
    pub name: String,
    pub version_str: String,
    pub path: PathBuf,
}

impl InstalledKeg {
    pub fn receipt(&self) -> Result<InstallReceipt> {
        InstallReceipt::read(&self.path)
    }
}

/// A keg counts as installed once its receipt exists and the in-progress
/// marker is gone.
pub fn is_complete_keg(path: &Path) -> bool {
    path.is_dir() && path.join(RECEIPT_FILENAME).is_file() && !path.join(INCOMPLETE_MARKER).exists()
}

/// Orders version directory names; `5.10.0` sorts after `5.9.1`, revisions
/// (`5.2.0_1`) after their base.
pub fn compare_version_strs(a: &str, b: &str) -> Ordering {
    fn split(v: &str) -> (Option<semver::Version>, u32) {
        let (base, revision) = match v.rsplit_once('_') {
            Some((base, rev)) => match rev.parse::<u32>() {
                Ok(r) => (base, r),
                Err(_) => (v, 0),
            },
            None => (v, 0),
        };
        let mut parts: Vec<&str> = base.split('.').collect();
        while parts.len() < 3 {
            parts.push("0");
        }
        (semver::Version::parse(&parts.join(".")).ok(), revision)
    }
    match (split(a), split(b)) {
        ((Some(va), ra), (Some(vb), rb)) => va.cmp(&vb).then(ra.cmp(&rb)),
        _ => a.cmp(b),
    }
}

/// Queries installed packages in the Cellar.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn cellar_path(&self) -> PathBuf {
        self.config.cellar_dir()
    }

    pub fn get_opt_path(&self, name: &str) -> PathBuf {
        self.config.formula_opt_path(name)
    }

    pub fn get_keg_path(&self, name: &str, version_str: &str) -> PathBuf {
        self.config.formula_keg_path(name, version_str)
    }

    /// Complete kegs of one formula, oldest first.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<InstalledKeg>> {
        let formula_dir = self.config.formula_cellar_dir(name);
        if !formula_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut kegs = Vec::new();
        for entry in fs::read_dir(&formula_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(
                        "[KEG_REGISTRY:{}] Error reading entry in '{}': {}. Skipping.",
                        name,
                        formula_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            let Some(version) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            // Dot entries are kegs set aside during a forced rebuild.
            if version.starts_with('.') {
                continue;
            }
            if !is_complete_keg(&path) {
                debug!(
                    "[KEG_REGISTRY:{}] Ignoring incomplete keg {}",
                    name,
                    path.display()
                );
                continue;
            }
            kegs.push(InstalledKeg {
                name: name.to_string(),
                version_str: version,
                path,
            });
        }
        kegs.sort_by(|a, b| compare_version_strs(&a.version_str, &b.version_str));
        Ok(kegs)
    }

    /// The newest complete keg, if any.
    pub fn get_installed_keg(&self, name: &str) -> Result<Option<InstalledKeg>> {
        let latest = self.installed_versions(name)?.pop();
        if let Some(keg) = &latest {
            debug!(
                "[KEG_REGISTRY:{}] latest keg found: path={}, version_str={}",
                name,
                keg.path.display(),
                keg.version_str
            );
        }
        Ok(latest)
    }

    pub fn get_keg(&self, name: &str, version_str: &str) -> Option<InstalledKeg> {
        let path = self.get_keg_path(name, version_str);
        is_complete_keg(&path).then(|| InstalledKeg {
            name: name.to_string(),
            version_str: version_str.to_string(),
            path,
        })
    }

    pub fn list_installed_kegs(&self) -> Result<Vec<InstalledKeg>> {
        let cellar_dir = self.cellar_path();
        if !cellar_dir.is_dir() {
            debug!("[KEG_REGISTRY] Cellar directory NOT FOUND. Returning empty list.");
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&cellar_dir)? {
            let path = entry?.path();
            match path.file_name().and_then(|n| n.to_str()) {
                Some(n) if path.is_dir() && !n.starts_with('.') => names.push(n.to_string()),
                _ => {}
            }
        }
        names.sort();
        let mut kegs = Vec::new();
        for name in names {
            kegs.extend(self.installed_versions(&name)?);
        }
        debug!(
            "[KEG_REGISTRY] Found {} total installed keg versions.",
            kegs.len()
        );
        Ok(kegs)
    }
}
