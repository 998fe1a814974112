// cellar-common/src/model/flags.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CellarError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFlag {
    pub key: String,
    pub value: String,
}

/// Ordered configure flags. Order follows the formula's rule order so the
/// rendered command line is stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildFlagSet {
    flags: Vec<BuildFlag>,
}

impl BuildFlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a flag. Re-adding an identical flag is a no-op; a different value
    /// for an existing key is an error.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.flags.iter().find(|f| f.key == key) {
            if existing.value == value {
                return Ok(());
            }
            return Err(CellarError::ValidationError(format!(
                "flag {key} set to both '{}' and '{value}'",
                existing.value
            )));
        }
        self.flags.push(BuildFlag { key, value });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildFlag> {
        self.flags.iter()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// `-DKEY=VALUE` arguments for cmake.
    pub fn to_cmake_args(&self) -> Vec<String> {
        self.flags
            .iter()
            .map(|f| format!("-D{}={}", f.key, f.value))
            .collect()
    }

    /// Stable digest of the flag set, recorded in receipts to tell builds apart.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for f in &self.flags {
            hasher.update(f.key.as_bytes());
            hasher.update(b"=");
            hasher.update(f.value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Which declared dependencies are present for a build, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyPresence {
    present: BTreeMap<String, PathBuf>,
}

impl DependencyPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, opt_path: impl Into<PathBuf>) {
        self.present.insert(name.into(), opt_path.into());
    }

    pub fn is_present(&self, name: &str) -> bool {
        self.present.contains_key(name)
    }

    pub fn opt_path(&self, name: &str) -> Option<&Path> {
        self.present.get(name).map(PathBuf::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathBuf)> {
        self.present.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.present.keys().map(String::as_str)
    }
}
