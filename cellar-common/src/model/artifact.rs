// cellar-common/src/model/artifact.rs
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flags::BuildFlagSet;
use crate::error::Result;

pub const RECEIPT_FILENAME: &str = "INSTALL_RECEIPT.json";
/// Present in a keg while it is being populated; removed on success.
pub const INCOMPLETE_MARKER: &str = ".cellar_incomplete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Archive,
    Head,
}

/// Where the built tree came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProvenance {
    pub kind: SourceKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Commit a head build was made from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub reproducible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    NotRun,
    Passed,
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDependency {
    pub name: String,
    pub path: PathBuf,
}

/// Metadata stored alongside an installed keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub source: SourceProvenance,
    pub flags: BuildFlagSet,
    pub flags_fingerprint: String,
    #[serde(default)]
    pub with: Vec<String>,
    #[serde(default)]
    pub without: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<ReceiptDependency>,
    #[serde(default)]
    pub bindings_installed: bool,
    #[serde(default)]
    pub verification: VerificationStatus,
    /// Files under the keg, relative to it.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl InstallReceipt {
    pub fn read(keg_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(keg_path.join(RECEIPT_FILENAME))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write(&self, keg_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(keg_path.join(RECEIPT_FILENAME), json)?;
        Ok(())
    }
}

/// A completed install: the keg and its receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    pub keg_path: PathBuf,
    pub opt_path: PathBuf,
    pub receipt: InstallReceipt,
}
