use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Why a source or resource could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    ChecksumMismatch,
    UnsupportedProtocol,
    Timeout,
    Vcs,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network failure",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::UnsupportedProtocol => "unsupported protocol",
            Self::Timeout => "timed out",
            Self::Vcs => "vcs checkout failed",
        };
        f.write_str(s)
    }
}

/// The per-package install stages. `Failed` is represented by
/// [`CellarError::InstallFailure`] carrying the stage it happened in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    Fetching,
    Resolving,
    Configuring,
    Building,
    Installing,
    Verifying,
    Installed,
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetching => "fetching",
            Self::Resolving => "resolving",
            Self::Configuring => "configuring",
            Self::Building => "building",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::Installed => "installed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
pub enum CellarError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("TOML Parsing Error: {0}")]
    Toml(#[from] Arc<toml::de::Error>),

    #[error("Git Error: {0}")]
    Git(#[from] Arc<git2::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Parsing Error in {0}: {1}")]
    ParseError(&'static str, String),

    #[error("Validation Error: {0}")]
    ValidationError(String),

    #[error("Fetch Error ({kind}) for '{url}': {message}")]
    Fetch {
        kind: FetchErrorKind,
        url: String,
        message: String,
    },

    #[error("Unresolved dependency '{dependency}' required by '{required_by}'")]
    UnresolvedDependency {
        dependency: String,
        required_by: String,
    },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Patch '{patch}' does not apply cleanly: {message}")]
    PatchApply { patch: String, message: String },

    #[error("Build step '{step}' failed: {status}")]
    BuildStepFailure { step: String, status: String },

    #[error("Installation verification failed for {name} {version}: {message}")]
    InstallationVerification {
        name: String,
        version: String,
        message: String,
    },

    #[error("{name} failed while {stage}: {source}")]
    InstallFailure {
        name: String,
        stage: InstallStage,
        #[source]
        source: Box<CellarError>,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl From<std::io::Error> for CellarError {
    fn from(err: std::io::Error) -> Self {
        CellarError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for CellarError {
    fn from(err: reqwest::Error) -> Self {
        CellarError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for CellarError {
    fn from(err: serde_json::Error) -> Self {
        CellarError::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for CellarError {
    fn from(err: toml::de::Error) -> Self {
        CellarError::Toml(Arc::new(err))
    }
}

impl From<git2::Error> for CellarError {
    fn from(err: git2::Error) -> Self {
        CellarError::Git(Arc::new(err))
    }
}

impl CellarError {
    pub fn fetch(kind: FetchErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        CellarError::Fetch {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn in_stage(self, name: &str, stage: InstallStage) -> Self {
        match self {
            // Never wrap twice; the innermost stage is the one that failed.
            e @ CellarError::InstallFailure { .. } => e,
            other => CellarError::InstallFailure {
                name: name.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The error with any stage wrapper removed.
    pub fn root(&self) -> &CellarError {
        match self {
            CellarError::InstallFailure { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn failed_stage(&self) -> Option<InstallStage> {
        match self {
            CellarError::InstallFailure { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Process exit code distinguishing the failure classes.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            CellarError::Fetch { .. } => 2,
            CellarError::UnresolvedDependency { .. } | CellarError::CyclicDependency { .. } => 3,
            CellarError::PatchApply { .. } => 4,
            CellarError::BuildStepFailure { .. } => 5,
            CellarError::InstallationVerification { .. } => 6,
            CellarError::Cancelled(_) => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CellarError>;
