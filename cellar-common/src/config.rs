// cellar-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use super::error::{CellarError, Result};

// Fallback if CELLAR_PREFIX is not set or is empty.
const DEFAULT_FALLBACK_CELLAR_ROOT: &str = "/opt/cellar";
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DEFAULT_WORKERS: usize = 6;

/// What to do with a keg whose post-install verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyFailurePolicy {
    /// Keep the keg, mark its receipt as failed verification.
    #[default]
    Keep,
    /// Remove the keg entirely.
    Rollback,
}

impl FromStr for VerifyFailurePolicy {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep" => Ok(Self::Keep),
            "rollback" => Ok(Self::Rollback),
            other => Err(CellarError::Config(format!(
                "Unknown verify failure policy '{other}' (expected keep|rollback)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cellar_root: PathBuf,
    pub formula_dir: PathBuf,
    /// Number of packages built concurrently.
    pub jobs: usize,
    /// Parallelism passed to make (`-j`).
    pub make_jobs: usize,
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
    /// `None` means build steps may run forever.
    pub build_timeout: Option<Duration>,
    pub allow_head: bool,
    pub verify_failure_policy: VerifyFailurePolicy,
    pub keep_failed_builds: bool,
    /// PATH snapshot used as the tail of every build environment's PATH.
    pub base_path: Vec<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading cellar configuration");

        let root_str = env::var("CELLAR_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!(
                    "CELLAR_PREFIX environment variable not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_CELLAR_ROOT
                );
                DEFAULT_FALLBACK_CELLAR_ROOT.to_string()
            });
        let mut config = Self::with_root(PathBuf::from(&root_str));
        debug!("Effective CELLAR_PREFIX set to: {}", config.cellar_root.display());

        if let Some(dir) = non_empty_var("CELLAR_FORMULA_DIR") {
            config.formula_dir = PathBuf::from(dir);
        }
        if let Some(v) = non_empty_var("CELLAR_JOBS") {
            config.jobs = parse_count("CELLAR_JOBS", &v)?;
        }
        if let Some(v) = non_empty_var("CELLAR_MAKE_JOBS") {
            config.make_jobs = parse_count("CELLAR_MAKE_JOBS", &v)?;
        }
        if let Some(v) = non_empty_var("CELLAR_FETCH_TIMEOUT") {
            config.fetch_timeout = parse_duration("CELLAR_FETCH_TIMEOUT", &v)?;
        }
        if let Some(v) = non_empty_var("CELLAR_CONNECT_TIMEOUT") {
            config.connect_timeout = parse_duration("CELLAR_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = non_empty_var("CELLAR_BUILD_TIMEOUT") {
            config.build_timeout = Some(parse_duration("CELLAR_BUILD_TIMEOUT", &v)?);
        }
        config.allow_head = env::var("CELLAR_ALLOW_HEAD").is_ok_and(|v| v == "1");
        config.keep_failed_builds = env::var("CELLAR_KEEP_FAILED_BUILDS").is_ok_and(|v| v == "1");
        if let Some(v) = non_empty_var("CELLAR_VERIFY_FAILURE") {
            config.verify_failure_policy = v.parse()?;
        }
        if let Some(path) = env::var_os("PATH") {
            config.base_path = env::split_paths(&path).collect();
        }

        debug!("Configuration loaded successfully.");
        Ok(config)
    }

    /// A configuration rooted at `root` with defaults only; reads no environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let cellar_root = root.into();
        let workers = std::cmp::max(1, num_cpus::get_physical().saturating_sub(1))
            .min(MAX_DEFAULT_WORKERS);
        Self {
            formula_dir: cellar_root.join("Formula"),
            cellar_root,
            jobs: workers,
            make_jobs: num_cpus::get(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            build_timeout: None,
            allow_head: false,
            verify_failure_policy: VerifyFailurePolicy::Keep,
            keep_failed_builds: false,
            base_path: vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")],
        }
    }

    pub fn cellar_root(&self) -> &Path {
        &self.cellar_root
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.cellar_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.cellar_root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cellar_root.join("cellar_cache")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    /// Persistent checkouts of VCS head sources.
    pub fn head_cache_dir(&self) -> PathBuf {
        self.cache_dir().join("heads")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.cellar_root.join("cellar_logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.cellar_root.join("tmp")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.cellar_dir().join(".locks")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    /// Root of one install attempt's scratch space (staging + build dirs).
    pub fn attempt_dir(&self, formula_name: &str, version_str: &str, attempt_id: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{formula_name}-{version_str}-{attempt_id}"))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(CellarError::Config(format!(
            "{key} must be a positive integer, got '{value}'"
        ))),
    }
}

/// Accepts plain seconds ("90") or humantime ("15m", "2h 30m").
fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value)
        .map_err(|e| CellarError::Config(format!("{key}: invalid duration '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_root() {
        let config = Config::with_root("/tmp/cellar-root");
        assert_eq!(
            config.formula_keg_path("nektar", "5.2.0"),
            PathBuf::from("/tmp/cellar-root/Cellar/nektar/5.2.0")
        );
        assert_eq!(
            config.formula_opt_path("nektar"),
            PathBuf::from("/tmp/cellar-root/opt/nektar")
        );
        assert_eq!(config.formula_dir, PathBuf::from("/tmp/cellar-root/Formula"));
        assert!(config
            .attempt_dir("nektar", "5.2.0", "abc")
            .ends_with("tmp/nektar-5.2.0-abc"));
    }

    #[test]
    fn durations_accept_seconds_and_humantime() {
        assert_eq!(parse_duration("K", "90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("K", "2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("K", "soon").is_err());
    }

    #[test]
    fn verify_policy_parses() {
        assert_eq!(
            "Rollback".parse::<VerifyFailurePolicy>().unwrap(),
            VerifyFailurePolicy::Rollback
        );
        assert!("maybe".parse::<VerifyFailurePolicy>().is_err());
    }

    #[test]
    fn counts_must_be_positive() {
        assert_eq!(parse_count("K", "4").unwrap(), 4);
        assert!(parse_count("K", "0").is_err());
        assert!(parse_count("K", "x").is_err());
    }
}
