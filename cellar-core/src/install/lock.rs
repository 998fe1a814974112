// cellar-core/src/install/lock.rs
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cellar_common::config::Config;
use cellar_common::error::{CellarError, Result};
use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Serializes installs of the same (name, version): an async mutex per key
/// inside this process, plus an exclusive lock file against other processes.
/// Lock files live at `locks/<name>/<version>.lock`.
#[derive(Debug, Clone, Default)]
pub struct InstallLocks {
    keys: Arc<Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>>,
}

/// Held for the duration of one install attempt.
#[derive(Debug)]
pub struct InstallGuard {
    file: File,
    path: PathBuf,
    _local: OwnedMutexGuard<()>,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, config: &Config, name: &str, version: &str) -> Result<InstallGuard> {
        let mutex = {
            let mut keys = self.keys.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(keys.entry((name.to_string(), version.to_string())).or_default())
        };
        let local = mutex.lock_owned().await;

        let locks_dir = config.locks_dir().join(name);
        tokio::fs::create_dir_all(&locks_dir).await?;
        let path = locks_dir.join(format!("{version}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let file = match file.try_lock_exclusive() {
            Ok(()) => file,
            Err(_) => {
                warn!("Waiting for another process installing {name} {version}");
                tokio::task::spawn_blocking(move || file.lock_exclusive().map(|_| file))
                    .await
                    .map_err(|e| CellarError::Generic(format!("JoinError waiting for lock: {e}")))??
            }
        };
        debug!("Acquired install lock {}", path.display());
        Ok(InstallGuard {
            file,
            path,
            _local: local,
        })
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let locks = InstallLocks::new();

        let first = locks.acquire(&config, "nektar", "5.2.0").await.unwrap();
        assert!(config.locks_dir().join("nektar/5.2.0.lock").is_file());

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&config, "nektar", "5.2.0"),
        )
        .await;
        assert!(blocked.is_err());

        // Other versions are independent.
        let _other = locks.acquire(&config, "nektar", "5.3.0").await.unwrap();

        drop(first);
        let _second = tokio::time::timeout(
            Duration::from_secs(5),
            locks.acquire(&config, "nektar", "5.2.0"),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn hyphenated_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let locks = InstallLocks::new();

        let _first = locks.acquire(&config, "foo-1", "2").await.unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(500),
            locks.acquire(&config, "foo", "1-2"),
        )
        .await;
        assert!(second.is_ok_and(|r| r.is_ok()));
        assert!(config.locks_dir().join("foo-1/2.lock").is_file());
        assert!(config.locks_dir().join("foo/1-2.lock").is_file());
    }
}
