// cellar-common/src/cache.rs
// Download cache for source archives, resources and remote patches.

use std::fs;
use std::path::{Path, PathBuf};

use super::error::Result;
use crate::Config;

pub struct Cache {
    downloads_dir: PathBuf,
}

impl Cache {
    pub fn new(config: &Config) -> Result<Self> {
        let downloads_dir = config.downloads_dir();
        if !downloads_dir.exists() {
            fs::create_dir_all(&downloads_dir)?;
        }
        Ok(Self { downloads_dir })
    }

    pub fn get_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Cache location for a download belonging to `owner`
    /// (`<formula>` or `<formula>--<resource>`).
    pub fn download_path(&self, owner: &str, url: &str) -> PathBuf {
        let file_name = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or("download");
        self.downloads_dir.join(format!("{owner}--{file_name}"))
    }

    pub fn clear_file(&self, path: &Path) -> Result<()> {
        if path.starts_with(&self.downloads_dir) && path.exists() {
            tracing::debug!("Removing cached download {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_path_strips_query() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(&Config::with_root(dir.path())).unwrap();
        let p = cache.download_path("nektar", "https://x.org/src/nektar-v5.2.0.tar.bz2?raw=1");
        assert!(p.ends_with("nektar--nektar-v5.2.0.tar.bz2"));
        let p = cache.download_path("nektar--boost", "https://x.org/");
        assert!(p.ends_with("nektar--boost--download"));
    }
}
