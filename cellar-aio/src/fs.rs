// cellar-aio/src/fs.rs
// Filesystem helpers shared by staging, install and verification.
use std::fs;
#[cfg(unix)]
use std::fs::Permissions;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use tracing::{debug, error};
use walkdir::WalkDir;

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("Failed remove dir_all {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        error!("Failed set permissions on {}: {}", path.display(), e);
        CellarError::from(e)
    })
}

#[cfg(not(unix))]
pub fn set_permissions(path: &Path, _mode: u32) -> Result<()> {
    tracing::warn!("Setting permissions not supported on this platform: {}", path.display());
    Ok(())
}

/// Recursively copies `src` into `dst`, preserving symlinks. Entries named
/// in `skip` at the top level (e.g. `.git`) are left out.
pub fn copy_dir_recursive(src: &Path, dst: &Path, skip: &[&str]) -> Result<()> {
    fs::create_dir_all(dst)?;
    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        !(e.depth() == 1 && skip.iter().any(|s| e.file_name() == *s))
    });
    for entry in walker {
        let entry = entry.map_err(|e| CellarError::Generic(format!("walk {}: {e}", src.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| CellarError::Generic(e.to_string()))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
        } else if ft.is_symlink() {
            let link = fs::read_link(entry.path())?;
            create_symlink(&link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Regular files and symlinks under `root`, relative and sorted.
pub fn list_files_relative(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| CellarError::Generic(format!("walk {}: {e}", root.display())))?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    debug!("Creating symlink {} -> {}", link.display(), target.display());
    symlink(target, link).map_err(|e| {
        error!("Failed create symlink {} -> {}: {}", link.display(), target.display(), e);
        CellarError::from(e)
    })
}

#[cfg(not(unix))]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    tracing::warn!(
        "Symlink creation not supported on this platform: {} -> {}",
        link.display(),
        target.display()
    );
    Err(CellarError::Generic("Symlinks not supported on this platform".to_string()))
}

/// Points `link` at `target`, replacing whatever was there via rename so
/// readers never observe a missing link.
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link
        .parent()
        .ok_or_else(|| CellarError::Generic(format!("No parent for {}", link.display())))?;
    fs::create_dir_all(parent)?;
    let file_name = link
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("link");
    let staging = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    let _ = fs::remove_file(&staging);
    create_symlink(target, &staging)?;
    fs::rename(&staging, link).map_err(|e| {
        let _ = fs::remove_file(&staging);
        CellarError::from(e)
    })
}
