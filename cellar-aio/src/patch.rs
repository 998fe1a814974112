// cellar-aio/src/patch.rs
//! Unified diff application.
//!
//! A diff may touch several files. Every file's hunks are checked against
//! the tree before anything is written, so a mismatch leaves the tree as it
//! was.

use std::path::{Component, Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use tracing::debug;

const DEV_NULL: &str = "/dev/null";

#[derive(Debug)]
struct FilePatch {
    old_path: String,
    new_path: String,
    /// Header plus hunks, in the shape `diffy` parses.
    body: String,
}

enum Change {
    Write(PathBuf, String),
    Delete(PathBuf),
}

/// Applies `diff` under `root`, stripping `strip` leading components from the
/// file names in the diff headers (`patch -p<strip>`). Returns the paths
/// touched, relative to `root`.
pub fn apply_unified_diff(root: &Path, diff: &str, strip: usize, patch_name: &str) -> Result<Vec<PathBuf>> {
    let fail = |message: String| CellarError::PatchApply {
        patch: patch_name.to_string(),
        message,
    };

    let file_patches = split_file_patches(diff);
    if file_patches.is_empty() {
        return Err(fail("no file headers found".to_string()));
    }

    let mut changes = Vec::new();
    for fp in &file_patches {
        let patch = diffy::Patch::from_str(&fp.body)
            .map_err(|e| fail(format!("malformed diff for {}: {e}", fp.new_path)))?;

        if fp.new_path == DEV_NULL {
            let rel = strip_path(&fp.old_path, strip).ok_or_else(|| fail(bad_path(&fp.old_path)))?;
            if !root.join(&rel).is_file() {
                return Err(fail(format!("{} does not exist", rel.display())));
            }
            changes.push(Change::Delete(rel));
            continue;
        }

        let rel = strip_path(&fp.new_path, strip).ok_or_else(|| fail(bad_path(&fp.new_path)))?;
        let base = if fp.old_path == DEV_NULL {
            String::new()
        } else {
            let old_rel = strip_path(&fp.old_path, strip).ok_or_else(|| fail(bad_path(&fp.old_path)))?;
            std::fs::read_to_string(root.join(&old_rel))
                .map_err(|e| fail(format!("cannot read {}: {e}", old_rel.display())))?
        };
        let patched = diffy::apply(&base, &patch)
            .map_err(|e| fail(format!("{}: {e}", rel.display())))?;
        changes.push(Change::Write(rel, patched));
    }

    let mut touched = Vec::new();
    for change in changes {
        match change {
            Change::Write(rel, contents) => {
                let target = root.join(&rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                debug!("Patching {}", target.display());
                std::fs::write(&target, contents)?;
                touched.push(rel);
            }
            Change::Delete(rel) => {
                debug!("Removing {} per patch", rel.display());
                std::fs::remove_file(root.join(&rel))?;
                touched.push(rel);
            }
        }
    }
    Ok(touched)
}

fn bad_path(p: &str) -> String {
    format!("cannot strip path '{p}'")
}

/// File name from a `---`/`+++` header: drops the marker and any timestamp.
fn header_path(line: &str) -> String {
    let rest = &line[4..];
    rest.split('\t').next().unwrap_or(rest).trim().to_string()
}

fn strip_path(p: &str, strip: usize) -> Option<PathBuf> {
    let rel: PathBuf = Path::new(p)
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::CurDir))
        .skip(strip)
        .collect();
    let safe = rel.components().all(|c| matches!(c, Component::Normal(_)));
    (safe && rel.components().next().is_some()).then_some(rel)
}

fn split_file_patches(diff: &str) -> Vec<FilePatch> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ ")) {
            let old_path = header_path(line);
            let new_path = header_path(lines[i + 1]);
            let mut body = format!("--- {old_path}\n+++ {new_path}\n");
            i += 2;
            let mut in_hunk = false;
            while i < lines.len() {
                let l = lines[i];
                if l.starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ ")) {
                    break;
                }
                if l.starts_with("@@") {
                    in_hunk = true;
                    body.push_str(l);
                    body.push('\n');
                } else if in_hunk && (l.starts_with([' ', '+', '-', '\\'])) {
                    body.push_str(l);
                    body.push('\n');
                } else if in_hunk && l.is_empty() {
                    // Editors drop the trailing space of blank context lines.
                    body.push_str(" \n");
                } else {
                    in_hunk = false;
                }
                i += 1;
            }
            patches.push(FilePatch {
                old_path,
                new_path,
                body,
            });
        } else {
            i += 1;
        }
    }
    patches
}
