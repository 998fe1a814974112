// cellar-core/src/fetch/stage.rs
use std::path::{Component, Path, PathBuf};

use cellar_aio::{apply_unified_diff, extract_archive_async, source_root};
use cellar_common::error::{CellarError, Result};
use cellar_common::model::artifact::{SourceKind, SourceProvenance};
use cellar_common::model::formula::ResourceSpec;
use tracing::debug;

use super::{FetchedMain, FetchedSources};

/// A patched source tree inside one attempt directory.
#[derive(Debug, Clone)]
pub struct StagedSource {
    pub attempt_dir: PathBuf,
    /// Top of the source tree configure runs against.
    pub root: PathBuf,
    pub provenance: SourceProvenance,
    pub patches_applied: Vec<String>,
}

impl StagedSource {
    pub fn is_reproducible(&self) -> bool {
        self.provenance.reproducible
    }
}

/// Lays out `fetched` under `attempt_dir/src`: extracts or copies the main
/// source, places resources, then applies patches in declaration order.
/// Only `attempt_dir` is written to.
pub async fn stage_sources(fetched: &FetchedSources, attempt_dir: &Path) -> Result<StagedSource> {
    let src_dir = attempt_dir.join("src");
    tokio::fs::create_dir_all(&src_dir).await?;

    let (root, provenance) = match &fetched.main {
        FetchedMain::Archive { path, url, sha256 } => {
            debug!("Extracting {} into {}", path.display(), src_dir.display());
            extract_archive_async(path, &src_dir, 0).await?;
            let root = source_root(&src_dir)?;
            let provenance = SourceProvenance {
                kind: SourceKind::Archive,
                url: url.clone(),
                sha256: Some(sha256.clone()),
                commit: None,
                reproducible: true,
            };
            (root, provenance)
        }
        FetchedMain::Head {
            checkout,
            url,
            commit,
        } => {
            let name = checkout
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "head".to_string());
            let root = src_dir.join(name);
            let from = checkout.clone();
            let to = root.clone();
            tokio::task::spawn_blocking(move || cellar_aio::fs::copy_dir_recursive(&from, &to, &[".git"]))
                .await
                .map_err(|e| CellarError::Generic(format!("JoinError copying checkout: {e}")))??;
            let provenance = SourceProvenance {
                kind: SourceKind::Head,
                url: url.clone(),
                sha256: None,
                commit: Some(commit.clone()),
                reproducible: false,
            };
            (root, provenance)
        }
    };

    for (spec, path) in &fetched.resources {
        stage_resource(spec, path, &root).await?;
    }

    let mut patches_applied = Vec::with_capacity(fetched.patches.len());
    for patch in &fetched.patches {
        let root = root.clone();
        let p = patch.clone();
        let touched = tokio::task::spawn_blocking(move || apply_unified_diff(&root, &p.diff, p.strip, &p.name))
            .await
            .map_err(|e| CellarError::Generic(format!("JoinError applying patch: {e}")))??;
        debug!("Applied patch {} ({} files)", patch.name, touched.len());
        patches_applied.push(patch.name.clone());
    }

    Ok(StagedSource {
        attempt_dir: attempt_dir.to_path_buf(),
        root,
        provenance,
        patches_applied,
    })
}

async fn stage_resource(spec: &ResourceSpec, cached: &Path, root: &Path) -> Result<()> {
    let target_dir = match &spec.target {
        Some(target) => {
            let rel = Path::new(target);
            if !rel.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
                return Err(CellarError::ValidationError(format!(
                    "resource '{}' target '{}' leaves the source tree",
                    spec.name, target
                )));
            }
            root.join(rel)
        }
        None => root.to_path_buf(),
    };
    tokio::fs::create_dir_all(&target_dir).await?;

    if spec.extract {
        debug!("Extracting resource {} into {}", spec.name, target_dir.display());
        extract_archive_async(cached, &target_dir, 0).await
    } else {
        let file_name = spec
            .url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|s| !s.is_empty())
            .unwrap_or(&spec.name);
        let dest = target_dir.join(file_name);
        debug!("Copying resource {} to {}", spec.name, dest.display());
        tokio::fs::copy(cached, &dest).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::PatchPayload;
    use crate::test_support::write_tar_gz;

    const FIX: &str = "--- a/Makefile\n+++ b/Makefile\n@@ -1,2 +1,2 @@\n all:\n-\techo old\n+\techo new\n";

    fn fetched(dir: &Path, diff: &str) -> FetchedSources {
        let tarball = dir.join("toy-1.0.tar.gz");
        write_tar_gz(&tarball, "toy-1.0", &[("Makefile", "all:\n\techo old\n")]);
        let third = dir.join("boost_1_74_0.tar.bz2");
        std::fs::write(&third, b"verbatim").unwrap();
        FetchedSources {
            main: FetchedMain::Archive {
                path: tarball,
                url: "https://example.org/toy-1.0.tar.gz".into(),
                sha256: "ab".repeat(32),
            },
            resources: vec![(
                ResourceSpec {
                    name: "boost".into(),
                    url: "https://example.org/dl/boost_1_74_0.tar.bz2".into(),
                    sha256: "cd".repeat(32),
                    target: Some("ThirdParty".into()),
                    extract: false,
                },
                third,
            )],
            patches: vec![PatchPayload {
                name: "fix-echo".into(),
                diff: diff.into(),
                strip: 1,
            }],
        }
    }

    #[tokio::test]
    async fn stages_patches_and_resources() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = dir.path().join("tmp/toy-1.0-abc");
        let staged = stage_sources(&fetched(dir.path(), FIX), &attempt).await.unwrap();
        assert_eq!(staged.root, attempt.join("src/toy-1.0"));
        assert!(staged.is_reproducible());
        assert_eq!(staged.patches_applied, vec!["fix-echo"]);
        let makefile = std::fs::read_to_string(staged.root.join("Makefile")).unwrap();
        assert!(makefile.contains("echo new"));
        assert_eq!(
            std::fs::read(staged.root.join("ThirdParty/boost_1_74_0.tar.bz2")).unwrap(),
            b"verbatim"
        );
    }

    #[tokio::test]
    async fn patch_mismatch_fails_staging() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = dir.path().join("tmp/toy-1.0-def");
        let drifted = FIX.replace("echo old", "echo older");
        let err = stage_sources(&fetched(dir.path(), &drifted), &attempt)
            .await
            .unwrap_err();
        assert!(matches!(err, CellarError::PatchApply { .. }));
    }

    #[tokio::test]
    async fn resource_target_must_stay_inside() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = fetched(dir.path(), FIX);
        f.resources[0].0.target = Some("../escape".into());
        let err = stage_sources(&f, &dir.path().join("attempt")).await.unwrap_err();
        assert!(matches!(err, CellarError::ValidationError(_)));
    }
}
