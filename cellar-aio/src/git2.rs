// cellar-aio/src/git2.rs
// Head checkouts for VCS sources. All of this blocks; callers go through
// `checkout_head_async`.
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, FetchErrorKind, Result};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, Repository};
use tracing::{debug, error, warn};

fn vcs_error(url: &str, context: &str, e: git2::Error) -> CellarError {
    error!("{} for {}: {}", context, url, e);
    CellarError::fetch(FetchErrorKind::Vcs, url, format!("{context}: {e}"))
}

/// Clones `url` into `checkout_dir`, or fast-forwards an existing checkout,
/// and returns the commit id HEAD ends up on.
pub fn checkout_head(url: &str, branch: Option<&str>, checkout_dir: &Path) -> Result<String> {
    let repo = if checkout_dir.join(".git").exists() {
        let repo = Repository::open(checkout_dir)
            .map_err(|e| vcs_error(url, "Failed to open checkout", e))?;
        update_repo(&repo, url, branch)?;
        repo
    } else {
        debug!("Cloning {} into {}", url, checkout_dir.display());
        if let Some(parent) = checkout_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut builder = RepoBuilder::new();
        if let Some(b) = branch {
            builder.branch(b);
        }
        builder
            .clone(url, checkout_dir)
            .map_err(|e| vcs_error(url, "Failed to clone", e))?
    };
    let head = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(|e| vcs_error(url, "Failed to resolve HEAD", e))?;
    let commit = head.id().to_string();
    debug!("{} is at {}", checkout_dir.display(), commit);
    Ok(commit)
}

pub async fn checkout_head_async(
    url: String,
    branch: Option<String>,
    checkout_dir: PathBuf,
) -> Result<String> {
    tokio::task::spawn_blocking(move || checkout_head(&url, branch.as_deref(), &checkout_dir))
        .await
        .map_err(|e| CellarError::Generic(format!("JoinError in git checkout: {e}")))?
}

/// Fetches from origin and fast-forwards the checked-out branch.
fn update_repo(repo: &Repository, url: &str, branch: Option<&str>) -> Result<()> {
    let branch = match branch {
        Some(b) => b.to_string(),
        None => repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(str::to_string))
            .unwrap_or_else(|| "master".to_string()),
    };
    let local_ref_name = format!("refs/heads/{branch}");
    let remote_ref_name = format!("refs/remotes/origin/{branch}");

    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| vcs_error(url, "Failed to find remote 'origin'", e))?;
    let mut fetch_options = FetchOptions::new();
    debug!("Fetching updates for {}", url);
    remote
        .fetch(
            &["refs/heads/*:refs/remotes/origin/*"],
            Some(&mut fetch_options),
            None,
        )
        .map_err(|e| vcs_error(url, "Failed to fetch updates", e))?;

    let remote_ref = repo
        .find_reference(&remote_ref_name)
        .map_err(|e| vcs_error(url, "Failed to find remote tracking branch", e))?;
    let fetch_commit = repo
        .reference_to_annotated_commit(&remote_ref)
        .map_err(|e| vcs_error(url, "Failed to read fetched commit", e))?;
    let (analysis, _) = repo
        .merge_analysis(&[&fetch_commit])
        .map_err(|e| vcs_error(url, "Failed to analyze merge", e))?;

    if analysis.is_up_to_date() {
        debug!("Checkout of {} already up-to-date.", url);
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        warn!("Checkout of {} diverged from origin/{}", url, branch);
        return Err(CellarError::fetch(
            FetchErrorKind::Vcs,
            url,
            format!("local checkout diverged from origin/{branch}"),
        ));
    }

    let mut local_ref = repo
        .find_reference(&local_ref_name)
        .map_err(|e| vcs_error(url, "Failed to find local branch", e))?;
    local_ref
        .set_target(fetch_commit.id(), &format!("Fast-forward {local_ref_name} to origin"))
        .map_err(|e| vcs_error(url, "Failed to fast-forward", e))?;
    repo.set_head(&local_ref_name)
        .map_err(|e| vcs_error(url, "Failed to set HEAD", e))?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))
        .map_err(|e| vcs_error(url, "Failed to checkout HEAD", e))?;
    debug!("Fast-forwarded {} to {}", local_ref_name, fetch_commit.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn commit_file(repo: &Repository, name: &str, contents: &str, msg: &str) -> git2::Oid {
        let workdir = repo.workdir().unwrap().to_path_buf();
        std::fs::write(workdir.join(name), contents).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("cellar", "cellar@example.org").unwrap();
        let parents: Vec<git2::Commit> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parent_refs)
            .unwrap()
    }

    #[test]
    fn clones_then_fast_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let upstream_dir = dir.path().join("upstream");
        let upstream = Repository::init(&upstream_dir).unwrap();
        let first = commit_file(&upstream, "CMakeLists.txt", "project(x)\n", "initial");

        let url = upstream_dir.to_str().unwrap();
        let checkout = dir.path().join("heads/x");
        let commit = checkout_head(url, None, &checkout).unwrap();
        assert_eq!(commit, first.to_string());
        assert!(checkout.join("CMakeLists.txt").is_file());

        let second = commit_file(&upstream, "README", "x\n", "second");
        let commit = checkout_head(url, None, &checkout).unwrap();
        assert_eq!(commit, second.to_string());
        assert!(checkout.join("README").is_file());
    }

    #[test]
    fn unreachable_url_is_vcs_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = checkout_head(
            dir.path().join("nope").to_str().unwrap(),
            None,
            &dir.path().join("co"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CellarError::Fetch {
                kind: FetchErrorKind::Vcs,
                ..
            }
        ));
    }
}
