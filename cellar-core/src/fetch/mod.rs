// cellar-core/src/fetch/mod.rs
//! Retrieval of everything a build needs before any tree is staged: the main
//! source (archive or VCS head), auxiliary resources and remote patches.

use std::path::PathBuf;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::{CellarError, Result};
use cellar_common::model::formula::{ResourceSpec, SourceSpec};
use cellar_common::model::{BuildSelections, Formula};
use cellar_common::pipeline::PipelineEvent;
use cellar_net::{fetch_to_cache, validate_vcs_url};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

pub mod stage;

pub use stage::{stage_sources, StagedSource};

/// The main source after retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedMain {
    Archive {
        path: PathBuf,
        url: String,
        sha256: String,
    },
    Head {
        checkout: PathBuf,
        url: String,
        commit: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchPayload {
    pub name: String,
    pub diff: String,
    pub strip: usize,
}

#[derive(Debug, Clone)]
pub struct FetchedSources {
    pub main: FetchedMain,
    pub resources: Vec<(ResourceSpec, PathBuf)>,
    pub patches: Vec<PatchPayload>,
}

/// Downloads into the shared cache on behalf of one job.
pub struct Fetcher<'a> {
    config: &'a Config,
    cache: &'a Cache,
    target_id: String,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> Fetcher<'a> {
    pub fn new(config: &'a Config, cache: &'a Cache, target_id: impl Into<String>) -> Self {
        Self {
            config,
            cache,
            target_id: target_id.into(),
            event_tx: None,
            cancel: None,
        }
    }

    pub fn with_events(mut self, event_tx: broadcast::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn with_cancel(mut self, cancel: Option<watch::Receiver<bool>>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetches the main source, resources and remote patches. Every archive
    /// is verified before this returns; nothing is extracted.
    pub async fn fetch_all(&self, formula: &Formula, selections: &BuildSelections) -> Result<FetchedSources> {
        let main = match formula.source_for(selections)? {
            SourceSpec::Archive(archive) => {
                let path = self
                    .download(&formula.name, &archive.url, &archive.sha256, &archive.mirrors)
                    .await?;
                FetchedMain::Archive {
                    path,
                    url: archive.url,
                    sha256: archive.sha256.to_ascii_lowercase(),
                }
            }
            SourceSpec::Head(head) => {
                if !self.config.allow_head {
                    return Err(CellarError::Config(format!(
                        "{} would build from its VCS head; set CELLAR_ALLOW_HEAD=1 to allow non-reproducible builds",
                        formula.name
                    )));
                }
                validate_vcs_url(&head.url)?;
                let checkout = self.config.head_cache_dir().join(&formula.name);
                tokio::fs::create_dir_all(self.config.head_cache_dir()).await?;
                self.emit(PipelineEvent::DownloadStarted {
                    target_id: self.target_id.clone(),
                    url: head.url.clone(),
                });
                info!("[{}] Checking out {}", self.target_id, head.url);
                let commit = self
                    .cancellable(cellar_aio::checkout_head_async(
                        head.url.clone(),
                        head.branch.clone(),
                        checkout.clone(),
                    ))
                    .await?;
                self.emit(PipelineEvent::DownloadFinished {
                    target_id: self.target_id.clone(),
                    url: head.url.clone(),
                    size_bytes: 0,
                });
                FetchedMain::Head {
                    checkout,
                    url: head.url,
                    commit,
                }
            }
        };

        let mut resources = Vec::with_capacity(formula.resources.len());
        for res in &formula.resources {
            let owner = format!("{}--{}", formula.name, res.name);
            let path = self.download(&owner, &res.url, &res.sha256, &[]).await?;
            resources.push((res.clone(), path));
        }

        let mut patches = Vec::with_capacity(formula.patches.len());
        for (i, patch) in formula.patches.iter().enumerate() {
            let name = patch.display_name(i);
            let diff = match (&patch.diff, &patch.url, &patch.sha256) {
                (Some(diff), _, _) => diff.clone(),
                (None, Some(url), Some(sha)) => {
                    let owner = format!("{}--patch", formula.name);
                    let path = self.download(&owner, url, sha, &[]).await?;
                    tokio::fs::read_to_string(&path).await?
                }
                _ => {
                    return Err(CellarError::ValidationError(format!(
                        "patch '{name}' has neither a diff nor a verifiable url"
                    )))
                }
            };
            patches.push(PatchPayload {
                name,
                diff,
                strip: patch.strip,
            });
        }

        debug!(
            "[{}] Fetched main source, {} resources, {} patches",
            self.target_id,
            resources.len(),
            patches.len()
        );
        Ok(FetchedSources {
            main,
            resources,
            patches,
        })
    }

    async fn download(&self, owner: &str, url: &str, sha256: &str, mirrors: &[String]) -> Result<PathBuf> {
        self.emit(PipelineEvent::DownloadStarted {
            target_id: self.target_id.clone(),
            url: url.to_string(),
        });
        let downloaded = self
            .cancellable(fetch_to_cache(owner, url, sha256, mirrors, self.config, self.cache))
            .await?;
        self.emit(PipelineEvent::DownloadFinished {
            target_id: self.target_id.clone(),
            url: downloaded.url.clone().unwrap_or_else(|| url.to_string()),
            size_bytes: downloaded.size_bytes,
        });
        Ok(downloaded.path)
    }

    async fn cancellable<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            res = fut => res,
            _ = cellar_aio::process::cancelled(self.cancel.clone()) => {
                Err(CellarError::Cancelled(format!("fetch for {}", self.target_id)))
            }
        }
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
