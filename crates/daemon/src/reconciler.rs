//! Converges local working copies to their upstream tracking remote.
//!
//! `sync` talks to the network; `check_state` never does and reports relative
//! to whatever was fetched last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::process::{run_checked, CommandError};

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("remote {remote:?} is not configured in {repo}")]
    UpstreamNotConfigured { remote: String, repo: String },
    #[error("{repo} has a detached HEAD; nothing to sync")]
    DetachedHead { repo: String },
    #[error("upstream branch {reference} does not exist after fetch")]
    MissingUpstreamBranch { reference: String },
    #[error("fetching {remote} timed out after {after:?}")]
    FetchTimeout { remote: String, after: Duration },
}

/// How `sync` converged the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    UpToDate,
    FastForward,
    HardReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub branch: String,
    pub strategy: SyncStrategy,
    pub head: String,
}

/// Read-only view of a working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoState {
    pub branch: String,
    pub has_local_changes: bool,
    /// Relative to the last fetch, not the live remote.
    pub commits_behind: u32,
    pub last_fetched: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RepoReconciler: Send + Sync {
    /// Fetch the upstream and converge the current branch onto it.
    async fn sync(&self, repo: &Path) -> Result<SyncReport, GitError>;

    /// Report branch, local modifications and commits behind. No network access.
    async fn check_state(&self, repo: &Path) -> Result<RepoState, GitError>;
}

#[derive(Debug, Clone)]
pub struct GitReconciler {
    upstream_remote: String,
    fetch_timeout: Duration,
}

impl GitReconciler {
    pub fn new(upstream_remote: impl Into<String>, fetch_timeout: Duration) -> Self {
        Self {
            upstream_remote: upstream_remote.into(),
            fetch_timeout,
        }
    }

    fn tracking_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.upstream_remote, branch)
    }

    async fn ensure_remote(&self, repo: &Path) -> Result<(), GitError> {
        match git(repo, &["remote", "get-url", &self.upstream_remote]).await {
            Ok(_) => Ok(()),
            Err(CommandError::Failed { .. }) => Err(GitError::UpstreamNotConfigured {
                remote: self.upstream_remote.clone(),
                repo: repo.display().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, repo: &Path) -> Result<(), GitError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(repo)
            .args(["fetch", "--prune", &self.upstream_remote])
            .kill_on_drop(true);
        match tokio::time::timeout(self.fetch_timeout, run_checked(cmd)).await {
            Ok(res) => {
                res?;
                Ok(())
            }
            Err(_) => Err(GitError::FetchTimeout {
                remote: self.upstream_remote.clone(),
                after: self.fetch_timeout,
            }),
        }
    }

    async fn hard_reset(&self, repo: &Path, target: &str) -> Result<(), GitError> {
        git(repo, &["reset", "--hard", target]).await?;
        git(repo, &["clean", "-fd"]).await?;
        Ok(())
    }
}

#[async_trait]
impl RepoReconciler for GitReconciler {
    async fn sync(&self, repo: &Path) -> Result<SyncReport, GitError> {
        let branch = current_branch(repo).await?;
        if branch == "HEAD" {
            return Err(GitError::DetachedHead {
                repo: repo.display().to_string(),
            });
        }

        self.ensure_remote(repo).await?;
        self.fetch(repo).await?;

        let target = self.tracking_ref(&branch);
        let target_rev = resolve(repo, &target)
            .await?
            .ok_or_else(|| GitError::MissingUpstreamBranch {
                reference: target.clone(),
            })?;

        let strategy = if has_local_changes(repo).await? {
            info!(repo = %repo.display(), %branch, "local changes present; resetting to upstream");
            self.hard_reset(repo, &target).await?;
            SyncStrategy::HardReset
        } else if git(repo, &["rev-parse", "HEAD"]).await? == target_rev {
            SyncStrategy::UpToDate
        } else {
            match git(repo, &["merge", "--ff-only", &target]).await {
                Ok(_) => SyncStrategy::FastForward,
                Err(e) => {
                    warn!(
                        repo = %repo.display(),
                        %branch,
                        error = %e,
                        "fast-forward not possible; resetting to upstream"
                    );
                    self.hard_reset(repo, &target).await?;
                    SyncStrategy::HardReset
                }
            }
        };

        let head = git(repo, &["rev-parse", "HEAD"]).await?;
        info!(repo = %repo.display(), %branch, ?strategy, %head, "repository synced");
        Ok(SyncReport {
            branch,
            strategy,
            head,
        })
    }

    async fn check_state(&self, repo: &Path) -> Result<RepoState, GitError> {
        let branch = current_branch(repo).await?;
        let has_local_changes = has_local_changes(repo).await?;

        let tracking = self.tracking_ref(&branch);
        let commits_behind = match resolve(repo, &tracking).await? {
            Some(_) => {
                let range = format!("HEAD..{tracking}");
                git(repo, &["rev-list", "--count", &range])
                    .await?
                    .parse()
                    .unwrap_or(0)
            }
            None => {
                // Indistinguishable from "up to date" for callers.
                debug!(
                    repo = %repo.display(),
                    %tracking,
                    "no upstream tracking ref; reporting 0 behind"
                );
                0
            }
        };

        Ok(RepoState {
            branch,
            has_local_changes,
            commits_behind,
            last_fetched: last_fetched(repo).await,
        })
    }
}

async fn git(repo: &Path, args: &[&str]) -> Result<String, CommandError> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo).args(args);
    run_checked(cmd).await
}

async fn current_branch(repo: &Path) -> Result<String, GitError> {
    Ok(git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?)
}

async fn has_local_changes(repo: &Path) -> Result<bool, GitError> {
    let status = git(repo, &["status", "--porcelain", "--untracked-files=all"]).await?;
    Ok(!status.is_empty())
}

/// Resolves `reference` to a commit id, `None` if it does not exist.
async fn resolve(repo: &Path, reference: &str) -> Result<Option<String>, GitError> {
    let spec = format!("{reference}^{{commit}}");
    match git(repo, &["rev-parse", "--verify", "--quiet", &spec]).await {
        Ok(rev) => Ok(Some(rev)),
        Err(CommandError::Failed { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn last_fetched(repo: &Path) -> Option<DateTime<Utc>> {
    let rel = git(repo, &["rev-parse", "--git-path", "FETCH_HEAD"]).await.ok()?;
    let path = repo.join(PathBuf::from(rel));
    let modified = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
