//! Bodies of the background operations.
//!
//! Each returns `anyhow::Result`; the coordinator turns an error into the
//! snapshot's last error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use buildenv_core::jobspec::JobSpec;
use buildenv_core::log_stamp;
use buildenv_core::model::{ExecutionResult, ExecutionStatus};
use chrono::{Local, Utc};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::builder::ImageBuilder;
use crate::config::{ImageConfig, RepositoryConfig};
use crate::deploy::{DeployTarget, DeploymentApplier};
use crate::reconciler::RepoReconciler;
use crate::store::SnapshotStore;
use crate::tracker::ExecutionTracker;

/// Time kept back from a taskrun's deadline to record its outcome.
const RESULT_MARGIN: Duration = Duration::from_secs(1);

pub struct Operations {
    pub store: Arc<SnapshotStore>,
    pub tracker: ExecutionTracker,
    pub builder: Arc<dyn ImageBuilder>,
    pub applier: Arc<dyn DeploymentApplier>,
    pub git: Arc<dyn RepoReconciler>,
    pub repositories: Vec<RepositoryConfig>,
    pub images: Vec<ImageConfig>,
    pub logs_dir: PathBuf,
}

impl Operations {
    pub async fn rebuild(&self) -> Result<()> {
        self.build_images().await?;
        self.store.refresh().await;
        Ok(())
    }

    pub async fn deploy(&self, target: DeployTarget) -> Result<()> {
        self.applier
            .deploy(target)
            .await
            .with_context(|| format!("deploy {target}"))?;
        self.store.refresh().await;
        Ok(())
    }

    pub async fn rebuild_and_redeploy(&self) -> Result<()> {
        self.build_images().await?;
        self.deploy(DeployTarget::Mpc).await
    }

    async fn build_images(&self) -> Result<()> {
        if self.images.is_empty() {
            bail!("no images configured");
        }
        for image in &self.images {
            self.builder
                .build(image)
                .await
                .with_context(|| format!("build {}", image.tag))?;
        }
        Ok(())
    }

    /// Runs one verification job and records its outcome.
    ///
    /// Anything but `Succeeded` is returned as an error. The outcome is
    /// recorded before `deadline`, including a monitoring timeout.
    pub async fn run_taskrun(
        &self,
        spec: JobSpec,
        yaml_path: &Path,
        deadline: Instant,
    ) -> Result<()> {
        let sink = sink_path(&self.logs_dir, yaml_path, Local::now());
        self.store.set_execution_result(None).await;
        let started_at = Utc::now();

        let workflow_deadline = deadline
            .checked_sub(RESULT_MARGIN)
            .unwrap_or_else(Instant::now);
        let outcome = self
            .tracker
            .run_workflow(&spec, &sink, workflow_deadline)
            .await
            .with_context(|| format!("submit {}", yaml_path.display()))?;

        self.store
            .set_execution_result(Some(ExecutionResult {
                job_name: outcome.job_name.clone(),
                status: outcome.status,
                log_path: sink.display().to_string(),
                started_at,
            }))
            .await;

        if let Some(err) = outcome.error {
            return Err(err).with_context(|| format!("taskrun {}", outcome.job_name));
        }
        if outcome.status != ExecutionStatus::Succeeded {
            bail!(
                "taskrun {} finished {}; output in {}",
                outcome.job_name,
                outcome.status,
                sink.display()
            );
        }
        Ok(())
    }

    /// Syncs every configured repository, then refreshes.
    pub async fn sync_all(&self) {
        for repo in &self.repositories {
            match self.git.sync(&repo.path).await {
                Ok(report) => info!(
                    repo = %repo.name,
                    strategy = ?report.strategy,
                    head = %report.head,
                    "synced"
                ),
                Err(e) => warn!(repo = %repo.name, error = %e, "sync failed"),
            }
        }
        self.store.refresh().await;
    }
}

/// `<logs_dir>/<yaml stem>_<YYYYMMDD_HHMMSS>.log`
pub fn sink_path(logs_dir: &Path, yaml_path: &Path, now: chrono::DateTime<Local>) -> PathBuf {
    let stem = yaml_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "taskrun".into());
    logs_dir.join(format!("{stem}_{}.log", log_stamp(now)))
}
