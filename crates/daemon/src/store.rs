//! The daemon's only shared mutable state.
//!
//! Readers get owned copies. Writers compute everything that needs I/O first
//! and hold the write lock only to swap sub-records in. Refresh passes run
//! one at a time so an older pass never overwrites a newer one.

use std::collections::BTreeMap;
use std::sync::Arc;

use buildenv_core::model::{
    ClusterFacts, ClusterStatus, EnvironmentSnapshot, ExecutionResult, OperationStatus,
    RepositoryFacts,
};
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::cluster::ClusterProbe;
use crate::config::RepositoryConfig;
use crate::reconciler::RepoReconciler;

/// Summary of one `refresh` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub cluster: ClusterStatus,
    pub repositories: usize,
    pub failed_repositories: usize,
}

pub struct SnapshotStore {
    state: RwLock<EnvironmentSnapshot>,
    refreshing: Mutex<()>,
    cluster: Arc<dyn ClusterProbe>,
    git: Arc<dyn RepoReconciler>,
    repositories: Vec<RepositoryConfig>,
}

impl SnapshotStore {
    pub fn new(
        initial: EnvironmentSnapshot,
        cluster: Arc<dyn ClusterProbe>,
        git: Arc<dyn RepoReconciler>,
        repositories: Vec<RepositoryConfig>,
    ) -> Self {
        Self {
            state: RwLock::new(initial),
            refreshing: Mutex::new(()),
            cluster,
            git,
            repositories,
        }
    }

    pub async fn read(&self) -> EnvironmentSnapshot {
        self.state.read().await.clone()
    }

    /// Re-queries the cluster and every configured repository.
    ///
    /// A repository whose check fails is dropped from the map. A failing
    /// cluster probe leaves the cluster `unknown`.
    pub async fn refresh(&self) -> RefreshReport {
        let _pass = self.refreshing.lock().await;
        let (name, kubeconfig) = {
            let s = self.state.read().await;
            (s.cluster.name.clone(), s.cluster.kubeconfig.clone())
        };
        let cluster = self.probe_cluster(name, kubeconfig).await;

        let mut repositories = BTreeMap::new();
        let mut failed = 0;
        for repo in &self.repositories {
            match self.git.check_state(&repo.path).await {
                Ok(state) => {
                    repositories.insert(
                        repo.name.clone(),
                        RepositoryFacts {
                            name: repo.name.clone(),
                            path: repo.path.display().to_string(),
                            branch: state.branch,
                            last_synced: state.last_fetched,
                            commits_behind: state.commits_behind,
                            has_local_changes: state.has_local_changes,
                        },
                    );
                }
                Err(e) => {
                    failed += 1;
                    warn!(repo = %repo.name, error = %e, "repository check failed");
                }
            }
        }

        let report = RefreshReport {
            cluster: cluster.status,
            repositories: repositories.len(),
            failed_repositories: failed,
        };
        let mut s = self.state.write().await;
        s.cluster = cluster;
        s.repositories = repositories;
        drop(s);

        debug!(?report, "snapshot refreshed");
        report
    }

    async fn probe_cluster(&self, name: String, kubeconfig: Option<String>) -> ClusterFacts {
        let status = match self.cluster.status().await {
            Ok(s) => ClusterStatus::from_probe(&s),
            Err(e) => {
                warn!(cluster = %name, error = %e, "cluster status check failed");
                return ClusterFacts::unknown(name, kubeconfig);
            }
        };
        let stack_installed = if status == ClusterStatus::Running {
            self.cluster.stack_installed().await.unwrap_or_else(|e| {
                warn!(cluster = %name, error = %e, "stack check failed");
                false
            })
        } else {
            false
        };
        ClusterFacts {
            name,
            status,
            kubeconfig,
            stack_installed,
        }
    }

    pub async fn set_operation_status(&self, status: OperationStatus, error: Option<String>) {
        let mut s = self.state.write().await;
        s.operation_status = status;
        s.last_error = error;
        s.last_active = Utc::now();
    }

    pub async fn set_execution_result(&self, result: Option<ExecutionResult>) {
        let mut s = self.state.write().await;
        s.execution_result = result;
        s.last_active = Utc::now();
    }
}
