use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the whole development environment.
///
/// Readers always receive an owned copy; the daemon never hands out
/// references into its live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// Identifier of this daemon session (new on every start).
    pub session_id: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time a background operation reported progress.
    pub last_active: DateTime<Utc>,
    /// Facts about the local cluster.
    pub cluster: ClusterFacts,
    /// Facts per configured repository, keyed by repository name.
    ///
    /// A repository missing from this map is *unknown*, not clean.
    pub repositories: BTreeMap<String, RepositoryFacts>,
    /// What is currently deployed, if known.
    #[serde(default)]
    pub deployment: Option<DeploymentFacts>,
    /// Optional stacks enabled for this environment.
    pub features: FeatureFlags,
    /// What the single background slot is doing.
    pub operation_status: OperationStatus,
    /// Error of the most recent failed operation.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Outcome of the most recent job execution.
    #[serde(default)]
    pub execution_result: Option<ExecutionResult>,
}

impl EnvironmentSnapshot {
    /// Creates an empty snapshot for a fresh session.
    pub fn new(session_id: String, cluster: ClusterFacts, features: FeatureFlags) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            last_active: now,
            cluster,
            repositories: BTreeMap::new(),
            deployment: None,
            features,
            operation_status: OperationStatus::Idle,
            last_error: None,
            execution_result: None,
        }
    }
}

/// Cluster state as observed by the last reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFacts {
    /// Cluster name.
    pub name: String,
    /// Observed status.
    pub status: ClusterStatus,
    /// Location of the kubeconfig used to reach the cluster.
    pub kubeconfig: Option<String>,
    /// Whether the build controller stack is installed.
    pub stack_installed: bool,
}

impl ClusterFacts {
    /// Facts for a cluster that has not been probed yet.
    pub fn unknown(name: impl Into<String>, kubeconfig: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: ClusterStatus::Unknown,
            kubeconfig,
            stack_installed: false,
        }
    }
}

/// Cluster status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Cluster is up and answering.
    Running,
    /// Cluster does not exist or is stopped.
    NotRunning,
    /// The probe failed; nothing is known.
    Unknown,
}

impl ClusterStatus {
    /// Maps the cluster manager's free-form status string.
    pub fn from_probe(s: &str) -> Self {
        match s.trim() {
            "running" => Self::Running,
            "not_running" | "stopped" | "not found" => Self::NotRunning,
            _ => Self::Unknown,
        }
    }
}

/// Working-copy facts for one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryFacts {
    /// Configured repository name.
    pub name: String,
    /// Working-copy location.
    pub path: String,
    /// Checked-out branch.
    pub branch: String,
    /// When the upstream was last fetched, if ever.
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    /// Commits the local branch trails the *last fetched* upstream by.
    pub commits_behind: u32,
    /// Uncommitted or untracked modifications present.
    pub has_local_changes: bool,
}

/// Deployed artifacts. No live producer yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFacts {
    /// Image references in the deployment.
    pub images: Vec<String>,
    /// When the deployment happened.
    pub deployed_at: DateTime<Utc>,
    /// Source revision the images were built from.
    pub revision: String,
}

/// Optional stacks managed by this environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Multi-platform build controller.
    pub multi_platform_controller: bool,
    /// Full Konflux deployment.
    pub konflux: bool,
    /// Minimal Tekton-only stack.
    pub minimal_stack: bool,
    /// Secrets deployed from local files.
    pub secrets: bool,
}

/// State of the single background operation slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Nothing running.
    #[default]
    Idle,
    /// Building and loading images.
    Rebuilding,
    /// Applying the multi-platform controller.
    DeployingMpc,
    /// Applying secrets.
    DeployingSecrets,
    /// Applying Konflux.
    DeployingKonflux,
    /// Applying the minimal stack.
    DeployingMinimalStack,
    /// Running a verification job.
    RunningTaskrun,
    /// Building images then redeploying the controller.
    RebuildingAndRedeploying,
}

/// Terminal status of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Job reported success.
    Succeeded,
    /// Job reported failure.
    Failed,
    /// No terminal condition before the deadline.
    Timeout,
}

impl ExecutionStatus {
    /// String form used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Timeout => "Timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Name assigned by the execution engine.
    pub job_name: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Where the job's output was captured.
    pub log_path: String,
    /// When the job was submitted.
    pub started_at: DateTime<Utc>,
}
