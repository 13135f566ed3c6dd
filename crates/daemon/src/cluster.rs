//! Cluster probing. Lifecycle itself belongs to the `kind` CLI.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::process::{run_checked, CommandError};

#[async_trait]
pub trait ClusterProbe: Send + Sync {
    /// Free-form status as reported by the cluster manager (`running`, `not_running`, ...).
    async fn status(&self) -> Result<String, CommandError>;

    /// Whether the build controller stack is present on the cluster.
    async fn stack_installed(&self) -> Result<bool, CommandError>;
}

/// A `kind` cluster reached through `kubectl`.
#[derive(Debug, Clone)]
pub struct KindCluster {
    name: String,
    kubeconfig: Option<PathBuf>,
    stack_namespace: String,
}

impl KindCluster {
    pub fn new(
        name: impl Into<String>,
        kubeconfig: Option<PathBuf>,
        stack_namespace: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kubeconfig,
            stack_namespace: stack_namespace.into(),
        }
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--context").arg(format!("kind-{}", self.name));
        if let Some(kc) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kc);
        }
        cmd
    }
}

#[async_trait]
impl ClusterProbe for KindCluster {
    async fn status(&self) -> Result<String, CommandError> {
        let mut cmd = Command::new("kind");
        cmd.args(["get", "clusters"]);
        let clusters = run_checked(cmd).await?;
        if !clusters.lines().any(|l| l.trim() == self.name) {
            return Ok("not_running".into());
        }

        let mut cmd = self.kubectl();
        cmd.args(["get", "--raw", "/readyz"]);
        match run_checked(cmd).await {
            Ok(_) => Ok("running".into()),
            Err(CommandError::Failed { .. }) => Ok("not_running".into()),
            Err(e) => Err(e),
        }
    }

    async fn stack_installed(&self) -> Result<bool, CommandError> {
        let mut cmd = self.kubectl();
        cmd.args(["get", "namespace", &self.stack_namespace, "-o", "name"]);
        match run_checked(cmd).await {
            Ok(out) => Ok(!out.is_empty()),
            Err(CommandError::Failed { stderr, .. }) if stderr.contains("NotFound") => Ok(false),
            Err(e) => Err(e),
        }
    }
}
