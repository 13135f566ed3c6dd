use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::config::DeployConfig;
use crate::process::{run_checked, CommandError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployTarget {
    Mpc,
    Secrets,
    Konflux,
    MinimalStack,
}

impl fmt::Display for DeployTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mpc => "multi-platform-controller",
            Self::Secrets => "secrets",
            Self::Konflux => "konflux",
            Self::MinimalStack => "minimal-stack",
        })
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("no manifests configured for {0}")]
    NothingConfigured(DeployTarget),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[async_trait]
pub trait DeploymentApplier: Send + Sync {
    async fn deploy(&self, target: DeployTarget) -> Result<(), DeployError>;
}

/// Applies configured manifests with `kubectl apply`.
#[derive(Debug, Clone)]
pub struct KubectlApplier {
    manifests: DeployConfig,
    kubeconfig: Option<PathBuf>,
    context: String,
}

impl KubectlApplier {
    pub fn new(
        manifests: DeployConfig,
        kubeconfig: Option<PathBuf>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            manifests,
            kubeconfig,
            context: context.into(),
        }
    }

    fn manifests(&self, target: DeployTarget) -> &[PathBuf] {
        match target {
            DeployTarget::Mpc => &self.manifests.mpc,
            DeployTarget::Secrets => &self.manifests.secrets,
            DeployTarget::Konflux => &self.manifests.konflux,
            DeployTarget::MinimalStack => &self.manifests.minimal_stack,
        }
    }

    fn apply_command(&self, manifest: &Path) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(kc) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kc);
        }
        // Directories are kustomizations.
        let flag = if manifest.is_dir() { "-k" } else { "-f" };
        cmd.arg("--context")
            .arg(&self.context)
            .arg("apply")
            .arg(flag)
            .arg(manifest)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl DeploymentApplier for KubectlApplier {
    async fn deploy(&self, target: DeployTarget) -> Result<(), DeployError> {
        let manifests = self.manifests(target);
        if manifests.is_empty() {
            return Err(DeployError::NothingConfigured(target));
        }
        for manifest in manifests {
            info!(%target, manifest = %manifest.display(), "applying");
            run_checked(self.apply_command(manifest)).await?;
        }
        info!(%target, "deployed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::describe;

    #[tokio::test]
    async fn unconfigured_target_is_rejected_before_running_anything() {
        let applier = KubectlApplier::new(DeployConfig::default(), None, "kind-dev");
        let err = applier.deploy(DeployTarget::Konflux).await.unwrap_err();
        assert!(matches!(err, DeployError::NothingConfigured(DeployTarget::Konflux)));
        assert_eq!(err.to_string(), "no manifests configured for konflux");
    }

    #[test]
    fn directories_use_kustomize() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("secret.yaml");
        std::fs::write(&file, "kind: Secret\n").unwrap();
        let applier = KubectlApplier::new(DeployConfig::default(), None, "kind-dev");

        let cmd = describe(&applier.apply_command(dir.path()));
        assert!(cmd.starts_with("kubectl --context kind-dev apply -k "));
        let cmd = describe(&applier.apply_command(&file));
        assert!(cmd.contains("apply -f "));
    }
}
