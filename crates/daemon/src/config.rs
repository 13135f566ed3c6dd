use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use buildenv_core::model::FeatureFlags;
use serde::{Deserialize, Serialize};

use crate::tracker::TrackerConfig;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8765";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    /// Per-job output files land here.
    pub logs_dir: PathBuf,
    pub refresh_interval_secs: u64,
    pub cluster: ClusterConfig,
    pub git: GitConfig,
    pub repositories: Vec<RepositoryConfig>,
    pub images: ImagesConfig,
    pub deploy: DeployConfig,
    pub features: FeatureFlags,
    pub tracker: TrackerSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.into(),
            logs_dir: PathBuf::from(".buildenv/logs"),
            refresh_interval_secs: 30,
            cluster: ClusterConfig::default(),
            git: GitConfig::default(),
            repositories: Vec::new(),
            images: ImagesConfig::default(),
            deploy: DeployConfig::default(),
            features: FeatureFlags::default(),
            tracker: TrackerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    pub kubeconfig: Option<PathBuf>,
    /// Namespace verification jobs are created in unless the job names one.
    pub namespace: String,
    /// Presence of this namespace means the controller stack is installed.
    pub stack_namespace: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "buildenv".into(),
            kubeconfig: None,
            namespace: "default".into(),
            stack_namespace: "multi-platform-controller".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub upstream_remote: String,
    pub fetch_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            upstream_remote: "upstream".into(),
            fetch_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Container build CLI (`podman` or `docker`).
    pub builder: String,
    pub images: Vec<ImageConfig>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            builder: "podman".into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub tag: String,
    pub context: PathBuf,
    #[serde(default)]
    pub containerfile: Option<PathBuf>,
}

/// Manifest locations per deploy target. Directories are applied with `-k`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub mpc: Vec<PathBuf>,
    pub secrets: Vec<PathBuf>,
    pub konflux: Vec<PathBuf>,
    pub minimal_stack: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub log_poll_interval_secs: u64,
    pub worker_timeout_secs: u64,
    pub monitor_poll_interval_secs: u64,
    pub monitor_timeout_secs: u64,
    pub flush_grace_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            log_poll_interval_secs: 2,
            worker_timeout_secs: 300,
            monitor_poll_interval_secs: 5,
            monitor_timeout_secs: 1800,
            flush_grace_secs: 2,
        }
    }
}

impl TrackerSettings {
    pub fn to_tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            log_poll_interval: Duration::from_secs(self.log_poll_interval_secs),
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            monitor_poll_interval: Duration::from_secs(self.monitor_poll_interval_secs),
            monitor_timeout: Duration::from_secs(self.monitor_timeout_secs),
            flush_grace: Duration::from_secs(self.flush_grace_secs),
        }
    }
}

impl DaemonConfig {
    /// Reads a TOML config; relative paths are taken relative to the file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let mut cfg: DaemonConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.resolve_paths(base);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        self.logs_dir = make_abs(base, &self.logs_dir);
        self.cluster.kubeconfig = self.cluster.kubeconfig.take().map(|kc| make_abs(base, &kc));
        for repo in &mut self.repositories {
            repo.path = make_abs(base, &repo.path);
        }
        for image in &mut self.images.images {
            image.context = make_abs(base, &image.context);
            image.containerfile = image.containerfile.take().map(|cf| make_abs(base, &cf));
        }
        for list in [
            &mut self.deploy.mpc,
            &mut self.deploy.secrets,
            &mut self.deploy.konflux,
            &mut self.deploy.minimal_stack,
        ] {
            for p in list.iter_mut() {
                *p = make_abs(base, p);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.name.trim().is_empty() {
                bail!("repository at {} has an empty name", repo.path.display());
            }
            if !seen.insert(repo.name.as_str()) {
                bail!("duplicate repository name: {}", repo.name);
            }
        }
        if self.refresh_interval_secs == 0 {
            bail!("refresh_interval_secs must be greater than zero");
        }
        Ok(())
    }
}

pub fn make_abs(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
