//! Boundary to the job execution engine (Tekton on the local cluster).
//!
//! The tracker only sees the [`JobEngine`] and [`WorkerLogs`] traits;
//! [`KubectlEngine`] implements both by shelling out to `kubectl`.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use buildenv_core::jobspec::{JobSpec, JobSpecError};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::warn;

use crate::process::{describe, run_checked, run_with_input, CommandError};

/// Followable byte stream of one container's output.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Spec(#[from] JobSpecError),
    #[error("decode {what}: {source}")]
    Decode {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("engine returned no name for the created job")]
    NoName,
    #[error("follow logs of {worker}/{container}: {source}")]
    Follow {
        worker: String,
        container: String,
        #[source]
        source: std::io::Error,
    },
}

/// One entry of a job's `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    /// `"True"`, `"False"` or `"Unknown"`.
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What the engine currently reports for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobObservation {
    pub conditions: Vec<Condition>,
    /// Name of the worker pod, once scheduled.
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkerPhase {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Containers have started, so their output can be read.
    pub fn has_started(self) -> bool {
        matches!(self, Self::Running | Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    pub name: String,
    pub phase: WorkerPhase,
    pub containers: Vec<String>,
}

#[async_trait]
pub trait JobEngine: Send + Sync {
    /// Creates the job; returns the name the engine assigned.
    async fn create(&self, spec: &JobSpec) -> Result<String, EngineError>;

    async fn get(&self, name: &str) -> Result<JobObservation, EngineError>;
}

#[async_trait]
pub trait WorkerLogs: Send + Sync {
    /// The job's worker, `None` while not yet scheduled.
    async fn worker(&self, job_name: &str) -> Result<Option<Worker>, EngineError>;

    /// Follows one container's output until the container exits.
    async fn follow(&self, worker: &str, container: &str) -> Result<LogStream, EngineError>;
}

#[derive(Debug, Clone)]
pub struct KubectlEngine {
    namespace: String,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlEngine {
    pub fn new(
        namespace: impl Into<String>,
        kubeconfig: Option<PathBuf>,
        context: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kubeconfig,
            context,
        }
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(kc) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kc);
        }
        if let Some(ctx) = &self.context {
            cmd.arg("--context").arg(ctx);
        }
        cmd.arg("--namespace").arg(&self.namespace);
        cmd
    }
}

#[async_trait]
impl JobEngine for KubectlEngine {
    async fn create(&self, spec: &JobSpec) -> Result<String, EngineError> {
        spec.validate()?;
        let mut spec = spec.clone();
        if let Some(ns) = spec.metadata.namespace.as_deref() {
            if ns != self.namespace {
                warn!(requested = %ns, namespace = %self.namespace, "overriding job namespace");
            }
        }
        spec.metadata.namespace = Some(self.namespace.clone());

        let mut cmd = self.kubectl();
        cmd.args(["create", "-f", "-", "-o", "jsonpath={.metadata.name}"]);
        let name = run_with_input(cmd, spec.to_yaml()?.as_bytes()).await?;
        if name.is_empty() {
            return Err(EngineError::NoName);
        }
        Ok(name)
    }

    async fn get(&self, name: &str) -> Result<JobObservation, EngineError> {
        let mut cmd = self.kubectl();
        cmd.args(["get", "taskrun", name, "-o", "json"]);
        parse_observation(&run_checked(cmd).await?)
    }
}

#[async_trait]
impl WorkerLogs for KubectlEngine {
    async fn worker(&self, job_name: &str) -> Result<Option<Worker>, EngineError> {
        let Some(pod) = self.get(job_name).await?.worker else {
            return Ok(None);
        };
        let mut cmd = self.kubectl();
        cmd.args(["get", "pod", &pod, "-o", "json"]);
        match run_checked(cmd).await {
            Ok(json) => parse_worker(&json).map(Some),
            Err(CommandError::Failed { stderr, .. }) if stderr.contains("NotFound") => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn follow(&self, worker: &str, container: &str) -> Result<LogStream, EngineError> {
        let mut cmd = self.kubectl();
        cmd.args(["logs", "--follow", worker, "--container", container])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        tracing::debug!(command = %describe(&cmd), "following logs");
        let follow_err = |source| EngineError::Follow {
            worker: worker.to_string(),
            container: container.to_string(),
            source,
        };
        let mut child = cmd.spawn().map_err(follow_err)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            follow_err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdout not captured",
            ))
        })?;
        // kubectl exits on its own once the container stream closes.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(Box::pin(stdout))
    }
}

#[derive(Deserialize)]
struct TaskRunObject {
    #[serde(default)]
    status: TaskRunStatus,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRunStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    pod_name: Option<String>,
}

#[derive(Deserialize)]
struct PodObject {
    metadata: Named,
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

#[derive(Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Named>,
}

#[derive(Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

fn parse_observation(json: &str) -> Result<JobObservation, EngineError> {
    let obj: TaskRunObject = serde_json::from_str(json).map_err(|source| EngineError::Decode {
        what: "taskrun".into(),
        source,
    })?;
    Ok(JobObservation {
        conditions: obj.status.conditions,
        worker: obj.status.pod_name.filter(|p| !p.is_empty()),
    })
}

fn parse_worker(json: &str) -> Result<Worker, EngineError> {
    let pod: PodObject = serde_json::from_str(json).map_err(|source| EngineError::Decode {
        what: "pod".into(),
        source,
    })?;
    Ok(Worker {
        name: pod.metadata.name,
        phase: WorkerPhase::parse(pod.status.phase.as_deref()),
        containers: pod.spec.containers.into_iter().map(|c| c.name).collect(),
    })
}
