//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use buildenv_core::jobspec::JobSpec;
use buildenv_core::model::{ClusterFacts, EnvironmentSnapshot, FeatureFlags};
use tokio::io::{duplex, DuplexStream};

use crate::builder::ImageBuilder;
use crate::cluster::ClusterProbe;
use crate::config::{ImageConfig, RepositoryConfig};
use crate::deploy::{DeployError, DeployTarget, DeploymentApplier};
use crate::engine::{
    Condition, EngineError, JobEngine, JobObservation, LogStream, Worker, WorkerLogs, WorkerPhase,
};
use crate::process::CommandError;
use crate::reconciler::{GitError, RepoReconciler, RepoState, SyncReport, SyncStrategy};
use crate::store::SnapshotStore;

pub const SAMPLE_JOB: &str = r#"
apiVersion: tekton.dev/v1
kind: TaskRun
metadata:
  generateName: verify-
spec:
  taskRef:
    name: buildah
"#;

pub fn sample_job() -> JobSpec {
    JobSpec::from_yaml_str(SAMPLE_JOB).unwrap()
}

pub fn condition(kind: &str, status: &str) -> Condition {
    Condition {
        kind: kind.into(),
        status: status.into(),
        reason: None,
        message: None,
    }
}

pub fn failed(command: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        command: command.into(),
        status: "exit status: 1".into(),
        stderr: stderr.into(),
    }
}

pub fn snapshot() -> EnvironmentSnapshot {
    EnvironmentSnapshot::new(
        "test-session".into(),
        ClusterFacts::unknown("buildenv", None),
        FeatureFlags::default(),
    )
}

pub fn repo_config(name: &str, path: &str) -> RepositoryConfig {
    RepositoryConfig {
        name: name.into(),
        path: PathBuf::from(path),
    }
}

pub fn store() -> Arc<SnapshotStore> {
    Arc::new(SnapshotStore::new(
        snapshot(),
        FakeCluster::running(),
        FakeRepos::new(),
        vec![],
    ))
}

/// Job engine whose `get` replays a script of condition sets; the last entry repeats.
#[derive(Default)]
pub struct FakeEngine {
    script: Mutex<VecDeque<Vec<Condition>>>,
    worker: Mutex<Option<(WorkerPhase, Vec<(String, String)>)>>,
    pub reject_create: AtomicBool,
    pub failing_gets: AtomicUsize,
    pub creates: AtomicUsize,
    pub gets: AtomicUsize,
    pub worker_lookups: AtomicUsize,
    /// Writer halves of streams that never close.
    held: Mutex<Vec<DuplexStream>>,
    hold_open: AtomicBool,
}

impl FakeEngine {
    pub fn scripted(script: Vec<Vec<Condition>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn set_worker(&self, phase: WorkerPhase, containers: &[(&str, &str)]) {
        let containers = containers
            .iter()
            .map(|(name, out)| (name.to_string(), out.to_string()))
            .collect();
        *self.worker.lock().unwrap() = Some((phase, containers));
    }

    /// Followed streams stay open, like a container that is still running.
    pub fn hold_streams_open(&self) {
        self.hold_open.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobEngine for FakeEngine {
    async fn create(&self, spec: &JobSpec) -> Result<String, EngineError> {
        spec.validate()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.reject_create.load(Ordering::SeqCst) {
            return Err(failed("kubectl create", "admission webhook denied the request").into());
        }
        Ok("verify-abc12".into())
    }

    async fn get(&self, _name: &str) -> Result<JobObservation, EngineError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let pending = self.failing_gets.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_gets.store(pending - 1, Ordering::SeqCst);
            return Err(failed("kubectl get", "connection refused").into());
        }
        let mut script = self.script.lock().unwrap();
        let conditions = if script.len() > 1 {
            script.pop_front().unwrap_or_default()
        } else {
            script.front().cloned().unwrap_or_default()
        };
        Ok(JobObservation {
            conditions,
            worker: None,
        })
    }
}

#[async_trait]
impl WorkerLogs for FakeEngine {
    async fn worker(&self, job_name: &str) -> Result<Option<Worker>, EngineError> {
        self.worker_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.worker.lock().unwrap().as_ref().map(|(phase, containers)| Worker {
            name: format!("{job_name}-pod"),
            phase: *phase,
            containers: containers.iter().map(|(n, _)| n.clone()).collect(),
        }))
    }

    async fn follow(&self, _worker: &str, container: &str) -> Result<LogStream, EngineError> {
        if self.hold_open.load(Ordering::SeqCst) {
            let (reader, writer) = duplex(64);
            self.held.lock().unwrap().push(writer);
            return Ok(Box::pin(reader));
        }
        let out = self
            .worker
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|(_, cs)| {
                cs.iter()
                    .find(|(n, _)| n == container)
                    .map(|(_, o)| o.clone())
            })
            .unwrap_or_default();
        Ok(Box::pin(Cursor::new(out.into_bytes())))
    }
}

pub struct FakeCluster {
    status: Mutex<Option<String>>,
    delay: Mutex<Duration>,
}

impl FakeCluster {
    pub fn running() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Some("running".into())),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn fail(&self) {
        *self.status.lock().unwrap() = None;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ClusterProbe for FakeCluster {
    async fn status(&self) -> Result<String, CommandError> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let status = self.status.lock().unwrap().clone();
        status.ok_or_else(|| failed("kind get clusters", "cannot connect"))
    }

    async fn stack_installed(&self) -> Result<bool, CommandError> {
        Ok(true)
    }
}

/// Reconciler keyed by path; a path without a state fails its check.
#[derive(Default)]
pub struct FakeRepos {
    states: Mutex<HashMap<PathBuf, RepoState>>,
    pub synced: Mutex<Vec<PathBuf>>,
    next_check_delay: Mutex<Option<Duration>>,
}

impl FakeRepos {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state(&self, path: &str, state: RepoState) {
        self.states.lock().unwrap().insert(PathBuf::from(path), state);
    }

    pub fn clear_state(&self, path: &str) {
        self.states.lock().unwrap().remove(Path::new(path));
    }

    /// The next `check_state` reads the state, then stalls for `delay` before answering.
    pub fn delay_next_check(&self, delay: Duration) {
        *self.next_check_delay.lock().unwrap() = Some(delay);
    }

    fn state(&self, repo: &Path) -> Result<RepoState, GitError> {
        self.states
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .ok_or_else(|| failed("git rev-parse", "not a git repository").into())
    }
}

#[async_trait]
impl RepoReconciler for FakeRepos {
    async fn sync(&self, repo: &Path) -> Result<SyncReport, GitError> {
        self.synced.lock().unwrap().push(repo.to_path_buf());
        let state = self.state(repo)?;
        Ok(SyncReport {
            branch: state.branch,
            strategy: SyncStrategy::UpToDate,
            head: "0000000".into(),
        })
    }

    async fn check_state(&self, repo: &Path) -> Result<RepoState, GitError> {
        let state = self.state(repo);
        let delay = self.next_check_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        state
    }
}

#[derive(Default)]
pub struct FakeBuilder {
    pub built: Mutex<Vec<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, image: &ImageConfig) -> Result<(), CommandError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(failed("podman build", "no space left on device"));
        }
        self.built.lock().unwrap().push(image.tag.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeApplier {
    pub applied: Mutex<Vec<DeployTarget>>,
    /// When set, each deploy waits for a permit.
    pub gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl FakeApplier {
    pub fn gated(gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            applied: Mutex::default(),
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl DeploymentApplier for FakeApplier {
    async fn deploy(&self, target: DeployTarget) -> Result<(), DeployError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.applied.lock().unwrap().push(target);
        Ok(())
    }
}
