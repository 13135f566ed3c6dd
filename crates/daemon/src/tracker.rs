//! Drives one verification job from submission to a terminal outcome.
//!
//! After submission two activities race the same deadline: output streaming
//! (wait for the worker, then copy every container's output into a log file)
//! and status monitoring (poll the job's `Succeeded` condition). The outcome
//! always comes from monitoring; streaming is best-effort.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buildenv_core::jobspec::{JobSpec, JobSpecError};
use buildenv_core::model::ExecutionStatus;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::engine::{Condition, EngineError, JobEngine, Worker, WorkerLogs};

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How often to look for the job's worker.
    pub log_poll_interval: Duration,
    /// Give up on output capture if the worker has not started by then.
    pub worker_timeout: Duration,
    pub monitor_poll_interval: Duration,
    /// Upper bound on monitoring, on top of the caller's deadline.
    pub monitor_timeout: Duration,
    /// How long to wait for output copying after the job is terminal.
    pub flush_grace: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            log_poll_interval: Duration::from_secs(2),
            worker_timeout: Duration::from_secs(5 * 60),
            monitor_poll_interval: Duration::from_secs(5),
            monitor_timeout: Duration::from_secs(30 * 60),
            flush_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid job description: {0}")]
    Invalid(#[from] JobSpecError),
    #[error("create job: {0}")]
    Create(#[source] EngineError),
    #[error("job {job} reached no terminal condition within {after:?}")]
    Timeout { job: String, after: Duration },
    #[error("worker for job {job} did not start within {after:?}")]
    WorkerTimeout { job: String, after: Duration },
    #[error("open output sink {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What `run_workflow` observed.
#[derive(Debug)]
pub struct WorkflowOutcome {
    pub job_name: String,
    pub status: ExecutionStatus,
    /// Set when monitoring ended without a terminal condition.
    pub error: Option<TrackerError>,
}

/// Maps a job's conditions to a terminal status, `None` while still in progress.
pub fn terminal_status(conditions: &[Condition]) -> Option<ExecutionStatus> {
    let cond = conditions.iter().find(|c| c.kind == "Succeeded")?;
    match cond.status.as_str() {
        "True" => Some(ExecutionStatus::Succeeded),
        "False" => Some(ExecutionStatus::Failed),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ExecutionTracker {
    engine: Arc<dyn JobEngine>,
    logs: Arc<dyn WorkerLogs>,
    config: TrackerConfig,
}

impl ExecutionTracker {
    pub fn new(
        engine: Arc<dyn JobEngine>,
        logs: Arc<dyn WorkerLogs>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            engine,
            logs,
            config,
        }
    }

    /// Validates and creates the job, returning its engine-assigned name.
    pub async fn submit(&self, spec: &JobSpec) -> Result<String, TrackerError> {
        spec.validate()?;
        let name = self.engine.create(spec).await.map_err(TrackerError::Create)?;
        info!(job = %name, "job submitted");
        Ok(name)
    }

    /// Waits for the job's worker and copies each container's output into `sink`.
    ///
    /// Returns the number of bytes captured. Per-container failures are logged
    /// and skipped.
    pub async fn stream_output(&self, job_name: &str, sink: &Path) -> Result<u64, TrackerError> {
        let worker = self.wait_for_worker(job_name).await?;

        let sink_err = |source| TrackerError::Sink {
            path: sink.to_path_buf(),
            source,
        };
        if let Some(parent) = sink.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(sink_err)?;
        }
        let mut file = tokio::fs::File::create(sink).await.map_err(sink_err)?;

        let mut total = 0u64;
        for container in &worker.containers {
            let header = format!("==> {}/{} <==\n", worker.name, container);
            file.write_all(header.as_bytes()).await.map_err(sink_err)?;

            let mut stream = match self.logs.follow(&worker.name, container).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(job = %job_name, %container, error = %e, "cannot follow output");
                    continue;
                }
            };
            match tokio::io::copy(&mut stream, &mut file).await {
                Ok(n) => total += n,
                Err(e) => {
                    warn!(job = %job_name, %container, error = %e, "container output interrupted")
                }
            }
        }
        file.flush().await.map_err(sink_err)?;
        debug!(job = %job_name, bytes = total, sink = %sink.display(), "output stream closed");
        Ok(total)
    }

    async fn wait_for_worker(&self, job_name: &str) -> Result<Worker, TrackerError> {
        let deadline = Instant::now() + self.config.worker_timeout;
        loop {
            match self.logs.worker(job_name).await {
                Ok(Some(w)) if w.phase.has_started() => return Ok(w),
                Ok(Some(w)) => debug!(job = %job_name, phase = ?w.phase, "worker not started"),
                Ok(None) => debug!(job = %job_name, "worker not scheduled yet"),
                Err(e) => debug!(job = %job_name, error = %e, "worker lookup failed"),
            }
            if Instant::now() + self.config.log_poll_interval > deadline {
                return Err(TrackerError::WorkerTimeout {
                    job: job_name.to_string(),
                    after: self.config.worker_timeout,
                });
            }
            sleep(self.config.log_poll_interval).await;
        }
    }

    /// Polls until the job is terminal or `deadline` (capped by the monitor
    /// timeout) passes. Reaching the deadline is `Err(Timeout)`.
    pub async fn monitor(
        &self,
        job_name: &str,
        deadline: Instant,
    ) -> Result<ExecutionStatus, TrackerError> {
        let started = Instant::now();
        let deadline = deadline.min(started + self.config.monitor_timeout);
        loop {
            match timeout_at(deadline, self.engine.get(job_name)).await {
                Err(_) => break,
                Ok(Ok(obs)) => {
                    if let Some(status) = terminal_status(&obs.conditions) {
                        info!(job = %job_name, %status, "job finished");
                        return Ok(status);
                    }
                }
                Ok(Err(e)) => warn!(job = %job_name, error = %e, "job status query failed"),
            }
            let wake = Instant::now() + self.config.monitor_poll_interval;
            if wake >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(wake).await;
        }
        warn!(job = %job_name, "job monitoring deadline exceeded");
        Err(TrackerError::Timeout {
            job: job_name.to_string(),
            after: deadline.saturating_duration_since(started),
        })
    }

    /// Submit, then stream output and monitor concurrently.
    ///
    /// A submission failure is returned as `Err` and nothing else runs. Once
    /// submitted the result is always `Ok`, carrying the monitor's status,
    /// and it is returned no later than `deadline`: monitoring stops
    /// `flush_grace` early so the flush wait fits before it.
    pub async fn run_workflow(
        &self,
        spec: &JobSpec,
        sink: &Path,
        deadline: Instant,
    ) -> Result<WorkflowOutcome, TrackerError> {
        let job_name = self.submit(spec).await?;

        let streamer = {
            let this = self.clone();
            let job = job_name.clone();
            let sink = sink.to_path_buf();
            tokio::spawn(async move { this.stream_output(&job, &sink).await })
        };

        let monitor_deadline = deadline
            .checked_sub(self.config.flush_grace)
            .unwrap_or_else(Instant::now);
        let (status, error) = match self.monitor(&job_name, monitor_deadline).await {
            Ok(status) => (status, None),
            Err(e) => (ExecutionStatus::Timeout, Some(e)),
        };

        // Dropping the handle on timeout leaves the copy running detached.
        let flush_until = (Instant::now() + self.config.flush_grace).min(deadline);
        match timeout_at(flush_until, streamer).await {
            Ok(Ok(Ok(bytes))) => debug!(job = %job_name, bytes, "output captured"),
            Ok(Ok(Err(e))) => warn!(job = %job_name, error = %e, "output capture failed"),
            Ok(Err(e)) => warn!(job = %job_name, error = %e, "output task aborted"),
            Err(_) => debug!(job = %job_name, "output still streaming after grace period"),
        }

        Ok(WorkflowOutcome {
            job_name,
            status,
            error,
        })
    }
}
