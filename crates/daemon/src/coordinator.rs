//! Single-flight admission for background operations.
//!
//! At most one operation runs at a time. The admission flag is independent
//! of the snapshot lock so status polling never contends with admission.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildenv_core::model::OperationStatus;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info};

use crate::store::SnapshotStore;

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Rebuild,
    DeployMpc,
    RebuildAndRedeploy,
    DeploySecrets,
    DeployKonflux,
    DeployMinimalStack,
    RunTaskRun,
}

impl OperationKind {
    /// Status reported while the operation runs.
    pub fn status(self) -> OperationStatus {
        match self {
            Self::Rebuild => OperationStatus::Rebuilding,
            Self::DeployMpc => OperationStatus::DeployingMpc,
            Self::RebuildAndRedeploy => OperationStatus::RebuildingAndRedeploying,
            Self::DeploySecrets => OperationStatus::DeployingSecrets,
            Self::DeployKonflux => OperationStatus::DeployingKonflux,
            Self::DeployMinimalStack => OperationStatus::DeployingMinimalStack,
            Self::RunTaskRun => OperationStatus::RunningTaskrun,
        }
    }

    pub fn timeout(self) -> Duration {
        match self {
            Self::Rebuild => 15 * MINUTE,
            Self::DeployMpc => 10 * MINUTE,
            Self::RebuildAndRedeploy => 30 * MINUTE,
            Self::DeploySecrets => 5 * MINUTE,
            Self::DeployKonflux => 30 * MINUTE,
            Self::DeployMinimalStack => 20 * MINUTE,
            Self::RunTaskRun => 30 * MINUTE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Rebuild => "image rebuild",
            Self::DeployMpc => "multi-platform controller deployment",
            Self::RebuildAndRedeploy => "rebuild and redeploy",
            Self::DeploySecrets => "secrets deployment",
            Self::DeployKonflux => "konflux deployment",
            Self::DeployMinimalStack => "minimal stack deployment",
            Self::RunTaskRun => "taskrun execution",
        }
    }

    /// Message for the 202 body.
    pub fn accepted_message(self) -> String {
        format!("{} started", self.label())
    }
}

/// Handed to an operation body.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext {
    pub kind: OperationKind,
    /// The body is dropped when this passes.
    pub deadline: Instant,
}

#[derive(Debug, Error)]
#[error("another operation is already in progress")]
pub struct Conflict;

pub struct OperationCoordinator {
    admitted: AtomicBool,
    store: Arc<SnapshotStore>,
}

impl OperationCoordinator {
    pub fn new(store: Arc<SnapshotStore>) -> Self {
        Self {
            admitted: AtomicBool::new(false),
            store,
        }
    }

    /// Takes the admission flag. `false` if an operation already holds it.
    pub fn try_begin(&self) -> bool {
        self.admitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_busy(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    /// Admits `kind`, publishes its status and runs `body` detached.
    ///
    /// Returns once the status is visible; the body's outcome is only ever
    /// reported through the snapshot.
    pub async fn launch<F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        body: F,
    ) -> Result<JoinHandle<()>, Conflict>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.launch_until(kind, Instant::now() + kind.timeout(), body)
            .await
    }

    pub(crate) async fn launch_until<F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        deadline: Instant,
        body: F,
    ) -> Result<JoinHandle<()>, Conflict>
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !self.try_begin() {
            return Err(Conflict);
        }
        self.store.set_operation_status(kind.status(), None).await;
        info!(operation = kind.label(), "operation admitted");

        let ctx = OperationContext { kind, deadline };
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run(ctx, body).await }))
    }

    async fn run<F, Fut>(&self, ctx: OperationContext, body: F)
    where
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = ctx.kind.label();
        let started = Instant::now();
        // Own task so a panic surfaces as a JoinError instead of unwinding here.
        let work = tokio::spawn(timeout_at(ctx.deadline, body(ctx)));

        let failure = match work.await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(format!("{e:#}")),
            Ok(Err(_)) => Some(format!(
                "{label} timed out after {:?}",
                ctx.deadline.saturating_duration_since(started)
            )),
            Err(e) if e.is_panic() => Some(format!("{label} panicked")),
            Err(e) => Some(format!("{label} aborted: {e}")),
        };

        match &failure {
            None => info!(operation = label, elapsed = ?started.elapsed(), "operation finished"),
            Some(err) => error!(operation = label, error = %err, "operation failed"),
        }
        // Status first: a client that sees the gate open also sees the outcome.
        self.store
            .set_operation_status(OperationStatus::Idle, failure)
            .await;
        self.admitted.store(false, Ordering::Release);
    }
}
