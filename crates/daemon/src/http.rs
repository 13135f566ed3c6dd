use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use buildenv_core::api::{AcceptedResponse, ErrorResponse, TaskRunRequest};
use buildenv_core::jobspec::JobSpec;
use buildenv_core::model::EnvironmentSnapshot;
use thiserror::Error;
use tracing::info;

use crate::coordinator::{OperationContext, OperationCoordinator, OperationKind};
use crate::deploy::DeployTarget;
use crate::ops::Operations;
use crate::store::SnapshotStore;

#[derive(Clone)]
pub struct AppState {
    store: Arc<SnapshotStore>,
    coordinator: Arc<OperationCoordinator>,
    ops: Arc<Operations>,
    /// Set while a git sync runs; independent of the operation gate.
    syncing: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        store: Arc<SnapshotStore>,
        coordinator: Arc<OperationCoordinator>,
        ops: Arc<Operations>,
    ) -> Self {
        Self {
            store,
            coordinator,
            ops,
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Admits `kind` and runs `work` in the background.
    async fn admit<F, Fut>(&self, kind: OperationKind, work: F) -> Result<Accepted, ApiError>
    where
        F: FnOnce(Arc<Operations>, OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let ops = Arc::clone(&self.ops);
        self.coordinator
            .launch(kind, move |ctx| work(ops, ctx))
            .await
            .map_err(|e| ApiError::Conflict(e.to_string()))?;
        Ok(Accepted(AcceptedResponse::new(kind.accepted_message())))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/rebuild", post(rebuild))
        .route("/api/mpc/deploy", post(deploy_mpc))
        .route("/api/mpc/rebuild-and-redeploy", post(rebuild_and_redeploy))
        .route("/api/deploy/secrets", post(deploy_secrets))
        .route("/api/deploy/konflux", post(deploy_konflux))
        .route("/api/deploy/minimal-stack", post(deploy_minimal_stack))
        .route("/api/taskrun/run", post(run_taskrun))
        .route("/api/git/sync", post(git_sync))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(st): State<AppState>) -> Json<EnvironmentSnapshot> {
    Json(st.store.read().await)
}

async fn rebuild(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    st.admit(OperationKind::Rebuild, |ops, _| async move { ops.rebuild().await })
        .await
}

async fn rebuild_and_redeploy(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    st.admit(OperationKind::RebuildAndRedeploy, |ops, _| async move {
        ops.rebuild_and_redeploy().await
    })
    .await
}

async fn deploy(
    st: AppState,
    kind: OperationKind,
    target: DeployTarget,
) -> Result<Accepted, ApiError> {
    st.admit(kind, move |ops, _| async move { ops.deploy(target).await })
        .await
}

async fn deploy_mpc(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    deploy(st, OperationKind::DeployMpc, DeployTarget::Mpc).await
}

async fn deploy_secrets(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    deploy(st, OperationKind::DeploySecrets, DeployTarget::Secrets).await
}

async fn deploy_konflux(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    deploy(st, OperationKind::DeployKonflux, DeployTarget::Konflux).await
}

async fn deploy_minimal_stack(State(st): State<AppState>) -> Result<Accepted, ApiError> {
    deploy(st, OperationKind::DeployMinimalStack, DeployTarget::MinimalStack).await
}

async fn run_taskrun(
    State(st): State<AppState>,
    body: Result<Json<TaskRunRequest>, JsonRejection>,
) -> Result<Accepted, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let path = req
        .yaml_path
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| ApiError::BadRequest("yaml_path is required".into()))?;

    // Validated up front so a bad file never occupies the gate.
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::BadRequest(format!("read {}: {e}", path.display())))?;
    let spec = JobSpec::from_yaml_str(&text)
        .and_then(|spec| spec.validate().map(|()| spec))
        .map_err(|e| ApiError::BadRequest(format!("{}: {e}", path.display())))?;

    st.admit(OperationKind::RunTaskRun, move |ops, ctx| async move {
        ops.run_taskrun(spec, &path, ctx.deadline).await
    })
    .await
}

async fn git_sync(State(st): State<AppState>) -> Accepted {
    if st
        .syncing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        info!("git sync already running; request skipped");
        return Accepted(AcceptedResponse::new("git sync already in progress"));
    }
    let ops = Arc::clone(&st.ops);
    let syncing = Arc::clone(&st.syncing);
    tokio::spawn(async move {
        ops.sync_all().await;
        syncing.store(false, Ordering::Release);
    });
    Accepted(AcceptedResponse::new("git sync started"))
}

/// 202 with an [`AcceptedResponse`] body.
pub struct Accepted(AcceptedResponse);

impl IntoResponse for Accepted {
    fn into_response(self) -> Response {
        (StatusCode::ACCEPTED, Json(self.0)).into_response()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, body) = match &self {
            ApiError::Conflict(e) => (StatusCode::CONFLICT, ErrorResponse::conflict(e)),
            ApiError::BadRequest(e) => (StatusCode::BAD_REQUEST, ErrorResponse::error(e)),
        };
        tracing::debug!(status = %code, error = %body.error, "request rejected");
        (code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        snapshot, FakeApplier, FakeBuilder, FakeCluster, FakeEngine, FakeRepos, SAMPLE_JOB,
    };
    use crate::tracker::{ExecutionTracker, TrackerConfig};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use buildenv_core::model::OperationStatus;
    use serde_json::Value;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    fn state(applier: FakeApplier) -> AppState {
        let engine = FakeEngine::scripted(vec![vec![]]);
        let repos = FakeRepos::new();
        let store = Arc::new(SnapshotStore::new(
            snapshot(),
            FakeCluster::running(),
            repos.clone(),
            vec![],
        ));
        let ops = Arc::new(Operations {
            store: store.clone(),
            tracker: ExecutionTracker::new(engine.clone(), engine, TrackerConfig::default()),
            builder: Arc::new(FakeBuilder::default()),
            applier: Arc::new(applier),
            git: repos,
            repositories: vec![],
            images: vec![],
            logs_dir: std::env::temp_dir(),
        });
        let coordinator = Arc::new(OperationCoordinator::new(store.clone()));
        AppState::new(store, coordinator, ops)
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn second_deploy_conflicts() {
        let gate = Arc::new(Semaphore::new(0));
        let st = state(FakeApplier::gated(gate.clone()));
        let app = router(st.clone());

        let first = app
            .clone()
            .oneshot(post("/api/mpc/deploy", Body::empty()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let body = json(first).await;
        assert_eq!(body["status"], "accepted");

        let second = app
            .clone()
            .oneshot(post("/api/mpc/deploy", Body::empty()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let body = json(second).await;
        assert_eq!(body["status"], "conflict");
        assert!(body["error"].as_str().unwrap().contains("already in progress"));

        let snap = json(
            app.oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(snap["operation_status"], "deploying_mpc");
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn taskrun_without_path_is_bad_request() {
        let st = state(FakeApplier::default());
        let resp = router(st.clone())
            .oneshot(post("/api/taskrun/run", Body::from("{}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(resp).await["error"], "yaml_path is required");
        assert!(!st.coordinator.is_busy());
    }

    #[tokio::test]
    async fn malformed_taskrun_file_is_never_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, SAMPLE_JOB.replace("TaskRun", "PipelineRun")).unwrap();

        let st = state(FakeApplier::default());
        let body = serde_json::json!({ "yaml_path": path }).to_string();
        let resp = router(st.clone())
            .oneshot(post("/api/taskrun/run", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!st.coordinator.is_busy());
        assert_eq!(st.store.read().await.operation_status, OperationStatus::Idle);
    }

    #[tokio::test]
    async fn valid_taskrun_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify.yaml");
        std::fs::write(&path, SAMPLE_JOB).unwrap();

        let st = state(FakeApplier::default());
        let body = serde_json::json!({ "yaml_path": path }).to_string();
        let resp = router(st.clone())
            .oneshot(post("/api/taskrun/run", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json(resp).await["message"], "taskrun execution started");
    }

    #[tokio::test]
    async fn git_sync_ignores_the_gate() {
        let st = state(FakeApplier::default());
        assert!(st.coordinator.try_begin());
        let resp = router(st)
            .oneshot(post("/api/git/sync", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn git_sync_runs_one_at_a_time() {
        let st = state(FakeApplier::default());
        st.syncing.store(true, Ordering::SeqCst);
        let resp = router(st.clone())
            .oneshot(post("/api/git/sync", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(json(resp).await["message"], "git sync already in progress");
        assert!(st.syncing.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn git_sync_releases_its_flag() {
        let st = state(FakeApplier::default());
        let resp = router(st.clone())
            .oneshot(post("/api/git/sync", Body::empty()))
            .await
            .unwrap();
        assert_eq!(json(resp).await["message"], "git sync started");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while st.syncing.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn healthz_and_status() {
        let app = router(state(FakeApplier::default()));
        let resp = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let snap = json(resp).await;
        assert_eq!(snap["session_id"], "test-session");
        assert_eq!(snap["operation_status"], "idle");
        assert!(snap["repositories"].as_object().unwrap().is_empty());
    }
}
