#![forbid(unsafe_code)]

//! buildenv daemon: HTTP control surface for the local build environment.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use buildenv_core::model::{ClusterFacts, EnvironmentSnapshot};
use buildenv_core::new_session_id;
use buildenv_daemon::{
    builder::CliImageBuilder,
    cluster::KindCluster,
    config::DaemonConfig,
    coordinator::OperationCoordinator,
    deploy::KubectlApplier,
    engine::KubectlEngine,
    http,
    ops::Operations,
    reconciler::GitReconciler,
    refresher::spawn_refresher,
    store::SnapshotStore,
    tracker::ExecutionTracker,
};
use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "buildenv-daemon")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory for per-job output logs; overrides the config file.
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Log level (env-filter syntax). Falls back to RUST_LOG, then `info`.
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut cfg = match &cli.config {
        Some(path) => DaemonConfig::load_from(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(dir) = cli.logs_dir {
        cfg.logs_dir = dir;
    }
    let listen: SocketAddr = match cli.listen {
        Some(addr) => addr,
        None => cfg
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {:?}", cfg.listen))?,
    };
    tokio::fs::create_dir_all(&cfg.logs_dir)
        .await
        .with_context(|| format!("create {}", cfg.logs_dir.display()))?;

    let context = format!("kind-{}", cfg.cluster.name);
    let cluster = Arc::new(KindCluster::new(
        cfg.cluster.name.clone(),
        cfg.cluster.kubeconfig.clone(),
        cfg.cluster.stack_namespace.clone(),
    ));
    let git = Arc::new(GitReconciler::new(
        cfg.git.upstream_remote.clone(),
        Duration::from_secs(cfg.git.fetch_timeout_secs),
    ));
    let engine = Arc::new(KubectlEngine::new(
        cfg.cluster.namespace.clone(),
        cfg.cluster.kubeconfig.clone(),
        Some(context.clone()),
    ));

    let snapshot = EnvironmentSnapshot::new(
        new_session_id(),
        ClusterFacts::unknown(
            cfg.cluster.name.clone(),
            cfg.cluster
                .kubeconfig
                .as_ref()
                .map(|p| p.display().to_string()),
        ),
        cfg.features,
    );
    let store = Arc::new(SnapshotStore::new(
        snapshot,
        cluster,
        git.clone(),
        cfg.repositories.clone(),
    ));

    // Initial full scan before serving.
    let report = store.refresh().await;
    tracing::info!(
        cluster = ?report.cluster,
        repositories = report.repositories,
        failed = report.failed_repositories,
        "initial scan done"
    );
    spawn_refresher(
        Arc::clone(&store),
        Duration::from_secs(cfg.refresh_interval_secs),
    );

    let ops = Arc::new(Operations {
        store: Arc::clone(&store),
        tracker: ExecutionTracker::new(
            engine.clone(),
            engine,
            cfg.tracker.to_tracker_config(),
        ),
        builder: Arc::new(CliImageBuilder::new(
            cfg.images.builder.clone(),
            cfg.cluster.name.clone(),
        )),
        applier: Arc::new(KubectlApplier::new(
            cfg.deploy.clone(),
            cfg.cluster.kubeconfig.clone(),
            context,
        )),
        git,
        repositories: cfg.repositories.clone(),
        images: cfg.images.images.clone(),
        logs_dir: cfg.logs_dir.clone(),
    });
    let coordinator = Arc::new(OperationCoordinator::new(Arc::clone(&store)));

    let app = http::router(http::AppState::new(store, coordinator, ops))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!(%listen, "daemon starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
