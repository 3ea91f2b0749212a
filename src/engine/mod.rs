pub mod api;
pub mod config;
pub mod error;
pub mod language;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod packager;
pub mod pool;
pub mod sandbox;
pub mod sanitize;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::routes, config::EngineConfig, language::LanguageRegistry, metrics::MetricsRegistry,
    orchestrator::Orchestrator, pool::ContainerPool, sandbox::DockerSandbox,
    sandbox::SandboxRuntime,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let runtime: Arc<dyn SandboxRuntime> = Arc::new(
        DockerSandbox::connect(config.pool.limits.max_output_bytes)
            .context("sandbox runtime init failed")?,
    );
    let registry = Arc::new(LanguageRegistry::new(&config.pool));
    let metrics = Arc::new(MetricsRegistry::new());
    let pool = Arc::new(
        ContainerPool::initialize(
            runtime.clone(),
            &registry,
            config.pool.clone(),
            metrics.clone(),
        )
        .await,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        pool.clone(),
        runtime.clone(),
        metrics,
        &config,
    ));

    let app: Router = routes(orchestrator, config.max_code_bytes, config.max_input_bytes);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, runtime = runtime.name(), "code sandbox ready");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("sandbox server error");

    pool.shutdown().await;
    tracing::info!("code sandbox stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .init();
}
