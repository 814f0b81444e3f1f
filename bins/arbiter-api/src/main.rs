mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use arbiter_common::config::ServiceConfig;
use arbiter_engine::docker::DockerSubstrate;
use arbiter_engine::materializer::SubmissionMaterializer;
use arbiter_engine::provisioner::SandboxProvisioner;
use arbiter_engine::{ExecutionPolicy, LanguageRegistry, Orchestrator};
use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often expired submission directories are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub started_at: DateTime<Utc>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Periodically remove submission directories left behind by a crash.
fn spawn_sweeper(materializer: SubmissionMaterializer, ttl: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = materializer.sweep_expired(ttl).await {
                        warn!(error = %e, root = %materializer.root().display(), "Sweep failed");
                    }
                }
            }
        }
    });
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to install CTRL+C signal handler");
        std::future::pending::<()>().await;
    }
    warn!("Received shutdown signal, draining in-flight submissions...");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_json);

    info!("Arbiter API booting...");

    let registry = LanguageRegistry::load(&config.languages_path).map_err(|e| {
        error!("Make sure {} exists", config.languages_path.display());
        e
    })?;
    info!(languages = ?registry.list(), "Loaded language configurations");

    let substrate = DockerSubstrate::connect().context("Failed to connect to Docker")?;
    substrate.ping().await.context("Docker daemon is not reachable")?;
    match substrate.reap_orphans().await {
        Ok(0) => {}
        Ok(reaped) => info!(reaped, "Removed orphaned sandbox containers"),
        Err(e) => warn!(error = %e, "Failed to reap orphaned sandbox containers"),
    }

    let materializer = SubmissionMaterializer::new(&config.submissions_root);
    materializer
        .prepare_root()
        .await
        .with_context(|| format!("Failed to prepare {}", config.submissions_root.display()))?;
    if let Err(e) = materializer.sweep_expired(config.submission_ttl).await {
        warn!(error = %e, "Startup sweep failed");
    }

    let mut provisioner = SandboxProvisioner::new(Arc::new(substrate), config.sandbox_user.clone())?;
    if let Some(host_root) = &config.host_submissions_root {
        info!(
            local = %config.submissions_root.display(),
            host = %host_root.display(),
            "Translating submission bind mounts to host paths"
        );
        provisioner = provisioner.with_host_root(config.submissions_root.clone(), host_root.clone());
    }

    let policy = ExecutionPolicy::from_config(&config);
    info!(
        max_concurrency = policy.max_concurrency,
        default_timeout_ms = policy.default_timeout.as_millis() as u64,
        max_timeout_ms = policy.max_timeout.as_millis() as u64,
        sandbox_user = %config.sandbox_user,
        "Execution policy"
    );
    let orchestrator = Orchestrator::new(Arc::new(registry), materializer, provisioner, policy)?;

    let shutdown = CancellationToken::new();
    spawn_sweeper(
        SubmissionMaterializer::new(&config.submissions_root),
        config.submission_ttl,
        shutdown.clone(),
    );

    let state = Arc::new(AppState {
        orchestrator,
        started_at: Utc::now(),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error")?;

    info!("Arbiter API shutdown complete");
    Ok(())
}
