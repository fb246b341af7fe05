use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use zsnapd::api::create_router;
use zsnapd::config::{self, Config};
use zsnapd::daemon;
use zsnapd::zfs::{ZfsBackend, ZfsCli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zsnapd=info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        jobs_file = %config.jobs_file.display(),
        "starting zsnapd"
    );

    let jobs = config::load_jobs(&config.jobs_file)?;
    if jobs.is_empty() {
        tracing::warn!("no jobs configured, only the status API will run");
    }

    let cancel = CancellationToken::new();
    let zfs: Arc<dyn ZfsBackend> = Arc::new(ZfsCli::new());
    let (state, tasks) = daemon::start_jobs(&jobs, &config.hook_dir(), zfs, &cancel)?;

    let app = create_router(Arc::clone(&state));
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
