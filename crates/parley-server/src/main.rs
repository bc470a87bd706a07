use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use parley_gateway::Gateway;
use parley_server::build_router;
use parley_server::config::ServerConfig;

const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const UPLOAD_GC_INTERVAL: Duration = Duration::from_secs(30);
const SCHEDULE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_server=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(parley_db::Database::open(&config.db_path)?);

    let ai = config.completion_provider()?;
    let gateway = Gateway::new(db, config.gateway.clone(), ai).await?;

    // Housekeeping
    let sweeper = gateway.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TYPING_SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            sweeper.sweep_typing().await;
        }
    });
    let collector = gateway.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(UPLOAD_GC_INTERVAL);
        loop {
            tick.tick().await;
            collector.collect_abandoned_uploads().await;
        }
    });
    let scheduler = gateway.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SCHEDULE_INTERVAL);
        loop {
            tick.tick().await;
            scheduler.deliver_scheduled().await;
        }
    });

    let app = build_router(gateway.clone(), &config.gateway.upload_dir);

    info!("Parley server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
