use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fleet_supervisor::config::Config;
use fleet_supervisor::provisioner::LoggingProvisioner;
use fleet_supervisor::supervisor::Supervisor;
use fleet_supervisor::{scheduler, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("FLEET_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cfg = Config::load();
    let pool = store::pool::connect(&cfg.database_url).await?;

    let supervisor = Supervisor::new(
        pool.clone(),
        Arc::new(LoggingProvisioner),
        cfg.state_timeouts,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let scheduler_handle = tokio::spawn(scheduler::run(supervisor, cfg.tick_interval, shutdown_rx));

    shutdown_signal().await;
    shutdown_tx.send(())?;
    scheduler_handle.await?;

    tracing::info!("fleet supervisor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
