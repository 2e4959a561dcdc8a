mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use intake_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;

fn init_logging(config: &AppConfig) {
    use intake_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
        app.intake.clone(),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let intake = app.intake.clone();
    let mut worker = tokio::spawn(async move { intake.run(shutdown_rx).await });

    tracing::info!(
        event_name = "intake.server.started",
        correlation_id = "bootstrap",
        "intake-server started"
    );

    tokio::select! {
        signal = wait_for_shutdown() => signal?,
        joined = &mut worker => {
            tracing::error!(
                event_name = "intake.server.worker_exited",
                correlation_id = "shutdown",
                panicked = joined.is_err(),
                "intake loop exited before shutdown was requested"
            );
            app.db_pool.close().await;
            return Ok(());
        }
    }

    tracing::info!(
        event_name = "intake.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "intake-server stopping; finishing in-flight cycle"
    );
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, worker).await.is_err() {
        tracing::warn!(
            event_name = "intake.server.shutdown_timeout",
            correlation_id = "shutdown",
            "intake loop did not stop within the grace period"
        );
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
