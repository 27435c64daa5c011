use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use courtside::clock::SystemClock;
use courtside::config::{Config, PaymentMode};
use courtside::engine::ReservationEngine;
use courtside::notify::NotifyHub;
use courtside::scheduler;
use courtside::wal::WalRepository;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    courtside::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("courtside.wal");
    let repo = Arc::new(WalRepository::open(&wal_path)?);
    let notify = Arc::new(NotifyHub::new());

    let engine = ReservationEngine::start(
        repo.clone(),
        notify.clone(),
        Arc::new(SystemClock),
        config.engine.clone(),
    )
    .await?;

    info!("courtside started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  pending timers: {}", engine.pending_timers());
    info!(
        "  payment: {}",
        match config.engine.payment {
            PaymentMode::Immediate => "immediate".to_string(),
            PaymentMode::Deferred { hold_ms } => format!("deferred ({}s hold)", hold_ms / 1000),
        }
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweep_every = Duration::from_millis(config.sweep_interval_ms);
    tokio::spawn(scheduler::run_completion_sweep(engine.clone(), sweep_every));
    tokio::spawn(scheduler::run_compactor(
        repo.clone(),
        config.compact_threshold,
        Duration::from_secs(30),
    ));

    // Delivery transport is external; hand payloads to the log.
    let mut outbox = notify.subscribe_all();
    tokio::spawn(async move {
        loop {
            match outbox.recv().await {
                Ok(n) => debug!(user = %n.user_id(), "notification {}", n.to_json()),
                Err(RecvError::Lagged(skipped)) => warn!("notification log lagged, skipped {skipped}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await?;
    info!("shutdown signal received");
    if let Err(e) = repo.compact().await {
        warn!("final compaction failed: {e}");
    }
    info!("courtside stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
