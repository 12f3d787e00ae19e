use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use shared::observability::init_logging;
use strike_ledger::config::Config;
use strike_ledger::PenaltyLedger;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (also reads .env)
    let config = Config::from_env()?;
    config.validate()?;

    // Initialize tracing
    init_logging(config.logging.to_log_config("strike-ledger")?)?;
    info!("Starting Strike Ledger...");

    let ledger = Arc::new(
        PenaltyLedger::from_config(&config.ledger).context("Failed to open strike ledger")?,
    );

    // Refuse to run against a document we cannot read; reclaiming or adding
    // strikes on top of it would hide the damage.
    let snapshot = match ledger.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) if e.is_corrupt() => {
            error!(
                error = %e,
                "Strike ledger document is corrupt; restore it from backup \
                 or remove it to start empty"
            );
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        path = %config.ledger.data_file.display(),
        users = snapshot.user_count(),
        strikes = snapshot.record_count(),
        "Strike ledger loaded"
    );

    if config.reclamation.enabled {
        ledger.start_reclamation(config.reclamation.interval()).await?;
    } else {
        warn!("Reclamation pass disabled; expired strikes will only be filtered at read time");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    ledger.shutdown().await;
    info!("Strike Ledger stopped");

    Ok(())
}
