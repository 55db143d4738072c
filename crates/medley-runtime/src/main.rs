//! The `medley` daemon: assemble, supervise, run until a signal or a root
//! escalation.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use medley_runtime::{MedleyConfig, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = MedleyConfig::from_env()?;
    info!(
        producer_wal = %config.producer_wal_path.display(),
        consumer_wal = %config.consumer_wal_path.display(),
        broker = %config.broker_path.display(),
        analytics = %config.analytics_db_path.display(),
        "medley starting"
    );

    let pipeline = Pipeline::assemble(config).await?;

    // Upstream adapters are configured by the deployment; the daemon ships
    // with none wired by default and the external surfaces attach their own
    // (webhook queues, pollers) through the adapter registry.
    let mut supervisor = pipeline.into_supervisor(Vec::new());
    let mut escalations = supervisor.escalations();
    supervisor.start().await;
    info!("medley running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        escalation = escalations.recv() => {
            if let Some(escalation) = escalation {
                error!(service = %escalation.service, "restart budget exhausted, shutting down");
            }
        }
    }

    let laggards = supervisor.shutdown().await;
    if laggards.is_empty() {
        info!("medley stopped cleanly");
        Ok(())
    } else {
        error!(?laggards, "some services missed the shutdown deadline");
        std::process::exit(1);
    }
}
