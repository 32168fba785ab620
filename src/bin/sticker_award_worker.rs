//! sticker-award-worker: welcome sticker worker
//!
//! Consumes `users.userRegistered.v1` from the configured broker and asks
//! the award API to assign the welcome sticker to each new account.
//!
//! ## Configuration
//! - STICKER_AWARD_CONFIG: Optional YAML config file
//! - STICKER_AWARD__MESSAGING_PROVIDER: kafka or aws
//! - KAFKA_BROKERS: Comma-separated Kafka bootstrap servers
//! - EVENT_BUS_NAME / USER_REGISTERED_QUEUE_URL / AWS_REGION: AWS deployment
//! - STICKER_AWARD_LOG: Log filter (overrides `logging.level`)
//! - OTEL_EXPORTER_OTLP_ENDPOINT: Enables span and metric export

use std::sync::Arc;

use tracing::{error, info, warn};

use sticker_award::bus::lifecycle::termination_signal;
use sticker_award::bus::{new_consumer, MessageConsumer};
use sticker_award::clients::HttpWelcomeStickerAssigner;
use sticker_award::config::Config;
use sticker_award::handlers::UserRegisteredHandler;
use sticker_award::utils::bootstrap::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(None)?;
    let guard = init_tracing(&config.logging, &config.service_name)?;

    let result = run(&config).await;
    if let Err(e) = &result {
        error!(error = %e, "Worker exited with error");
    }

    shutdown_tracing(guard);
    result
}

async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let assigner = Arc::new(HttpWelcomeStickerAssigner::new(config.awards.clone())?);

    let mut consumer = new_consumer(&config.messaging()).await?;
    consumer.register_handler(UserRegisteredHandler::registration(assigner))?;
    let consumer: Arc<dyn MessageConsumer> = Arc::from(consumer);

    info!(
        service = %config.service_name,
        provider = %config.messaging_provider,
        "Starting sticker award worker"
    );

    let runner = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.start().await })
    };
    tokio::pin!(runner);

    tokio::select! {
        joined = &mut runner => {
            joined??;
            info!("Consumer stopped");
            return Ok(());
        }
        _ = termination_signal() => {
            info!("Shutdown signal received, draining in-flight messages");
        }
    }

    let grace = config.shutdown_grace();
    match tokio::time::timeout(grace, consumer.stop()).await {
        Ok(stopped) => stopped?,
        Err(_) => warn!(grace = ?grace, "Shutdown grace period elapsed before drain completed"),
    }

    match tokio::time::timeout(grace, &mut runner).await {
        Ok(joined) => joined??,
        Err(_) => warn!("Consumer did not exit within the grace period"),
    }

    info!("Sticker award worker stopped");
    Ok(())
}
