use anyhow::Context;
use clap::Parser;
use fleetwatch::consumer::{create_telemetry_consumer, ConsumerConfig};
use fleetwatch::dispatch::{EventDispatcher, TelemetryHandler};
use fleetwatch::handlers::{DebugMirrorHandler, LogAlertNotifier, SentryAlertHandler};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetwatch")]
#[command(about = "Vehicle telemetry ingestion pipeline", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.debug {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        fleetwatch::init_tracing();
    }

    let config = ConsumerConfig::from_env().map_err(|err| anyhow::anyhow!(err))?;
    info!(
        version = fleetwatch::VERSION,
        brokers = %config.brokers,
        topic = %config.topic,
        group = %config.group_id,
        "starting telemetry pipeline"
    );

    let mut handlers: Vec<Arc<dyn TelemetryHandler>> =
        vec![Arc::new(SentryAlertHandler::new(Arc::new(LogAlertNotifier)))];
    if let Some(mirror_topic) = config.mirror_topic.clone() {
        let mirror = DebugMirrorHandler::new(&config.brokers, mirror_topic)
            .context("failed to create mirror producer")?;
        handlers.push(Arc::new(mirror));
    }
    let dispatcher = Arc::new(EventDispatcher::new(handlers));

    let consumer = create_telemetry_consumer(config, dispatcher)?;

    let shutdown = consumer.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.cancel();
        }
    });

    // Exhausted startup connection attempts surface here and abort the
    // process; everything else is contained inside the pipeline.
    consumer.run().await.context("telemetry consumer failed")?;
    Ok(())
}
