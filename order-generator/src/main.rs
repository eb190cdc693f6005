//! Publish random orders to Kafka at a steady rate.
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use order_common::kafka::create_kafka_producer;
use order_common::metrics::{serve, setup_metrics_recorder, status_router};
use order_common::queue::kafka::KafkaPublisher;
use order_generator::config::Config;
use order_generator::generator::{generate, orders};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// librdkafka reports statistics every 10 seconds
const KAFKA_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let settings = config.settings()?;

    let liveness = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();

    let recorder = setup_metrics_recorder();
    let router = status_router("order-generator", liveness.clone(), recorder);
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind, server_shutdown).await {
            error!("failed to serve status endpoints: {}", e);
        }
    });

    let producer_liveness = liveness
        .register("rdkafka".to_string(), KAFKA_LIVENESS_DEADLINE)
        .await;
    let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
    let publisher = KafkaPublisher::new(producer);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!("failed to listen for shutdown signals: {}", e);
        }
        signal_shutdown.cancel();
    });

    generate(&publisher, orders(), &settings, shutdown.clone()).await;
    shutdown.cancel();

    Ok(())
}
