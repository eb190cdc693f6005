//! Consume order events from Kafka and write them to the warehouse.
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use health::HealthRegistry;
use order_common::dead_letter::{DeadLetterSink, KafkaDeadLetterSink};
use order_common::kafka::create_kafka_producer;
use order_common::metrics::{serve, setup_metrics_recorder, status_router};
use order_common::queue::kafka::KafkaSubscription;
use order_common::queue::QueueError;
use order_common::retry::RetryPolicy;
use order_common::warehouse::postgres::PgWarehouse;
use order_common::warehouse::print::PrintSink;
use order_common::warehouse::WarehouseSink;
use order_pipeline::config::Config;
use order_pipeline::coordinator::{Coordinator, CoordinatorConfig};
use order_pipeline::error::PipelineError;
use order_pipeline::writer::Writer;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// librdkafka reports statistics every 10 seconds
const KAFKA_LIVENESS_DEADLINE: Duration = Duration::from_secs(30);

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;
    info!(
        "table {} accepts columns {:?}",
        config.sink_table,
        config.sink_table_schema.columns().collect::<Vec<_>>()
    );

    let liveness = HealthRegistry::new("liveness");

    let shutdown = CancellationToken::new();
    let recorder = setup_metrics_recorder();
    let router = status_router("order-pipeline", liveness.clone(), recorder);
    let bind = config.bind();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind, server_shutdown).await {
            error!("failed to serve status endpoints: {}", e);
        }
    });

    let sink: Arc<dyn WarehouseSink> = if config.print_sink {
        info!("writing batches to the log");
        Arc::new(PrintSink {})
    } else {
        let warehouse = PgWarehouse::new(&config.database_url, config.max_pg_connections).await?;
        Arc::new(warehouse)
    };

    let producer_liveness = liveness
        .register("rdkafka-producer".to_string(), KAFKA_LIVENESS_DEADLINE)
        .await;
    let producer = create_kafka_producer(&config.kafka, producer_liveness)
        .await
        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
    let dead_letters: Arc<dyn DeadLetterSink> = Arc::new(KafkaDeadLetterSink::new(
        producer,
        config.dead_letter_topic.as_str(),
    ));

    let consumer_liveness = liveness
        .register("rdkafka-consumer".to_string(), KAFKA_LIVENESS_DEADLINE)
        .await;
    let subscription =
        KafkaSubscription::subscribe(&config.kafka, &config.consumer, consumer_liveness)
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

    let writer_config = config.writer();
    let writer_liveness = liveness
        .register("writer".to_string(), writer_config.liveness_deadline())
        .await;
    let fatal = CancellationToken::new();
    let writer = Writer::start(
        sink,
        dead_letters.clone(),
        writer_config.clone(),
        writer_liveness,
        fatal.clone(),
    );

    let coordinator = Coordinator::new(
        Arc::new(subscription),
        dead_letters,
        writer,
        CoordinatorConfig {
            worker_pool_size: config.worker_pool_size,
            queue_grace_period: config.queue_grace_period.0,
            retry_policy: RetryPolicy::from(&config.retry_policy),
            // a worker can sit on a full writer channel for a whole flush cycle
            liveness_deadline: writer_config.liveness_deadline() + config.consumer.poll_timeout.0,
        },
        liveness,
        fatal,
    );

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_shutdown.cancel();
    });

    let result = coordinator.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = &result {
        error!("pipeline failed: {}", e);
    }
    result
}
