use std::time::Duration;

use health::HealthHandle;
use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

/// Producer context: forwards librdkafka statistics to liveness and metrics.
pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(liveness: HealthHandle) -> Self {
        KafkaContext { liveness }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();

        gauge!("order_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("order_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("order_kafka_producer_queue_bytes").set(stats.msg_size as f64);

        for (_, stats) in stats.brokers {
            gauge!(
                "order_kafka_broker_requests_pending",
                "broker" => stats.nodeid.to_string()
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

/// Shared client settings for producers and consumers.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    client_config
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = client_config(config);
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

#[cfg(test)]
pub mod test {
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::{DefaultProducerContext, FutureProducer};

    use super::{create_kafka_producer, KafkaContext};
    use crate::config::KafkaConfig;

    pub async fn create_mock_kafka() -> (
        MockCluster<'static, DefaultProducerContext>,
        KafkaConfig,
        FutureProducer<KafkaContext>,
    ) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("rdkafka".to_string(), std::time::Duration::from_secs(30))
            .await;
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");

        let config = KafkaConfig {
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
            kafka_producer_linger_ms: 0,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
        };

        let producer = create_kafka_producer(&config, handle)
            .await
            .expect("failed to create mocked kafka producer");

        (cluster, config, producer)
    }
}
