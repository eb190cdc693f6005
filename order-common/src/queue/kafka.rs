use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{ClientContext, Message as _, Offset};
use tracing::{debug, error, info, warn};

use super::{Acknowledge, Delivery, Message, OffsetTracker, Publisher, QueueError, Subscription};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::kafka::{client_config, KafkaContext};

/// Bounds how long a nack blocks on repositioning the consumer.
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer context: reports liveness from librdkafka statistics and drops
/// offset bookkeeping for partitions taken away by a rebalance.
pub struct SubscriptionContext {
    liveness: HealthHandle,
    tracker: OffsetTracker,
}

impl ClientContext for SubscriptionContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        self.liveness.report_healthy_blocking();

        for (topic, topic_stats) in stats.topics {
            for (partition, partition_stats) in topic_stats.partitions {
                if partition < 0 || partition_stats.consumer_lag < 0 {
                    continue;
                }
                metrics::gauge!(
                    "order_kafka_consumer_lag",
                    "topic" => topic.clone(),
                    "partition" => partition.to_string()
                )
                .set(partition_stats.consumer_lag as f64);
            }
        }
    }
}

impl ConsumerContext for SubscriptionContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            if partitions.count() == 0 {
                return;
            }
            let revoked: Vec<i32> = partitions
                .elements()
                .iter()
                .map(|elem| elem.partition())
                .collect();
            info!("partitions revoked: {:?}", revoked);
            self.tracker.revoke(&revoked);
        }
    }
}

struct Inner {
    consumer: StreamConsumer<SubscriptionContext>,
    topic: String,
}

/// A Kafka consumer group member reading a single topic.
///
/// Offsets are stored manually: a message counts as consumed only once it and
/// every message before it on the same partition has been acked. A nack seeks
/// the partition back to the nacked message, which redelivers it together
/// with everything after it.
pub struct KafkaSubscription {
    inner: Arc<Inner>,
    poll_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaSubscription {
    pub fn subscribe(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config = client_config(kafka);
        client_config
            .set("group.id", &consumer.kafka_consumer_group)
            .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let context = SubscriptionContext {
            liveness,
            tracker: OffsetTracker::new(),
        };
        let stream_consumer: StreamConsumer<SubscriptionContext> =
            client_config.create_with_context(context)?;
        stream_consumer.subscribe(&[consumer.kafka_consumer_topic.as_str()])?;

        info!(
            "subscribed to {} as {}",
            consumer.kafka_consumer_topic, consumer.kafka_consumer_group
        );

        Ok(Self {
            inner: Arc::new(Inner {
                consumer: stream_consumer,
                topic: consumer.kafka_consumer_topic.clone(),
            }),
            poll_timeout: consumer.poll_timeout.0,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn pull(&self) -> Result<Option<Message>, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let received = tokio::time::timeout(self.poll_timeout, self.inner.consumer.recv()).await;
        let message = match received {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(QueueError::Unavailable(e.to_string())),
            Ok(Ok(message)) => message,
        };

        let partition = message.partition();
        let offset = message.offset();
        let payload = message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        let published_at = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis);

        self.inner
            .consumer
            .context()
            .tracker
            .track(partition, offset);

        Ok(Some(Message {
            payload,
            published_at,
            delivery: Delivery::new(
                format!("{}:{}", partition, offset),
                Box::new(KafkaDelivery {
                    handle: Arc::downgrade(&self.inner),
                    partition,
                    offset,
                }),
            ),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.inner.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => info!("committed stored offsets"),
            // nothing was stored since the last auto commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => return Err(QueueError::Unavailable(e.to_string())),
        }
        self.inner.consumer.unsubscribe();
        Ok(())
    }
}

struct KafkaDelivery {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl KafkaDelivery {
    fn settle_failed(&self, error: String) -> QueueError {
        QueueError::SettleFailed {
            id: format!("{}:{}", self.partition, self.offset),
            error,
        }
    }
}

impl Acknowledge for KafkaDelivery {
    fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let inner = self
            .handle
            .upgrade()
            .ok_or_else(|| self.settle_failed("consumer gone".to_owned()))?;

        let tracker = &inner.consumer.context().tracker;
        if let Some(watermark) = tracker.ack(self.partition, self.offset) {
            inner
                .consumer
                .store_offset(&inner.topic, self.partition, watermark)
                .map_err(|e| self.settle_failed(e.to_string()))?;
        }
        Ok(())
    }

    fn nack(self: Box<Self>) -> Result<(), QueueError> {
        let inner = self
            .handle
            .upgrade()
            .ok_or_else(|| self.settle_failed("consumer gone".to_owned()))?;

        let tracker = &inner.consumer.context().tracker;
        let rewound = tracker.rewind(self.partition, self.offset, || {
            inner.consumer.seek(
                &inner.topic,
                self.partition,
                Offset::Offset(self.offset),
                SEEK_TIMEOUT,
            )
        });

        match rewound {
            Ok(()) => {
                warn!(
                    partition = self.partition,
                    offset = self.offset,
                    "message nacked, partition rewound for redelivery"
                );
                Ok(())
            }
            Err(e) => {
                // offset stays pending, so the watermark cannot pass it
                error!(
                    partition = self.partition,
                    offset = self.offset,
                    "failed to rewind partition after nack: {}",
                    e
                );
                Err(self.settle_failed(e.to_string()))
            }
        }
    }
}

/// Produces to any topic through a shared `FutureProducer`, waiting for the
/// broker ack of every message.
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), QueueError> {
        let record = FutureRecord {
            topic,
            key,
            payload: Some(payload.as_ref()),
            partition: None,
            timestamp: None,
            headers: None,
        };

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| QueueError::PublishFailed(e.to_string()))?;

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(QueueError::PublishFailed(e.to_string())),
            Err(_) => Err(QueueError::PublishFailed(
                "delivery cancelled before write timeout".to_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use health::HealthRegistry;

    use super::*;
    use crate::config::EnvMsDuration;
    use crate::kafka::test::create_mock_kafka;

    async fn subscribe(kafka_config: &KafkaConfig, group: &str) -> KafkaSubscription {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("subscription".to_string(), Duration::from_secs(30))
            .await;
        let consumer_config = ConsumerConfig {
            kafka_consumer_group: group.to_string(),
            kafka_consumer_topic: "orders".to_string(),
            kafka_consumer_offset_reset: "earliest".to_string(),
            poll_timeout: EnvMsDuration(Duration::from_secs(10)),
        };
        KafkaSubscription::subscribe(kafka_config, &consumer_config, liveness)
            .expect("failed to subscribe")
    }

    async fn pull(subscription: &KafkaSubscription) -> Message {
        subscription
            .pull()
            .await
            .expect("failed to pull")
            .expect("no message before poll timeout")
    }

    #[tokio::test]
    async fn test_publish_then_pull_and_ack() {
        let (cluster, kafka_config, producer) = create_mock_kafka().await;
        cluster
            .create_topic("orders", 1, 1)
            .expect("failed to create topic");

        let publisher = KafkaPublisher::new(producer);
        publisher
            .publish("orders", Some("A1"), Bytes::from_static(b"{\"order_id\":\"A1\"}"))
            .await
            .expect("failed to publish");

        let subscription = subscribe(&kafka_config, "orders-test").await;

        let message = pull(&subscription).await;
        assert_eq!(
            message.payload,
            Bytes::from_static(b"{\"order_id\":\"A1\"}")
        );
        assert!(message.published_at.is_some());
        assert_eq!(message.delivery.id(), "0:0");

        message.delivery.ack().expect("failed to ack");
        subscription.close().await.expect("failed to close");
        assert_eq!(subscription.pull().await.unwrap_err(), QueueError::Closed);
    }

    #[tokio::test]
    async fn test_nacked_message_is_delivered_again() {
        let (cluster, kafka_config, producer) = create_mock_kafka().await;
        cluster
            .create_topic("orders", 1, 1)
            .expect("failed to create topic");

        let publisher = KafkaPublisher::new(producer);
        for payload in [&b"m0"[..], &b"m1"[..]] {
            publisher
                .publish("orders", None, Bytes::copy_from_slice(payload))
                .await
                .expect("failed to publish");
        }

        let subscription = subscribe(&kafka_config, "orders-nack-test").await;
        let first = pull(&subscription).await;
        let second = pull(&subscription).await;
        assert_eq!(first.payload, Bytes::from_static(b"m0"));

        first.delivery.nack().expect("failed to nack");
        second.delivery.ack().expect("failed to ack");

        let redelivered = pull(&subscription).await;
        assert_eq!(redelivered.delivery.id(), "0:0");
        assert_eq!(redelivered.payload, Bytes::from_static(b"m0"));
        let next = pull(&subscription).await;
        assert_eq!(next.delivery.id(), "0:1");

        redelivered.delivery.ack().expect("failed to ack");
        next.delivery.ack().expect("failed to ack");
        assert_eq!(subscription.inner.consumer.context().tracker.pending(0), 0);
        subscription.close().await.expect("failed to close");
    }
}
