use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::kafka::KafkaContext;
use crate::parse::RejectionReason;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MalformedEncoding,
    SchemaMismatch,
    InvalidValue,
    SinkTransientFailure,
    SinkPermanentFailure,
    EventTooLarge,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MalformedEncoding => "malformed_encoding",
            DeadLetterReason::SchemaMismatch => "schema_mismatch",
            DeadLetterReason::InvalidValue => "invalid_value",
            DeadLetterReason::SinkTransientFailure => "sink_transient_failure",
            DeadLetterReason::SinkPermanentFailure => "sink_permanent_failure",
            DeadLetterReason::EventTooLarge => "event_too_large",
        }
    }
}

impl From<&RejectionReason> for DeadLetterReason {
    fn from(reason: &RejectionReason) -> Self {
        match reason {
            RejectionReason::MalformedEncoding => DeadLetterReason::MalformedEncoding,
            RejectionReason::SchemaMismatch { .. } => DeadLetterReason::SchemaMismatch,
            RejectionReason::InvalidValue { .. } => DeadLetterReason::InvalidValue,
        }
    }
}

/// A message that will not be retried, with enough context for a
/// remediation job to reprocess it: the raw payload and why it failed.
///
/// Terminal: nothing in the pipeline reads dead letters back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub reason: DeadLetterReason,
    pub detail: String,
    /// Only known when the payload parsed
    pub order_id: Option<String>,
    pub failed_at: DateTime<Utc>,
    #[serde(with = "base64_payload")]
    pub payload: Bytes,
}

impl DeadLetterRecord {
    pub fn rejected(payload: Bytes, reason: &RejectionReason) -> Self {
        Self {
            reason: reason.into(),
            detail: reason.to_string(),
            order_id: None,
            failed_at: Utc::now(),
            payload,
        }
    }

    pub fn write_failed(
        payload: Bytes,
        order_id: &str,
        reason: DeadLetterReason,
        detail: String,
    ) -> Self {
        Self {
            reason,
            detail,
            order_id: Some(order_id.to_owned()),
            failed_at: Utc::now(),
            payload,
        }
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce dead letter: {0}")]
    Produce(String),
}

/// Destination for records that leave the pipeline without reaching the warehouse.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably record every given record, or fail as a whole.
    async fn record(&self, records: Vec<DeadLetterRecord>) -> Result<(), DeadLetterError>;
}

/// Dead letters produced as JSON to a Kafka topic, keyed by `order_id` when known.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn record(&self, records: Vec<DeadLetterRecord>) -> Result<(), DeadLetterError> {
        let mut deliveries = Vec::with_capacity(records.len());

        for record in &records {
            let payload = serde_json::to_string(record)?;
            let future_record = FutureRecord {
                topic: self.topic.as_str(),
                key: record.order_id.as_deref(),
                payload: Some(&payload),
                partition: None,
                timestamp: None,
                headers: None,
            };

            match self.producer.send_result(future_record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => {
                    error!("failed to enqueue dead letter: {}", e);
                    return Err(DeadLetterError::Produce(e.to_string()));
                }
            }
        }

        // Wait for every broker ack, the batch counts as recorded only if all landed
        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(DeadLetterError::Produce(e.to_string())),
                Err(_) => {
                    warn!("dead letter delivery cancelled before write timeout");
                    return Err(DeadLetterError::Produce("delivery cancelled".to_owned()));
                }
            }
        }

        Ok(())
    }
}

/// Keeps dead letters in memory, where they can be inspected. Used for local
/// runs and tests.
#[derive(Clone, Default)]
pub struct MemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, records: Vec<DeadLetterRecord>) -> Result<(), DeadLetterError> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| DeadLetterError::Produce("poisoned dead letter store".to_owned()))?;
        stored.extend(records);
        Ok(())
    }
}
