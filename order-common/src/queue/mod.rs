//! Boundary to the message broker. The pipeline only relies on this contract:
//! pull one message at a time, then settle it with exactly one ack or nack.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod kafka;
pub mod memory;
mod offsets;

pub use offsets::OffsetTracker;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is unavailable: {0}")]
    Unavailable(String),
    #[error("failed to settle message {id}: {error}")]
    SettleFailed { id: String, error: String },
    #[error("failed to publish: {0}")]
    PublishFailed(String),
    #[error("subscription is closed")]
    Closed,
}

/// Broker-side acknowledgement of a single message.
pub trait Acknowledge: Send + Sync {
    fn ack(self: Box<Self>) -> Result<(), QueueError>;
    fn nack(self: Box<Self>) -> Result<(), QueueError>;
}

/// Settlement token of a pulled message. `ack` and `nack` consume it, so a
/// message is settled at most once. Dropping it without settling leaves the
/// message un-acked and the broker redelivers it.
pub struct Delivery {
    id: String,
    inner: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(id: String, inner: Box<dyn Acknowledge>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ack(self) -> Result<(), QueueError> {
        metrics::counter!("order_pipeline_messages_acked_total").increment(1);
        self.inner.ack()
    }

    pub fn nack(self) -> Result<(), QueueError> {
        metrics::counter!("order_pipeline_messages_nacked_total").increment(1);
        self.inner.nack()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub struct Message {
    pub payload: Bytes,
    /// Broker timestamp, used to report consumption lag
    pub published_at: Option<DateTime<Utc>>,
    pub delivery: Delivery,
}

/// A consumer bound to one subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next message, up to the subscription's poll timeout.
    /// `Ok(None)` means the timeout elapsed with nothing to consume.
    async fn pull(&self) -> Result<Option<Message>, QueueError>;

    /// Release consumer resources. Called once, after every in-flight
    /// message has been settled.
    async fn close(&self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Bytes)
        -> Result<(), QueueError>;
}
