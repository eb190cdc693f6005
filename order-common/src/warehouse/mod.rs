//! Boundary to the analytics warehouse: append a batch of rows to a table.
use async_trait::async_trait;
use thiserror::Error;

use crate::event::OrderEvent;
use crate::schema::TableName;

pub mod memory;
pub mod postgres;
pub mod print;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    AppendOnly,
    /// Insert, or overwrite the row holding the same `order_id`. Replaying a
    /// batch leaves the table unchanged.
    IdempotentUpsertByKey,
}

/// Failures reported by a sink, split by whether trying again can help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Network trouble, throttling, timeouts, unavailable backend
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// The sink refused the data itself, for example a schema incompatibility
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Write all `rows` to `table`, atomically: on error nothing was written.
    /// Returns how many rows the sink reports as written.
    async fn append(
        &self,
        table: &TableName,
        rows: &[OrderEvent],
        mode: WriteMode,
    ) -> Result<usize, SinkError>;
}
