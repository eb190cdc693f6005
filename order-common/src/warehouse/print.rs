use async_trait::async_trait;

use super::{SinkError, WarehouseSink, WriteMode};
use crate::event::OrderEvent;
use crate::schema::TableName;

/// Logs every row instead of writing it anywhere. For local runs without a
/// database.
pub struct PrintSink {}

#[async_trait]
impl WarehouseSink for PrintSink {
    async fn append(
        &self,
        table: &TableName,
        rows: &[OrderEvent],
        mode: WriteMode,
    ) -> Result<usize, SinkError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of rows", %table, ?mode);
        let _enter = span.enter();

        for row in rows {
            tracing::info!("row: {:?}", row);
        }

        Ok(rows.len())
    }
}
