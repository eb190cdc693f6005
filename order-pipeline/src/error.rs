use order_common::queue::QueueError;
use order_common::warehouse::SinkError;
use thiserror::Error;

/// Why a batch, or a single event, did not reach the warehouse.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("sink write failed after {attempts} attempts: {error}")]
    Transient { attempts: u32, error: SinkError },
    #[error("sink rejected the batch: {0}")]
    Permanent(SinkError),
    #[error("event of {size} bytes exceeds the batch limit of {limit} bytes")]
    EventTooLarge { size: usize, limit: usize },
    #[error("writer is closed")]
    WriterClosed,
}

/// Conditions that end the pipeline process.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("every worker lost the queue for longer than the grace period: {0}")]
    QueueUnavailable(QueueError),
    #[error("sink failed for longer than the grace period")]
    SinkUnavailable,
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to set up the sink: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to set up the queue: {0}")]
    Queue(#[from] QueueError),
    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
