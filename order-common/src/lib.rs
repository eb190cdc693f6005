//! Shared building blocks for the order ingestion services: the event model
//! and its parser, the queue and warehouse contracts with their
//! implementations, dead-letter handling and the ambient metrics/retry pieces.
pub mod config;
pub mod dead_letter;
pub mod event;
pub mod kafka;
pub mod metrics;
pub mod parse;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod warehouse;
