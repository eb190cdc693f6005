//! Consume order events from Kafka, validate them and write them in batches
//! to the warehouse, dead-lettering what cannot be written.
pub mod config;
pub mod coordinator;
pub mod error;
pub mod writer;
