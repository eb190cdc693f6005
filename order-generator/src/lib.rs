//! Synthetic order traffic for exercising the ingestion pipeline.
pub mod config;
pub mod generator;
