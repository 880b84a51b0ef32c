//! gitpulse: GitHub ingestion, enrichment and contributor ranking pipeline.
//!
//! Raw API payloads land in an append-only intake table, are extracted into
//! normalized entities, enriched with follow-up API calls, and finally turned
//! into repository statistics and population-wide contributor rankings. Each
//! stage runs as a background pipeline job gated to one active run per type.

pub mod config;
pub mod github;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod schema;

pub use config::Settings;
