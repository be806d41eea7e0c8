pub mod config;
pub mod error;
pub mod health;
pub mod ingestion;
pub mod janitor;
pub mod matcher;
pub mod merge;
pub mod publisher;
pub mod serve_metrics;
pub mod worker;
