//! Content deduplication for a personal media library: exact and perceptual
//! fingerprints, a durable scan queue and duplicate grouping, all serialized
//! through one job queue.

pub mod config;
pub mod core;
pub mod database;
pub mod services;

pub use config::AppConfig;
pub use database::Database;
pub use services::DedupService;
