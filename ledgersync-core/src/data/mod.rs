//! Data sources and the HTTP plumbing they share

pub mod adp;
pub mod circuit_breaker;
pub mod factory;
pub mod http;
pub mod ledgerlinker;
pub mod prosper;
pub mod provider;
pub mod sheets;

pub use circuit_breaker::CircuitBreaker;
pub use factory::{create_source, create_sources, required_options, ConfiguredSource};
pub use http::HttpClient;
pub use provider::{newer_than, DataSource, ExportBatch, SourceError, SyncRequest};
