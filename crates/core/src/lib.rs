pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod redact;
pub mod store;
pub mod types;
