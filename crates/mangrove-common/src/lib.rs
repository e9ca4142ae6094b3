//! Shared plumbing for Mangrove services: the MongoDB error taxonomy,
//! configuration structures, and telemetry/log-ring setup.

pub mod config;
pub mod error;
pub mod log_ring;
pub mod telemetry;

pub use config::ProxyConfig;
pub use error::{ErrorCode, MongoError, MongoResult};
pub use log_ring::LogRing;
