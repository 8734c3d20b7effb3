//! HTTP server implementations.

/// Gateway HTTP API server
pub mod gateway;

/// Metrics HTTP server
pub mod metrics;

/// Graceful shutdown handling
pub mod shutdown;
