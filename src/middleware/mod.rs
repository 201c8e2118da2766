//! Request middleware for the HTTP launcher: structured request logs and
//! per-endpoint metrics.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
