//! # Application State Management
//!
//! Shared state for the HTTP launcher. Every actix worker gets a clone of
//! [`AppState`]; the clones share the same configuration, session registry and
//! request metrics through `Arc`.
//!
//! ## What lives here:
//! - **config**: immutable after startup (`Arc<AppConfig>`, no lock needed)
//! - **registry**: the proxy's live sessions, read for health and metrics
//! - **metrics**: HTTP request counters, updated by the middleware on every request
//!
//! ## Arc<RwLock<T>> Pattern
//! The request metrics are the only mutable data. Many requests may read the
//! snapshot at once; the middleware takes the write lock for a few additions
//! per request. A poisoned lock is recovered rather than propagated, since the
//! counters stay meaningful even if a writer panicked.

use crate::config::AppConfig;
use crate::proxy::SessionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// Shared state handed to every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Live proxy sessions (owned jointly with the WebSocket listener).
    pub registry: Arc<SessionRegistry>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the process started; used for uptime reporting.
    pub start_time: Instant,
}

/// HTTP request metrics collected by the middleware.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Record one finished request.
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /path", e.g. "GET /health"
    /// - **duration_ms**: wall time spent in the handler chain
    /// - **is_error**: 4xx/5xx status or a handler error
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics; the lock is released before serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
