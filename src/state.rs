//! # Application State Management
//!
//! Shared state that every HTTP handler and the WebSocket actor can reach:
//! the runtime configuration and the server-wide metrics block. Everything
//! mutable sits behind `Arc<RwLock<...>>` so concurrent requests can read
//! without blocking each other while updates stay exclusive.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all request handlers and connection actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Runtime configuration (updatable through the config endpoint)
    pub config: Arc<RwLock<AppConfig>>,

    /// Server-wide counters, updated by middleware and the call handler
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started (immutable, Copy)
    pub start_time: Instant,
}

/// Counters collected across all requests and calls.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since start
    pub request_count: u64,

    /// Total request errors since start
    pub error_count: u64,

    /// Calls currently streaming over the media-stream endpoint
    pub active_calls: u32,

    /// Per-endpoint request statistics, keyed "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration; cloning releases the read lock
    /// immediately so handlers never hold it across await points.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating the candidate.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Count one incoming HTTP request (middleware).
    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    /// Count one failed HTTP request (middleware).
    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    /// Record per-endpoint latency and outcome (middleware).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A call went live on the media-stream endpoint.
    pub fn increment_active_calls(&self) {
        self.metrics.write().unwrap().active_calls += 1;
    }

    /// A live call ended. Guarded against underflow so a double teardown
    /// cannot panic the metrics lock.
    pub fn decrement_active_calls(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    /// Consistent snapshot for the metrics endpoints; cloned so the lock is
    /// not held while the response serializes.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
