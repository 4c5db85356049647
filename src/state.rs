//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and every WebSocket session
//! task: configuration, the session registry, the audio pipeline and server
//! metrics.
//!
//! ## Thread Safety:
//! All mutable data sits behind `Arc<RwLock<T>>` so many tasks can read
//! simultaneously while writes stay exclusive. The registry carries its own
//! internal synchronization (see [`crate::session::registry`]); `AppState`
//! just shares ownership of it.

use crate::config::AppConfig;
use crate::pipeline::{AudioPipeline, EchoPipeline, ValidatedEchoPipeline};
use crate::session::registry::SessionRegistry;
use crate::session::state::SessionSettings;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all handlers and session tasks.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime).
    pub config: Arc<RwLock<AppConfig>>,

    /// Server-wide counters, updated by middleware and session tasks.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Directory of live sessions; the single structure mutated by more than
    /// one task.
    registry: Arc<SessionRegistry>,

    /// The transform applied to every inbound audio frame. Swappable behind
    /// the trait; chosen from config at startup.
    pipeline: Arc<dyn AudioPipeline>,

    /// When the server started. Instant is Copy, so no lock needed.
    pub start_time: Instant,
}

/// Counters collected across the server's lifetime.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since start.
    pub request_count: u64,

    /// Total HTTP errors since start.
    pub error_count: u64,

    /// Total WebSocket sessions ever accepted.
    pub sessions_opened: u64,

    /// Sessions refused because the registry was at capacity.
    pub sessions_refused: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for one API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state from a validated configuration.
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.performance.max_concurrent_sessions,
        ));

        let pipeline: Arc<dyn AudioPipeline> = if config.audio.validate_pcm {
            Arc::new(ValidatedEchoPipeline)
        } else {
            Arc::new(EchoPipeline)
        };

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            pipeline,
            start_time: Instant::now(),
        }
    }

    /// Copy of the current configuration. Cloning releases the lock
    /// immediately so other tasks aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> Arc<dyn AudioPipeline> {
        self.pipeline.clone()
    }

    /// Settings for a newly accepted session, derived from current config.
    pub fn session_settings(&self) -> SessionSettings {
        let config = self.config.read().unwrap();
        SessionSettings {
            outbound_queue_capacity: config.relay.outbound_queue_capacity,
            audio: crate::session::state::AudioFormat {
                sample_rate: config.audio.sample_rate,
                channels: config.audio.channels,
                bit_depth: config.audio.bit_depth,
            },
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_session_opened(&self) {
        self.metrics.write().unwrap().sessions_opened += 1;
    }

    pub fn record_session_refused(&self) {
        self.metrics.write().unwrap().sessions_refused += 1;
    }

    /// Record one finished HTTP request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics for the `/metrics` endpoint. Cloned so
    /// no lock is held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            sessions_opened: metrics.sessions_opened,
            sessions_refused: metrics.sessions_refused,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
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

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_settings_track_config() {
        let mut config = AppConfig::default();
        config.relay.outbound_queue_capacity = 7;
        config.audio.sample_rate = 48000;

        let state = AppState::new(config);
        let settings = state.session_settings();
        assert_eq!(settings.outbound_queue_capacity, 7);
        assert_eq!(settings.audio.sample_rate, 48000);
    }

    #[test]
    fn test_pipeline_selection_from_config() {
        let state = AppState::new(AppConfig::default());
        assert_eq!(state.pipeline().name(), "echo");

        let mut config = AppConfig::default();
        config.audio.validate_pcm = true;
        let state = AppState::new(config);
        assert_eq!(state.pipeline().name(), "validated-echo");
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        // Original config still in place.
        assert_eq!(state.get_config().server.port, 8765);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
