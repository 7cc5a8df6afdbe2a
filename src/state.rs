//! # Application State Management
//!
//! Shared state that every HTTP request handler can reach through `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every worker thread hold the same state without copying it
//! - **Memory safety**: The data is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why needed**: Requests read the config constantly; `PUT /api/v1/config` rarely writes it
//! - **Poisoning**: If a thread panics while holding the lock, the lock is "poisoned".
//!   The counters here stay meaningful after such a panic, so we recover the inner value
//!   with `PoisonError::into_inner` instead of crashing every later request.
//!
//! ### RAII guards
//! - `begin_recognition()` returns a guard whose `Drop` decrements the active counter,
//!   so the count is right even when a client disconnects mid-request and the
//!   handler future is dropped.

use crate::audio::AudioNormalizer;
use crate::config::AppConfig;
use crate::speech::{Connector, RecognitionResult, RecognitionStatus, SpeechGateway, WebSocketConnector};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// The application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runtime-updatable configuration
    pub config: Arc<RwLock<AppConfig>>,

    /// Per-request HTTP metrics, updated by the telemetry middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Recognition outcome counters, updated by the speech handler
    pub recognition: Arc<RwLock<RecognitionMetrics>>,

    /// How gateways reach the recognizer (a real WebSocket in production)
    pub connector: Arc<dyn Connector>,

    /// Audio normalization chain, built once at startup
    pub normalizer: Arc<AudioNormalizer>,

    pub start_time: Instant,
}

/// HTTP metrics collected across all requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Outcome counters for `POST /api/v1/speech-to-text`.
#[derive(Debug, Default, Clone)]
pub struct RecognitionMetrics {
    /// Final event received
    pub completed: u64,

    /// Receive wait expired, partial transcript returned
    pub partial: u64,

    /// Key: `SpeechError::kind()` (configuration, connection, protocol, ...)
    pub failed_by_kind: HashMap<String, u64>,

    /// Recognitions currently in flight
    pub active: u32,

    /// Sum of uploaded audio sizes
    pub audio_bytes: u64,
}

impl RecognitionMetrics {
    pub fn failed(&self) -> u64 {
        self.failed_by_kind.values().sum()
    }

    pub fn total(&self) -> u64 {
        self.completed + self.partial + self.failed()
    }
}

/// Decrements `RecognitionMetrics::active` when dropped.
pub struct RecognitionGuard {
    recognition: Arc<RwLock<RecognitionMetrics>>,
}

impl Drop for RecognitionGuard {
    fn drop(&mut self) {
        let mut recognition = self.recognition.write().unwrap_or_else(PoisonError::into_inner);
        recognition.active = recognition.active.saturating_sub(1);
    }
}

impl AppState {
    /// Production state: real WebSocket connector and the standard normalizer chain.
    pub fn new(config: AppConfig) -> Self {
        let normalizer = AudioNormalizer::standard(config.speech.transcoder_path.clone());
        Self::with_parts(config, Arc::new(WebSocketConnector), Arc::new(normalizer))
    }

    /// State with an injected connector and normalizer (tests use a scripted upstream).
    pub fn with_parts(config: AppConfig, connector: Arc<dyn Connector>, normalizer: Arc<AudioNormalizer>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            recognition: Arc::new(RwLock::new(RecognitionMetrics::default())),
            connector,
            normalizer,
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. The lock is released before returning.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// A gateway bound to the current configuration. Later config updates do not
    /// affect a gateway that is already running.
    pub fn gateway(&self) -> SpeechGateway {
        SpeechGateway::new(
            self.get_config().speech.gateway_config(),
            Arc::clone(&self.connector),
            Arc::clone(&self.normalizer),
        )
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner).error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark a recognition as started. Keep the guard alive until it ends.
    pub fn begin_recognition(&self, audio_bytes: usize) -> RecognitionGuard {
        let mut recognition = self.recognition.write().unwrap_or_else(PoisonError::into_inner);
        recognition.active += 1;
        recognition.audio_bytes += audio_bytes as u64;

        RecognitionGuard {
            recognition: Arc::clone(&self.recognition),
        }
    }

    pub fn record_recognition(&self, result: &RecognitionResult) {
        let mut recognition = self.recognition.write().unwrap_or_else(PoisonError::into_inner);
        match result.status {
            RecognitionStatus::Completed => recognition.completed += 1,
            RecognitionStatus::Partial => recognition.partial += 1,
            RecognitionStatus::Failed => {
                let kind = result.error_kind.unwrap_or("unknown");
                *recognition.failed_by_kind.entry(kind.to_string()).or_default() += 1;
            }
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_recognition_snapshot(&self) -> RecognitionMetrics {
        self.recognition.read().unwrap_or_else(PoisonError::into_inner).clone()
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

    /// Fraction of requests that failed (0.0 to 1.0).
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
    use crate::speech::SpeechError;

    #[test]
    fn test_recognition_counters() {
        let state = AppState::new(AppConfig::default());

        state.record_recognition(&RecognitionResult::completed("你好"));
        state.record_recognition(&RecognitionResult::partial("你"));
        state.record_recognition(&RecognitionResult::failed(&SpeechError::Configuration));
        state.record_recognition(&RecognitionResult::failed(&SpeechError::Configuration));

        let snapshot = state.get_recognition_snapshot();
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.partial, 1);
        assert_eq!(snapshot.failed_by_kind.get("configuration"), Some(&2));
        assert_eq!(snapshot.total(), 4);
    }

    #[test]
    fn test_active_guard_decrements_on_drop() {
        let state = AppState::new(AppConfig::default());
        {
            let _first = state.begin_recognition(100);
            let _second = state.begin_recognition(50);
            assert_eq!(state.get_recognition_snapshot().active, 2);
        }
        let snapshot = state.get_recognition_snapshot();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.audio_bytes, 150);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default());
        let mut config = state.get_config();
        config.server.port = 0;

        assert!(state.update_config(config).is_err());
        assert_eq!(state.get_config().server.port, 8000);
    }

    #[test]
    fn test_gateway_uses_current_config() {
        let state = AppState::new(AppConfig::default());
        let mut config = state.get_config();
        config.speech.receive_timeout_secs = 30;
        state.update_config(config).unwrap();

        assert_eq!(state.gateway().config().receive_timeout.as_secs(), 30);
    }
}
