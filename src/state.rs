//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice connection.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many connections share ownership of the same data
//! - **Why needed**: Each WebSocket actor and each turn task holds a handle
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Why needed**: Config is read by every request but updated rarely
//!
//! ## What lives here:
//! - **config**: runtime-updatable application configuration
//! - **metrics**: session and turn counters, shared with the turn engine
//! - **models**: the process-wide model collaborator provider

use crate::config::AppConfig;
use crate::models::ModelProvider;
use crate::turn::TurnOutcome;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across handlers and connections.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Voice session and turn metrics
    pub metrics: MetricsHandle,

    /// Model collaborators, built lazily on first use
    pub models: Arc<ModelProvider>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters describing voice traffic since server start.
///
/// ## Turn accounting:
/// Every started turn ends in exactly one of completed / canceled / aborted / failed,
/// so `turns_started` minus the four outcome counters is the number of turns running now.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AppMetrics {
    /// Currently connected voice sessions
    pub active_sessions: u32,

    /// Voice sessions accepted since start
    pub total_sessions: u64,

    /// Upgrade requests refused because the session limit was reached
    pub rejected_sessions: u64,

    /// Utterances closed by the segmenter
    pub utterances_detected: u64,

    /// `interrupt` messages received
    pub interrupts: u64,

    pub turns_started: u64,
    pub turns_completed: u64,
    pub turns_canceled: u64,
    pub turns_aborted: u64,
    pub turns_failed: u64,
}

impl AppMetrics {
    pub fn turns_in_flight(&self) -> u64 {
        self.turns_started.saturating_sub(
            self.turns_completed + self.turns_canceled + self.turns_aborted + self.turns_failed,
        )
    }
}

/// Cloneable handle to the shared metrics.
///
/// ## Thread Safety:
/// Turn tasks record their outcome from whichever runtime thread they finish on,
/// so the counters sit behind `Arc<RwLock<>>` like the rest of the shared state.
#[derive(Debug, Clone, Default)]
pub struct MetricsHandle {
    inner: Arc<RwLock<AppMetrics>>,
}

impl MetricsHandle {
    /// Reserve a session slot unless `limit` sessions are already active.
    pub fn try_open_session(&self, limit: usize) -> bool {
        let mut metrics = self.inner.write().unwrap();
        if metrics.active_sessions as usize >= limit {
            metrics.rejected_sessions += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.total_sessions += 1;
        true
    }

    /// Release a session slot.
    ///
    /// ## Safety check:
    /// Never goes below zero, even if a session is closed twice.
    pub fn close_session(&self) {
        let mut metrics = self.inner.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_utterance(&self) {
        self.inner.write().unwrap().utterances_detected += 1;
    }

    pub fn record_interrupt(&self) {
        self.inner.write().unwrap().interrupts += 1;
    }

    pub fn record_turn_started(&self) {
        self.inner.write().unwrap().turns_started += 1;
    }

    pub fn record_turn_outcome(&self, outcome: TurnOutcome) {
        let mut metrics = self.inner.write().unwrap();
        match outcome {
            TurnOutcome::Completed => metrics.turns_completed += 1,
            TurnOutcome::Canceled => metrics.turns_canceled += 1,
            TurnOutcome::Aborted => metrics.turns_aborted += 1,
            TurnOutcome::Failed => metrics.turns_failed += 1,
        }
    }

    /// Copy of the current counters, so no lock is held while serializing.
    pub fn snapshot(&self) -> AppMetrics {
        self.inner.read().unwrap().clone()
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let models = Arc::new(ModelProvider::from_config(&config));
        Self::with_models(config, models)
    }

    /// State with an explicit collaborator provider.
    pub fn with_models(config: AppConfig, models: Arc<ModelProvider>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: MetricsHandle::default(),
            models,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately, so writers are never blocked for long.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The VAD threshold is pushed to the model provider so running sessions pick it up.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                self.models.set_vad_threshold(new_config.vad.energy_threshold);
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_limit() {
        let metrics = MetricsHandle::default();
        assert!(metrics.try_open_session(2));
        assert!(metrics.try_open_session(2));
        assert!(!metrics.try_open_session(2));

        metrics.close_session();
        assert!(metrics.try_open_session(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.total_sessions, 3);
        assert_eq!(snapshot.rejected_sessions, 1);
    }

    #[test]
    fn test_close_session_never_underflows() {
        let metrics = MetricsHandle::default();
        metrics.close_session();
        assert_eq!(metrics.snapshot().active_sessions, 0);
    }

    #[test]
    fn test_turn_accounting() {
        let metrics = MetricsHandle::default();
        for _ in 0..4 {
            metrics.record_turn_started();
        }
        metrics.record_turn_outcome(TurnOutcome::Completed);
        metrics.record_turn_outcome(TurnOutcome::Canceled);
        metrics.record_turn_outcome(TurnOutcome::Failed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.turns_completed, 1);
        assert_eq!(snapshot.turns_canceled, 1);
        assert_eq!(snapshot.turns_failed, 1);
        assert_eq!(snapshot.turns_in_flight(), 1);
    }

    #[test]
    fn test_update_config_validates() {
        let state = AppState::new(AppConfig::default());
        let mut bad = state.get_config();
        bad.server.port = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().server.port, 8080);
    }

    #[test]
    fn test_vad_threshold_update_reaches_running_detector() {
        let state = AppState::new(AppConfig::default());
        let vad = state.models.vad();

        // RMS 100: silence at the default threshold of 500
        let frame: Vec<u8> = (0..480)
            .flat_map(|i| if i % 2 == 0 { 100i16 } else { -100i16 }.to_le_bytes())
            .collect();
        assert!(!vad.is_speech(&frame, 16_000).unwrap());

        let mut config = state.get_config();
        config.vad.energy_threshold = 50.0;
        state.update_config(config).unwrap();

        assert!(vad.is_speech(&frame, 16_000).unwrap());
        assert!(state.models.vad().is_speech(&frame, 16_000).unwrap());
    }

    #[test]
    fn test_rejected_update_leaves_vad_threshold() {
        let state = AppState::new(AppConfig::default());
        let vad = state.models.vad();
        let frame: Vec<u8> = (0..480)
            .flat_map(|i| if i % 2 == 0 { 100i16 } else { -100i16 }.to_le_bytes())
            .collect();

        let mut config = state.get_config();
        config.vad.energy_threshold = 50.0;
        config.server.port = 0;
        assert!(state.update_config(config).is_err());
        assert!(!vad.is_speech(&frame, 16_000).unwrap());
    }
}
