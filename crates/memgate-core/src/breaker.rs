use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::BreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    settings: BreakerSettings,
    status: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub probe_in_flight: bool,
}

/// Failure-tracking guard for one service.
///
/// Every transition happens under the breaker's own mutex, so breakers of
/// different services never contend with each other. While half-open only
/// one trial call is admitted; other callers are turned away until that
/// trial records an outcome or is released.
pub struct CircuitBreaker {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Mutex::new(BreakerState {
                settings,
                ..BreakerState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> BreakerSettings {
        self.state.lock().settings
    }

    /// Swaps in new thresholds. State, failure count and the half-open slot
    /// are kept; the new threshold applies from the next recorded failure.
    pub fn update_settings(&self, settings: BreakerSettings) {
        let mut state = self.state.lock();
        if state.settings != settings {
            tracing::info!(
                service = %self.name,
                failure_threshold = settings.failure_threshold,
                reset_timeout_secs = settings.reset_timeout.as_secs(),
                "circuit settings updated"
            );
            state.settings = settings;
        }
    }

    /// Admission check. An open breaker whose reset timeout has elapsed moves
    /// to half-open here and the caller becomes the trial call.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(last_failure) = state.last_failure else {
                    return false;
                };
                let elapsed = self.clock.now().saturating_duration_since(last_failure);
                if elapsed < state.settings.reset_timeout {
                    return false;
                }
                state.status = CircuitState::HalfOpen;
                state.probe_in_flight = true;
                tracing::info!(service = %self.name, "circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    false
                } else {
                    state.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.status != CircuitState::Closed {
            tracing::info!(service = %self.name, from = %state.status, "circuit closed");
        }
        state.status = CircuitState::Closed;
        state.failure_count = 0;
        state.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(self.clock.now());
        state.probe_in_flight = false;
        let reopen = state.status == CircuitState::HalfOpen;
        if reopen || state.failure_count >= state.settings.failure_threshold {
            if state.status != CircuitState::Open {
                tracing::warn!(
                    service = %self.name,
                    failure_count = state.failure_count,
                    threshold = state.settings.failure_threshold,
                    "circuit opened"
                );
            }
            state.status = CircuitState::Open;
        }
    }

    /// Gives back a half-open trial slot without recording an outcome, for
    /// calls that were admitted but never reached the handler or were
    /// cancelled.
    pub fn release_probe(&self) {
        self.state.lock().probe_in_flight = false;
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().status
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Time left before an open breaker admits a trial call. `None` while
    /// closed; zero while half-open.
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock();
        self.retry_after_locked(&state)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            state: state.status,
            failure_count: state.failure_count,
            failure_threshold: state.settings.failure_threshold,
            reset_timeout_seconds: state.settings.reset_timeout.as_secs(),
            retry_after_seconds: self.retry_after_locked(&state).map(ceil_secs),
            probe_in_flight: state.probe_in_flight,
        }
    }

    fn retry_after_locked(&self, state: &BreakerState) -> Option<Duration> {
        match state.status {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => Some(Duration::ZERO),
            CircuitState::Open => {
                let elapsed = state
                    .last_failure
                    .map_or(Duration::ZERO, |t| self.clock.now().saturating_duration_since(t));
                Some(state.settings.reset_timeout.saturating_sub(elapsed))
            }
        }
    }
}

/// Whole seconds, rounded up so a caller never retries early.
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}
