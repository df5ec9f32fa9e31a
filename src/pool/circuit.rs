//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker with three states:
//! - Closed: Normal operation, requests are allowed
//! - Open: Upstream has failed, requests are rejected
//! - HalfOpen: Testing recovery, a limited number of concurrent trials allowed
//!
//! Admission hands out a [`BreakerTicket`]. The ticket is stamped with the
//! breaker's epoch, which advances on every state transition, so an outcome
//! reported for a request admitted under an earlier state can never corrupt
//! the bookkeeping of the current one.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;

/// Circuit breaker error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitError {
    #[error("Circuit breaker is open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("Half-open circuit has reached maximum concurrent trials")]
    HalfOpenLimitReached,
}

impl CircuitError {
    /// Suggested back-off before the next attempt
    pub fn retry_in(&self) -> Duration {
        match self {
            CircuitError::CircuitOpen { retry_in } => *retry_in,
            CircuitError::HalfOpenLimitReached => Duration::ZERO,
        }
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests are allowed
    Closed,

    /// Upstream has failed - requests are rejected
    Open,

    /// Testing recovery - limited requests allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failures counted in Closed state before opening the circuit
    pub failure_threshold: u32,

    /// How long to wait after the last failure before allowing trials
    pub reset_timeout: Duration,

    /// Concurrent trials in half-open state, and successes required to close
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_trials: 3,
        }
    }
}

impl From<&ManagerConfig> for CircuitBreakerConfig {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout(),
            half_open_max_trials: config.half_open_max_trials,
        }
    }
}

/// Mutable breaker state, guarded by a single lock
struct BreakerState {
    state: CircuitState,

    /// Leaky failure counter (Closed state)
    failure_count: u32,

    /// Successes since entering HalfOpen
    half_open_successes: u32,

    /// Trials admitted in HalfOpen that have not reported back yet
    trials_in_flight: u32,

    last_failure_at: Option<Instant>,

    /// Advances on every state transition
    epoch: u64,

    total_successes: u64,
    total_failures: u64,
    open_count: u64,
    last_transition: Instant,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            trials_in_flight: 0,
            last_failure_at: None,
            epoch: 0,
            total_successes: 0,
            total_failures: 0,
            open_count: 0,
            last_transition: Instant::now(),
        }
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.trials_in_flight = 0;
        self.epoch += 1;
        self.last_transition = Instant::now();
    }

    fn transition_to_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_at = Some(now);
        self.half_open_successes = 0;
        self.trials_in_flight = 0;
        self.open_count += 1;
        self.epoch += 1;
        self.last_transition = now;
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
        self.trials_in_flight = 0;
        self.epoch += 1;
        self.last_transition = Instant::now();
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Current (leaky) failure count
    pub failure_count: u32,

    /// Successes recorded in the current half-open window
    pub half_open_successes: u32,

    /// Half-open trials currently executing
    pub trials_in_flight: u32,

    /// Total successes
    pub total_successes: u64,

    /// Total failures
    pub total_failures: u64,

    /// Number of times circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

/// Circuit breaker guarding a single upstream target
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in Closed state
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(BreakerState::new()),
        })
    }

    /// Check whether a request may proceed.
    ///
    /// An Open circuit whose reset timeout has elapsed moves to HalfOpen here.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerTicket, CircuitError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.state == CircuitState::Open {
            let since_failure = state
                .last_failure_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(self.config.reset_timeout);

            if since_failure < self.config.reset_timeout {
                return Err(CircuitError::CircuitOpen {
                    retry_in: self.config.reset_timeout - since_failure,
                });
            }

            info!("Circuit transitioning from Open to HalfOpen");
            state.transition_to_half_open();
        }

        let trial = state.state == CircuitState::HalfOpen;
        if trial {
            if state.trials_in_flight >= self.config.half_open_max_trials {
                debug!(
                    trials_in_flight = state.trials_in_flight,
                    "Half-open trial limit reached"
                );
                return Err(CircuitError::HalfOpenLimitReached);
            }
            state.trials_in_flight += 1;
        }

        Ok(BreakerTicket {
            breaker: Arc::clone(self),
            epoch: state.epoch,
            trial,
            settled: false,
        })
    }

    /// Confirm that a ticket issued earlier still reflects the current state.
    ///
    /// Tickets from an earlier epoch are discarded and admission is re-checked.
    pub fn revalidate(self: &Arc<Self>, ticket: BreakerTicket) -> Result<BreakerTicket, CircuitError> {
        if ticket.epoch == self.state.lock().epoch {
            return Ok(ticket);
        }
        drop(ticket);
        self.try_acquire()
    }

    fn on_success(&self, epoch: u64, trial: bool) {
        let mut state = self.state.lock();
        state.total_successes += 1;

        if epoch != state.epoch {
            debug!(state = %state.state, "Ignoring success from an earlier circuit epoch");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                if trial {
                    state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
                }
                state.half_open_successes += 1;
                debug!(
                    success_count = state.half_open_successes,
                    "Request succeeded in HalfOpen state"
                );

                if state.half_open_successes >= self.config.half_open_max_trials {
                    info!(
                        success_count = state.half_open_successes,
                        "Circuit transitioning from HalfOpen to Closed"
                    );
                    state.transition_to_closed();
                }
            }
            CircuitState::Open => {
                warn!("Recorded success in Open state - this is unexpected");
            }
        }
    }

    fn on_failure(&self, epoch: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.total_failures += 1;

        if epoch != state.epoch {
            debug!(state = %state.state, "Ignoring failure from an earlier circuit epoch");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.last_failure_at = Some(now);
                debug!(
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    "Request failed in Closed state"
                );

                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        failure_count = state.failure_count,
                        "Circuit transitioning from Closed to Open"
                    );
                    state.transition_to_open(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    success_count = state.half_open_successes,
                    "Request failed in HalfOpen state - reopening circuit"
                );
                state.transition_to_open(now);
            }
            CircuitState::Open => {
                debug!("Request failed in Open state");
            }
        }
    }

    fn on_abandon(&self, epoch: u64, trial: bool) {
        let mut state = self.state.lock();
        if trial && epoch == state.epoch && state.state == CircuitState::HalfOpen {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the current leaky failure count
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Get statistics
    pub fn stats(&self) -> CircuitStats {
        let state = self.state.lock();
        CircuitStats {
            state: state.state,
            failure_count: state.failure_count,
            half_open_successes: state.half_open_successes,
            trials_in_flight: state.trials_in_flight,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            open_count: state.open_count,
            time_in_state: state.last_transition.elapsed(),
        }
    }

    /// Manually reset the circuit to Closed state
    pub fn reset(&self) {
        info!("Manually resetting circuit to Closed");
        self.state.lock().transition_to_closed();
    }
}

/// Permission to run one request, obtained from [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping an unreported ticket
/// returns its half-open trial slot without counting an outcome.
#[must_use = "a ticket must report the request outcome"]
pub struct BreakerTicket {
    breaker: Arc<CircuitBreaker>,
    epoch: u64,
    trial: bool,
    settled: bool,
}

impl BreakerTicket {
    /// Whether this request is a half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.epoch, self.trial);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.epoch);
    }
}

impl fmt::Debug for BreakerTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerTicket")
            .field("epoch", &self.epoch)
            .field("trial", &self.trial)
            .finish()
    }
}

impl Drop for BreakerTicket {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.epoch, self.trial);
        }
    }
}
