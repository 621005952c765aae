//! Circuit breaker around the mail transport
//!
//! Stops the workers from draining the queue into a broken transport. One
//! breaker guards the whole process; workers share it through an `Arc`.
//!
//! # State Transitions
//!
//! ```text
//! ┌─────────┐  failure_threshold failures  ┌──────┐
//! │ Closed  │ ──────────────────────────>  │ Open │ <──────┐
//! └─────────┘    within failure_window      └──────┘        │
//!     ^                                        │            │
//!     │                                        │ cooldown   │ any failure
//!     │                                        v            │
//!     │  success_threshold successes   ┌───────────────┐    │
//!     └────────────────────────────────│   Half-Open   │────┘
//!                                      └───────────────┘
//! ```
//!
//! While open, [`CircuitBreaker::allow_request`] returns `None` and the
//! worker hands the job back without calling the transport. Those rejections
//! never count as failures. Half-open lets at most `half_open_max_probes`
//! calls through at once.
//!
//! Every admitted call carries an [`Admission`] stamped with the breaker's
//! generation, which moves on with each transition. An outcome reported for an
//! older generation is dropped: a slow call let through while closed cannot
//! close, reopen, or free a probe slot of a later half-open period.
//!
//! # Example
//!
//! ```text
//! Threshold: 5 failures in 60 seconds
//! Cooldown: 60 seconds
//!
//! t=0s:   Closed (normal)
//! t=10s:  5 failures → Open
//! t=10s-70s: All deliveries deferred, transport untouched
//! t=70s:  Half-Open (2 probes allowed)
//! t=71s:  2 probes succeed → Closed
//! ```

use std::{
    fmt::{self, Display},
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures required to open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time window for counting failures (seconds)
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// How long the circuit stays open before probing recovery (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Successful probes needed to close the circuit from half-open
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Probe calls allowed in flight while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_failure_window_secs() -> u64 {
    60
}

const fn default_cooldown_secs() -> u64 {
    60
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_half_open_max_probes() -> u32 {
    2
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all deliveries allowed
    Closed,
    /// Circuit tripped - reject all deliveries immediately
    Open,
    /// Testing recovery - allow limited deliveries
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the state gauge
    #[must_use]
    pub const fn as_gauge(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Permission to make one transport call
///
/// Hand it back through exactly one of the `record_*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Admission {
    generation: u64,
}

/// Read-only view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures counted in the current window
    pub failure_count: u32,
    /// Successful probes while half-open
    pub success_count: u32,
    pub probes_in_flight: u32,
    pub last_failure_at: Option<SystemTime>,
    pub last_transition_at: Option<SystemTime>,
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub cooldown_secs: u64,
    pub success_threshold: u32,
}

#[derive(Debug)]
struct CircuitBreakerData {
    state: CircuitState,
    failure_count: u32,
    /// Timestamp of first failure in current window
    first_failure_at: Option<Instant>,
    last_failure_at: Option<SystemTime>,
    opened_at: Option<Instant>,
    last_transition_at: Option<SystemTime>,
    consecutive_successes: u32,
    probes_in_flight: u32,
    /// Bumped on every transition
    generation: u64,
}

impl CircuitBreakerData {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            first_failure_at: None,
            last_failure_at: None,
            opened_at: None,
            last_transition_at: None,
            consecutive_successes: 0,
            probes_in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
        self.last_transition_at = Some(SystemTime::now());
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;

        match state {
            CircuitState::Open => self.opened_at = Some(Instant::now()),
            CircuitState::Closed => {
                self.failure_count = 0;
                self.first_failure_at = None;
                self.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn is_failure_window_expired(&self, config: &CircuitBreakerConfig) -> bool {
        self.first_failure_at.is_none_or(|first_failure| {
            first_failure.elapsed() > Duration::from_secs(config.failure_window_secs)
        })
    }

    fn is_cooldown_expired(&self, config: &CircuitBreakerConfig) -> bool {
        self.opened_at
            .is_some_and(|opened_at| opened_at.elapsed() >= Duration::from_secs(config.cooldown_secs))
    }

    const fn admit(&self) -> Admission {
        Admission {
            generation: self.generation,
        }
    }

    /// `false` for an admission from before the last transition. Otherwise
    /// gives back its probe slot when half-open.
    fn settle(&mut self, admission: Admission) -> bool {
        if admission.generation != self.generation {
            tracing::debug!(
                admitted = admission.generation,
                current = self.generation,
                "Ignoring outcome of a call admitted before the last transition"
            );
            return false;
        }

        if matches!(self.state, CircuitState::HalfOpen) {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
        true
    }
}

/// Process-wide circuit breaker for the mail transport
///
/// Every mutation happens under a single `parking_lot::Mutex`, so transitions
/// are atomic with respect to concurrent workers.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    data: parking_lot::Mutex<CircuitBreakerData>,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            data: parking_lot::Mutex::new(CircuitBreakerData::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a transport call may proceed
    ///
    /// Moves an open circuit to half-open once the cooldown has elapsed. In
    /// half-open an admission reserves a probe slot until it is recorded.
    pub fn allow_request(&self) -> Option<Admission> {
        let mut data = self.data.lock();

        match data.state {
            CircuitState::Closed => Some(data.admit()),
            CircuitState::Open => {
                if !data.is_cooldown_expired(&self.config) {
                    return None;
                }

                data.transition(CircuitState::HalfOpen);
                data.probes_in_flight = 1;
                tracing::info!("Circuit breaker entering HALF-OPEN state - probing transport");
                Some(data.admit())
            }
            CircuitState::HalfOpen => {
                if data.probes_in_flight >= self.config.half_open_max_probes {
                    return None;
                }

                data.probes_in_flight += 1;
                Some(data.admit())
            }
        }
    }

    /// Record a successful transport call
    ///
    /// Returns `true` if the circuit transitioned to Closed (recovered)
    pub fn record_success(&self, admission: Admission) -> bool {
        let mut data = self.data.lock();
        if !data.settle(admission) {
            return false;
        }

        match data.state {
            CircuitState::Closed => {
                data.failure_count = 0;
                data.first_failure_at = None;
                false
            }
            CircuitState::HalfOpen => {
                data.consecutive_successes += 1;

                if data.consecutive_successes < self.config.success_threshold {
                    return false;
                }

                data.transition(CircuitState::Closed);
                tracing::info!("Circuit breaker CLOSED - normal operation resumed");
                true
            }
            // Nothing is admitted while open
            CircuitState::Open => false,
        }
    }

    /// Record a failed transport call
    ///
    /// Returns `true` if the circuit transitioned to Open (tripped)
    pub fn record_failure(&self, admission: Admission) -> bool {
        let mut data = self.data.lock();
        if !data.settle(admission) {
            return false;
        }
        data.last_failure_at = Some(SystemTime::now());

        match data.state {
            CircuitState::Closed => {
                if data.is_failure_window_expired(&self.config) {
                    data.failure_count = 0;
                    data.first_failure_at = None;
                }

                if data.first_failure_at.is_none() {
                    data.first_failure_at = Some(Instant::now());
                }
                data.failure_count += 1;

                if data.failure_count < self.config.failure_threshold {
                    return false;
                }

                let failure_count = data.failure_count;
                data.transition(CircuitState::Open);
                tracing::warn!(
                    failure_count,
                    threshold = self.config.failure_threshold,
                    cooldown_secs = self.config.cooldown_secs,
                    "Circuit breaker OPENED - deferring deliveries"
                );
                true
            }
            CircuitState::HalfOpen => {
                data.transition(CircuitState::Open);
                tracing::warn!("Circuit breaker probe failed - reopening circuit");
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Give back a probe slot for a call that ended without a transport verdict
    pub fn record_ignored(&self, admission: Admission) {
        self.data.lock().settle(admission);
    }

    /// Force the circuit closed and clear all counters
    pub fn reset(&self) {
        let mut data = self.data.lock();
        data.transition(CircuitState::Closed);
        data.last_failure_at = None;
        tracing::info!("Circuit breaker manually reset");
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    /// Read-only snapshot; never transitions, even when the cooldown has passed
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let data = self.data.lock();
        CircuitSnapshot {
            state: data.state,
            failure_count: data.failure_count,
            success_count: data.consecutive_successes,
            probes_in_flight: data.probes_in_flight,
            last_failure_at: data.last_failure_at,
            last_transition_at: data.last_transition_at,
            failure_threshold: self.config.failure_threshold,
            failure_window_secs: self.config.failure_window_secs,
            cooldown_secs: self.config.cooldown_secs,
            success_threshold: self.config.success_threshold,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
