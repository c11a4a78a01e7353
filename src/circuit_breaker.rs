//! Circuit Breaker - fail fast when a backend path keeps failing
//!
//! Each named circuit tracks its own failure history in a sliding window:
//!
//! ```text
//! CLOSED --failures >= threshold within window--> OPEN
//! OPEN   --reset timeout elapsed-----------------> HALF_OPEN
//! HALF_OPEN --successes >= success threshold-----> CLOSED
//! HALF_OPEN --any failure------------------------> OPEN
//! ```
//!
//! Circuits are independent; there is no ordering between them. Records are
//! created lazily on first use and the first registration of a name fixes
//! its configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::default();
//! let result = breaker
//!     .execute("lamad.content_store", || async { fetch_content().await })
//!     .await;
//! if result.circuit_open {
//!     // don't hammer it, show a fast failure
//! }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call::{CallErrorKind, CallOutcome, ZomeCall, ZomeCaller};
use crate::config::CircuitBreakerSection;

// =============================================================================
// Configuration
// =============================================================================

/// Thresholds for one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Sliding window for counting failures
    pub failure_window: Duration,
    /// Time spent OPEN before a trial call is let through
    pub reset_timeout: Duration,
    /// Successes in HALF_OPEN needed to close again
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_millis(60_000),
            reset_timeout: Duration::from_millis(30_000),
            success_threshold: 2,
        }
    }
}

impl From<&CircuitBreakerSection> for CircuitConfig {
    fn from(section: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold.max(1),
            failure_window: Duration::from_millis(section.failure_window_ms),
            reset_timeout: Duration::from_millis(section.reset_timeout_ms),
            success_threshold: section.success_threshold.max(1),
        }
    }
}

/// Per-circuit overrides applied on first registration.
#[derive(Debug, Clone, Default)]
pub struct CircuitOverrides {
    pub failure_threshold: Option<u32>,
    pub failure_window: Option<Duration>,
    pub reset_timeout: Option<Duration>,
    pub success_threshold: Option<u32>,
}

impl CircuitConfig {
    fn with_overrides(mut self, overrides: Option<&CircuitOverrides>) -> Self {
        if let Some(o) = overrides {
            if let Some(v) = o.failure_threshold {
                self.failure_threshold = v.max(1);
            }
            if let Some(v) = o.failure_window {
                self.failure_window = v;
            }
            if let Some(v) = o.reset_timeout {
                self.reset_timeout = v;
            }
            if let Some(v) = o.success_threshold {
                self.success_threshold = v.max(1);
            }
        }
        self
    }
}

// =============================================================================
// State and results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Why an `execute` did not produce data.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitError<E> {
    /// Failed fast; the wrapped function was never invoked
    Open { circuit: String },
    /// The wrapped function ran and failed
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { circuit } => write!(f, "Circuit '{}' is open", circuit),
            CircuitError::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Uniform result of [`CircuitBreaker::execute`]. Never an `Err`.
#[derive(Debug, Clone)]
pub struct CircuitResult<T, E> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<CircuitError<E>>,
    pub circuit_open: bool,
    /// Circuit state after the call was accounted for
    pub state: CircuitState,
}

impl<T, E: fmt::Display> CircuitResult<T, E> {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Read-only view of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    /// Failures still inside the window
    pub recent_failures: usize,
    pub consecutive_successes: u32,
    pub since_last_failure: Option<Duration>,
    pub since_state_change: Duration,
}

// =============================================================================
// Circuit record
// =============================================================================

struct CircuitRecord {
    config: CircuitConfig,
    state: CircuitState,
    failure_timestamps: VecDeque<Instant>,
    consecutive_successes: u32,
    last_state_change_at: Instant,
    last_failure_at: Option<Instant>,
}

impl CircuitRecord {
    fn new(config: CircuitConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_timestamps: VecDeque::new(),
            consecutive_successes: 0,
            last_state_change_at: now,
            last_failure_at: None,
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState, now: Instant) {
        if self.state == to {
            return;
        }
        match to {
            CircuitState::Open => warn!(circuit = %name, from = %self.state, "Circuit opened"),
            _ => info!(circuit = %name, from = %self.state, to = %to, "Circuit state change"),
        }
        self.state = to;
        self.last_state_change_at = now;
        self.consecutive_successes = 0;
        if to == CircuitState::Closed {
            self.failure_timestamps.clear();
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failure_timestamps.front() {
            if now.duration_since(oldest) > self.config.failure_window {
                self.failure_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Decide whether a call may run, moving OPEN to HALF_OPEN once the reset timeout passed.
    fn try_acquire(&mut self, name: &str, now: Instant) -> bool {
        if self.state == CircuitState::Open {
            if now.duration_since(self.last_state_change_at) >= self.config.reset_timeout {
                self.transition(name, CircuitState::HalfOpen, now);
            } else {
                return false;
            }
        }
        true
    }

    fn record_success(&mut self, name: &str, now: Instant) {
        self.prune(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.transition(name, CircuitState::Closed, now);
                }
            }
            CircuitState::Closed => self.failure_timestamps.clear(),
            // Another caller reopened it while this call was in flight
            CircuitState::Open => {}
        }
    }

    fn record_failure(&mut self, name: &str, now: Instant) {
        self.failure_timestamps.push_back(now);
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::HalfOpen => self.transition(name, CircuitState::Open, now),
            CircuitState::Closed => {
                self.prune(now);
                if self.failure_timestamps.len() >= self.config.failure_threshold as usize {
                    self.transition(name, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn stats(&mut self, now: Instant) -> CircuitStats {
        self.prune(now);
        CircuitStats {
            state: self.state,
            recent_failures: self.failure_timestamps.len(),
            consecutive_successes: self.consecutive_successes,
            since_last_failure: self.last_failure_at.map(|t| now.duration_since(t)),
            since_state_change: now.duration_since(self.last_state_change_at),
        }
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Registry of named circuits.
pub struct CircuitBreaker {
    defaults: CircuitConfig,
    circuits: DashMap<String, CircuitRecord>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(defaults: CircuitConfig) -> Self {
        Self {
            defaults,
            circuits: DashMap::new(),
        }
    }

    /// Create a circuit unless one with this name exists.
    ///
    /// Returns `true` if this call created it. Later registrations are no-ops.
    pub fn register(&self, name: &str, overrides: Option<&CircuitOverrides>) -> bool {
        if self.circuits.contains_key(name) {
            return false;
        }
        let mut created = false;
        self.circuits.entry(name.to_string()).or_insert_with(|| {
            created = true;
            debug!(circuit = %name, "Registering circuit");
            CircuitRecord::new(self.defaults.with_overrides(overrides), Instant::now())
        });
        created
    }

    /// Run `f` through the named circuit with default configuration.
    pub async fn execute<T, E, F, Fut>(&self, name: &str, f: F) -> CircuitResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(name, None, f).await
    }

    /// Run `f` through the named circuit, registering it with `overrides` if new.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        name: &str,
        overrides: Option<&CircuitOverrides>,
        f: F,
    ) -> CircuitResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.register(name, overrides);

        // The map guard must not live across the await below.
        let admitted = match self.circuits.get_mut(name) {
            Some(mut record) => {
                let allowed = record.try_acquire(name, Instant::now());
                (allowed, record.state)
            }
            None => (true, CircuitState::Closed),
        };

        if let (false, state) = admitted {
            debug!(circuit = %name, "Circuit open, failing fast");
            return CircuitResult {
                success: false,
                data: None,
                error: Some(CircuitError::Open {
                    circuit: name.to_string(),
                }),
                circuit_open: true,
                state,
            };
        }

        let outcome = f().await;
        let now = Instant::now();

        let state = match self.circuits.get_mut(name) {
            Some(mut record) => {
                match &outcome {
                    Ok(_) => record.record_success(name, now),
                    Err(_) => record.record_failure(name, now),
                }
                record.state
            }
            None => admitted.1,
        };

        match outcome {
            Ok(data) => CircuitResult {
                success: true,
                data: Some(data),
                error: None,
                circuit_open: false,
                state,
            },
            Err(e) => CircuitResult {
                success: false,
                data: None,
                error: Some(CircuitError::Failed(e)),
                circuit_open: false,
                state,
            },
        }
    }

    /// Current state, or `None` for a name never used.
    ///
    /// An OPEN circuit whose reset timeout has elapsed still reports OPEN
    /// until the next `execute` moves it to HALF_OPEN.
    pub fn get_state(&self, name: &str) -> Option<CircuitState> {
        self.circuits.get(name).map(|r| r.state)
    }

    pub fn get_stats(&self, name: &str) -> Option<CircuitStats> {
        self.circuits
            .get_mut(name)
            .map(|mut r| r.stats(Instant::now()))
    }

    /// Force a circuit CLOSED and forget its history. Unknown names are ignored.
    pub fn reset(&self, name: &str) {
        if let Some(mut record) = self.circuits.get_mut(name) {
            let now = Instant::now();
            record.transition(name, CircuitState::Closed, now);
            record.failure_timestamps.clear();
            record.consecutive_successes = 0;
            record.last_failure_at = None;
        }
    }

    pub fn circuit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

// =============================================================================
// Breaker-routed caller
// =============================================================================

/// Routes every call through the circuit `"{role}.{zome}"`.
pub struct BreakerCaller {
    inner: Arc<dyn ZomeCaller>,
    breaker: Arc<CircuitBreaker>,
}

impl BreakerCaller {
    pub fn new(inner: Arc<dyn ZomeCaller>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn circuit_name(call: &ZomeCall) -> String {
        format!("{}.{}", call.role_name, call.zome_name)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

struct FailedCall(CallOutcome);

impl fmt::Display for FailedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.error.as_deref().unwrap_or("call failed"))
    }
}

#[async_trait]
impl ZomeCaller for BreakerCaller {
    async fn call(&self, call: &ZomeCall) -> CallOutcome {
        let name = Self::circuit_name(call);
        let result = self
            .breaker
            .execute(&name, || async {
                let outcome = self.inner.call(call).await;
                if outcome.success {
                    Ok(outcome)
                } else {
                    Err(FailedCall(outcome))
                }
            })
            .await;

        match (result.data, result.error) {
            (Some(outcome), _) => outcome,
            (None, Some(CircuitError::Failed(FailedCall(outcome)))) => outcome,
            (None, Some(err @ CircuitError::Open { .. })) => {
                CallOutcome::failed(CallErrorKind::CircuitOpen, err.to_string())
            }
            (None, None) => CallOutcome::failed(CallErrorKind::Internal, "empty circuit result"),
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
