//! Circuit breaker around the external transfer system
//!
//! Consecutive transport failures (timeouts, network errors) open the
//! circuit. While it is open, payouts fail fast before any transfer is
//! attempted, so nothing is left in flight against a system that is down.
//! Once the cool-down has passed a single trial payout is let through; its
//! outcome closes or reopens the circuit.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Transfers allowed
    Closed,
    /// Too many transport failures, transfers rejected
    Open,
    /// Cool-down elapsed, one trial transfer may probe recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default)]
struct Breaker {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure counter with a cool-down window
///
/// ```
/// use pulse_settlement::{CircuitBreaker, CircuitState};
///
/// let cb = CircuitBreaker::new(2, 60);
/// cb.record_failure();
/// cb.record_failure();
/// assert_eq!(cb.state(), CircuitState::Open);
/// assert!(cb.try_acquire().is_err());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Breaker>,
    threshold: u32,
    cool_down: Duration,
}

impl CircuitBreaker {
    /// `threshold` consecutive failures open the circuit for `cool_down_secs`
    pub fn new(threshold: u32, cool_down_secs: u64) -> Self {
        Self {
            inner: Mutex::new(Breaker::default()),
            threshold: threshold.max(1),
            cool_down: Duration::from_secs(cool_down_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Breaker> {
        // The guarded data is plain counters, a panic elsewhere cannot corrupt it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_of(&self, breaker: &Breaker, now: Instant) -> CircuitState {
        match breaker.opened_at {
            None => CircuitState::Closed,
            Some(opened) if now.duration_since(opened) >= self.cool_down => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state_of(&self.lock(), Instant::now())
    }

    /// Admit one call, or return the milliseconds until one may be tried
    ///
    /// In the half-open state only the first caller is admitted; the rest
    /// are turned away until that trial reports its outcome.
    pub fn try_acquire(&self) -> Result<(), u64> {
        let now = Instant::now();
        let mut breaker = self.lock();
        match self.state_of(&breaker, now) {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !breaker.trial_in_flight => {
                breaker.trial_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen => Err(0),
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|opened| now.duration_since(opened))
                    .unwrap_or_default();
                Err(self.cool_down.saturating_sub(elapsed).as_millis() as u64)
            }
        }
    }

    /// The transfer system answered; close the circuit
    pub fn record_success(&self) {
        *self.lock() = Breaker::default();
    }

    /// A transport failure; opens (or reopens) the circuit at the threshold
    pub fn record_failure(&self) {
        let mut breaker = self.lock();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.trial_in_flight = false;
        if breaker.consecutive_failures >= self.threshold {
            breaker.opened_at = Some(Instant::now());
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, 60)
    }
}
