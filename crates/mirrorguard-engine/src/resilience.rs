/*
[INPUT]:  Per-symbol exchange call closures and their typed errors
[OUTPUT]: Retried call results gated by per-symbol circuit breakers
[POS]:    Resilience layer - retry schedule + circuit breaking
[UPDATE]: When backoff schedule or breaker thresholds change
*/

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use mirrorguard_exchange::{ErrorKind, ExchangeError};

/// Fixed backoff schedule consumed between retryable failures.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

const FAILURE_THRESHOLD: u32 = 5;
const RECOVERY_WINDOW: Duration = Duration::from_secs(60);

/// State of one symbol's circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    /// Normal operation, calls are allowed.
    Closed,
    /// Tripped; calls are refused until the recovery window passes.
    Open { tripped_at: Instant },
    /// One trial call is in flight; further calls are refused.
    HalfOpen,
}

/// Circuit breaker guarding one symbol's exchange calls.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    recovery_window: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_window: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            failure_threshold,
            recovery_window,
        }
    }

    /// Check whether a call is currently allowed. While open, the first
    /// check after the recovery window moves to half-open and admits exactly
    /// one trial; further checks are refused until the trial resolves.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } => {
                if tripped_at.elapsed() >= self.recovery_window {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    /// Record a successful call: closes the breaker and resets the counter.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
    }

    /// Record a failed call. Trips at the threshold; a failed half-open
    /// trial re-opens immediately.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure = Some(Instant::now());

        let tripped = match self.state {
            BreakerState::HalfOpen => true,
            _ => self.consecutive_failures >= self.failure_threshold,
        };
        if tripped {
            self.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. } | BreakerState::HalfOpen)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, RECOVERY_WINDOW)
    }
}

/// Errors surfaced by the resilient call wrapper.
#[derive(Debug)]
pub enum CallError {
    /// Breaker refused the call without any network attempt.
    CircuitOpen { symbol: String },
    /// A fatal error aborted the call on its current attempt.
    Fatal(ExchangeError),
    /// Every slot in the backoff schedule was consumed.
    Exhausted(ExchangeError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::CircuitOpen { symbol } => {
                write!(f, "circuit breaker open for {symbol}")
            }
            CallError::Fatal(err) => write!(f, "fatal exchange error: {err}"),
            CallError::Exhausted(err) => {
                write!(f, "retries exhausted, last error: {err}")
            }
        }
    }
}

impl std::error::Error for CallError {}

/// Per-symbol circuit breakers plus the retry wrapper.
///
/// Breakers are created lazily on first use and live for the process
/// lifetime; they are never serialized.
#[derive(Debug, Default)]
pub struct ResilienceLayer {
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ResilienceLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, symbol: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers.entry(symbol.to_string()).or_default().try_acquire()
    }

    fn record_success(&self, symbol: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers.entry(symbol.to_string()).or_default().record_success();
    }

    fn record_failure(&self, symbol: &str) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers.entry(symbol.to_string()).or_default().record_failure();
    }

    /// Whether the breaker for a symbol currently refuses calls.
    pub fn is_open(&self, symbol: &str) -> bool {
        let breakers = self.breakers.lock().expect("breaker lock poisoned");
        breakers.get(symbol).map(CircuitBreaker::is_open).unwrap_or(false)
    }

    /// Run an exchange call under the symbol's breaker and retry schedule.
    ///
    /// Retryable errors consume the backoff schedule; fatal errors abort
    /// immediately. Exhaustion and fatal errors record a breaker failure,
    /// any success records a breaker success.
    pub async fn call<T, F, Fut>(&self, symbol: &str, operation: F) -> Result<T, CallError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        if !self.try_acquire(symbol) {
            return Err(CallError::CircuitOpen {
                symbol: symbol.to_string(),
            });
        }

        let mut schedule = BACKOFF_SCHEDULE.iter();
        loop {
            match operation().await {
                Ok(value) => {
                    self.record_success(symbol);
                    return Ok(value);
                }
                Err(err) if err.kind() == ErrorKind::Fatal => {
                    tracing::warn!(symbol = %symbol, error = %err, "fatal exchange error");
                    self.record_failure(symbol);
                    return Err(CallError::Fatal(err));
                }
                Err(err) => match schedule.next() {
                    Some(delay) => {
                        tracing::debug!(
                            symbol = %symbol,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retryable exchange error, backing off"
                        );
                        tokio::time::sleep(*delay).await;
                    }
                    None => {
                        tracing::warn!(symbol = %symbol, error = %err, "retries exhausted");
                        self.record_failure(symbol);
                        return Err(CallError::Exhausted(err));
                    }
                },
            }
        }
    }
}
