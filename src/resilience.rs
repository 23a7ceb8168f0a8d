//! Resilience guards: retry backoff, circuit breaking, backpressure.
//!
//! All three are pure decision structures with no I/O and an injected
//! clock, so they are testable without sleeping. The orchestrator
//! consults them before every spawn/assign decision; any one vetoing
//! defers the decision.

use crate::config::{BackoffConfig, BackoffStrategy, BackpressureConfig, CircuitConfig};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Computes the delay before retry attempt `n`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            strategy: config.strategy,
            base: Duration::milliseconds(config.base_ms as i64),
            max: Duration::milliseconds(config.max_ms as i64),
        }
    }

    /// Delay before attempt `n` (1-based). Attempt 0 is treated as 1.
    ///
    /// Linear: `min(max, base * n)`. Exponential: `min(max, base * 2^(n-1))`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base * n as i32,
            BackoffStrategy::Exponential => {
                let factor = 2i64
                    .checked_pow(n - 1)
                    .unwrap_or(i64::MAX)
                    .min(i32::MAX as i64) as i32;
                self.base.checked_mul(factor).unwrap_or(self.max)
            }
        };
        delay.min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips after `failure_threshold` consecutive spawn failures; while
/// open, all spawns are refused for the cooldown, then a single trial
/// is admitted (half-open) before fully closing on success.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_threshold: config.failure_threshold,
            cooldown: Duration::seconds(config.cooldown_secs as i64),
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a spawn may proceed at `now`. Moves Open -> HalfOpen
    /// when the cooldown has elapsed; HalfOpen admits exactly one
    /// trial until its outcome is recorded.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| now - t >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::HalfOpen => {
                // Failed trial re-opens for a fresh cooldown.
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Closed => {
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state != CircuitState::Closed
    }
}

/// Throttles concurrency while the recent task failure rate is high.
#[derive(Debug)]
pub struct BackpressureController {
    window: usize,
    failure_rate_threshold: f64,
    min_concurrent: usize,
    outcomes: VecDeque<bool>,
}

impl BackpressureController {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            window: config.window.max(1),
            failure_rate_threshold: config.failure_rate_threshold,
            min_concurrent: config.min_concurrent.max(1),
            outcomes: VecDeque::new(),
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Failure rate over the rolling window; 0.0 when empty.
    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|&&ok| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    /// Concurrency the orchestrator should run at. Halves the
    /// configured maximum (never below `min_concurrent`) while the
    /// windowed failure rate exceeds the threshold.
    pub fn effective_concurrency(&self, max_concurrent: usize) -> usize {
        if self.failure_rate() > self.failure_rate_threshold {
            (max_concurrent / 2).max(self.min_concurrent)
        } else {
            max_concurrent
        }
    }
}
