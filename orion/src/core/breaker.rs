//! Sliding-window circuit breaker for automatic recovery.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub trigger_count: u32,
    pub window: Duration,
    pub open_for: Duration,
}

/// Breaker for one (instance, stall class) pair.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            failures: VecDeque::new(),
            open_until: None,
        }
    }

    /// Rebuild a breaker from persisted state.
    pub fn restore(config: BreakerConfig, failures: Vec<Instant>, open_until: Option<Instant>) -> Self {
        Self {
            config,
            failures: failures.into(),
            open_until,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }

    pub fn open_until(&self) -> Option<Instant> {
        self.open_until
    }

    pub fn failures(&self) -> impl Iterator<Item = &Instant> {
        self.failures.iter()
    }

    /// Record a failed recovery. Returns `true` when this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.failures.push_back(now);
        if self.is_open(now) {
            return false;
        }
        if self.failures.len() >= self.config.trigger_count as usize {
            self.open_until = Some(now + self.config.open_for);
            self.failures.clear();
            return true;
        }
        false
    }

    /// A recovery produced progress: forget recent failures.
    pub fn record_success(&mut self) {
        self.failures.clear();
    }

    /// Operator acknowledged the escalation: close the circuit.
    pub fn reset(&mut self) {
        self.failures.clear();
        self.open_until = None;
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.failures.front() {
            if now.saturating_duration_since(*front) > self.config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.open_until.is_some_and(|until| now >= until) {
            self.open_until = None;
        }
    }
}
