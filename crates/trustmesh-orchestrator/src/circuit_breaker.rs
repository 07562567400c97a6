use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{earlier, later};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation: dispatches flow.
    Closed,
    /// Dispatches fail fast until the cool-down elapses.
    Open,
    /// A single probe dispatch is allowed to test recovery.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failures inside `window` that trip the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Answer to a dispatch asking to use a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Allowed as the one recovery probe; its outcome decides the breaker.
    Probe,
    Rejected { retry_at: DateTime<Utc> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Circuit breaker for one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    /// Failure timestamps inside the sliding window, oldest first.
    failures: VecDeque<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failures.len()
    }

    fn retry_at(&self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> DateTime<Utc> {
        later(self.opened_at.unwrap_or(now), config.cooldown)
    }

    pub fn try_acquire(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let retry_at = self.retry_at(config, now);
                if now >= retry_at {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected { retry_at }
                }
            }
            CircuitState::HalfOpen if self.probe_in_flight => Admission::Rejected {
                retry_at: later(now, config.cooldown),
            },
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    /// Record a dispatch outcome. Returns the new state when it changed.
    ///
    /// While half-open only the probe's outcome counts; while open, late
    /// outcomes of earlier dispatches are ignored.
    pub fn record(
        &mut self,
        config: &CircuitBreakerConfig,
        success: bool,
        probe: bool,
        now: DateTime<Utc>,
    ) -> Option<CircuitState> {
        match (self.state, success) {
            (CircuitState::HalfOpen, true) if probe => {
                self.state = CircuitState::Closed;
                self.failures.clear();
                self.opened_at = None;
                self.probe_in_flight = false;
                Some(CircuitState::Closed)
            }
            (CircuitState::HalfOpen, false) if probe => {
                self.trip(now);
                Some(CircuitState::Open)
            }
            (CircuitState::Closed, true) => {
                self.failures.clear();
                None
            }
            (CircuitState::Closed, false) => {
                self.failures.push_back(now);
                let horizon = earlier(now, config.window);
                while self.failures.front().is_some_and(|t| *t < horizon) {
                    self.failures.pop_front();
                }
                if self.failures.len() >= config.failure_threshold.max(1) as usize {
                    self.trip(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Give the probe slot back without judging the route (e.g. no agent was free).
    pub fn abandon_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.failures.clear();
        self.probe_in_flight = false;
    }
}

/// Registry of circuit breakers, one per route (task kind).
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn try_acquire(&self, route: &str, now: DateTime<Utc>) -> Admission {
        if let Some(mut breaker) = self.breakers.get_mut(route) {
            return breaker.try_acquire(&self.config, now);
        }
        Admission::Allowed
    }

    pub fn record_success(&self, route: &str, probe: bool, now: DateTime<Utc>) {
        if let Some(mut breaker) = self.breakers.get_mut(route) {
            if let Some(state) = breaker.record(&self.config, true, probe, now) {
                tracing::info!(route, ?state, "Circuit closed after successful probe");
            }
        }
    }

    /// Record a failure and return the new state if the breaker tripped.
    pub fn record_failure(&self, route: &str, probe: bool, now: DateTime<Utc>) -> Option<CircuitState> {
        let mut breaker = self.breakers.entry(route.to_string()).or_default();
        let changed = breaker.record(&self.config, false, probe, now);
        if changed == Some(CircuitState::Open) {
            tracing::warn!(
                route,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened"
            );
        }
        changed
    }

    pub fn abandon_probe(&self, route: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(route) {
            breaker.abandon_probe();
        }
    }

    pub fn state(&self, route: &str) -> CircuitState {
        self.breakers
            .get(route)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Routes whose breaker is not closed.
    pub fn open_routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .map(|b| b.key().clone())
            .collect();
        routes.sort();
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    #[test]
    fn test_circuit_breaker_closed_by_default() {
        let mut cb = CircuitBreaker::new();
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.try_acquire(&config(3, 60), Utc::now()), Admission::Allowed);
    }

    #[test]
    fn test_circuit_breaker_trips_on_threshold() {
        let cfg = config(3, 60);
        let mut cb = CircuitBreaker::new();
        let now = Utc::now();
        assert_eq!(cb.record(&cfg, false, false, now), None);
        assert_eq!(cb.record(&cfg, false, false, now), None);
        assert_eq!(cb.record(&cfg, false, false, now), Some(CircuitState::Open));
        assert!(!cb.try_acquire(&cfg, now).is_admitted());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cfg = config(2, 60);
        let mut cb = CircuitBreaker::new();
        let now = Utc::now();
        assert_eq!(cb.record(&cfg, false, false, now), None);
        assert_eq!(cb.record(&cfg, true, false, now), None);
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.record(&cfg, false, false, now), None);
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn test_registry_success_clears_closed_route() {
        let registry = CircuitBreakerRegistry::new(config(2, 60));
        let now = Utc::now();
        assert_eq!(registry.record_failure("analyze", false, now), None);
        registry.record_success("analyze", false, now);
        assert_eq!(registry.record_failure("analyze", false, now), None);
        assert_eq!(registry.state("analyze"), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let cfg = config(2, 60);
        let mut cb = CircuitBreaker::new();
        let start = Utc::now();
        cb.record(&cfg, false, false, start);
        let later = start + chrono::Duration::seconds(120);
        assert_eq!(cb.record(&cfg, false, false, later), None);
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn test_exactly_one_probe_after_cooldown() {
        let cfg = config(1, 30);
        let mut cb = CircuitBreaker::new();
        let now = Utc::now();
        cb.record(&cfg, false, false, now);

        let early = now + chrono::Duration::seconds(10);
        assert!(matches!(cb.try_acquire(&cfg, early), Admission::Rejected { .. }));

        let after = now + chrono::Duration::seconds(31);
        assert_eq!(cb.try_acquire(&cfg, after), Admission::Probe);
        assert_eq!(cb.state, CircuitState::HalfOpen);
        assert!(
            matches!(cb.try_acquire(&cfg, after), Admission::Rejected { .. }),
            "second dispatch while the probe is out must be rejected"
        );
    }

    #[test]
    fn test_probe_success_closes_and_resets() {
        let cfg = config(1, 0);
        let mut cb = CircuitBreaker::new();
        let now = Utc::now();
        cb.record(&cfg, false, false, now);
        assert_eq!(cb.try_acquire(&cfg, now), Admission::Probe);

        // A late failure from an earlier dispatch does not decide the probe.
        assert_eq!(cb.record(&cfg, false, false, now), None);
        assert_eq!(cb.record(&cfg, true, true, now), Some(CircuitState::Closed));
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.try_acquire(&cfg, now), Admission::Allowed);
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let cfg = config(1, 30);
        let mut cb = CircuitBreaker::new();
        let t0 = Utc::now();
        cb.record(&cfg, false, false, t0);
        let t1 = t0 + chrono::Duration::seconds(31);
        assert_eq!(cb.try_acquire(&cfg, t1), Admission::Probe);
        assert_eq!(cb.record(&cfg, false, true, t1), Some(CircuitState::Open));

        let t2 = t1 + chrono::Duration::seconds(10);
        match cb.try_acquire(&cfg, t2) {
            Admission::Rejected { retry_at } => assert_eq!(retry_at, t1 + chrono::Duration::seconds(30)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_abandoned_probe_can_be_retried() {
        let cfg = config(1, 0);
        let mut cb = CircuitBreaker::new();
        let now = Utc::now();
        cb.record(&cfg, false, false, now);
        assert_eq!(cb.try_acquire(&cfg, now), Admission::Probe);
        cb.abandon_probe();
        assert_eq!(cb.try_acquire(&cfg, now), Admission::Probe);
    }

    #[test]
    fn test_registry_tracks_routes_independently() {
        let registry = CircuitBreakerRegistry::new(config(1, 300));
        let now = Utc::now();
        assert_eq!(registry.record_failure("analyze", false, now), Some(CircuitState::Open));
        assert!(!registry.try_acquire("analyze", now).is_admitted());
        assert_eq!(registry.try_acquire("summarize", now), Admission::Allowed);
        assert_eq!(registry.open_routes(), vec!["analyze".to_string()]);
        assert_eq!(registry.state("summarize"), CircuitState::Closed);
    }
}
