//! Health reporting over circuit breakers
//!
//! A report is DOWN as soon as one included breaker is OPEN or FORCED_OPEN.
//! HALF_OPEN counts as up: the breaker is already letting trial calls
//! through. Breakers configured with `register_health_indicator = false` are
//! left out entirely.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::registry::ResilienceRegistry;
use crate::utils::duration_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        })
    }
}

/// Snapshot of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerHealth {
    pub status: HealthStatus,
    pub state: CircuitState,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub successful_calls: u32,
    pub slow_calls: u32,
    pub not_permitted_calls: u64,
    #[serde(rename = "time_in_state_ms", with = "duration_millis")]
    pub time_in_state: Duration,
}

impl CircuitBreakerHealth {
    pub fn of(breaker: &CircuitBreaker) -> Self {
        let metrics = breaker.metrics();
        Self {
            status: status_of(metrics.state),
            state: metrics.state,
            failure_rate: metrics.failure_rate,
            slow_call_rate: metrics.slow_call_rate,
            buffered_calls: metrics.buffered_calls,
            failed_calls: metrics.failed_calls,
            successful_calls: metrics.successful_calls,
            slow_calls: metrics.slow_calls,
            not_permitted_calls: metrics.not_permitted_calls,
            time_in_state: breaker.time_in_state(),
        }
    }
}

/// Breaker counts per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub disabled: usize,
    pub forced_open: usize,
}

impl HealthSummary {
    fn count(&mut self, state: CircuitState) {
        self.total += 1;
        match state {
            CircuitState::Closed => self.closed += 1,
            CircuitState::Open => self.open += 1,
            CircuitState::HalfOpen => self.half_open += 1,
            CircuitState::Disabled => self.disabled += 1,
            CircuitState::ForcedOpen => self.forced_open += 1,
        }
    }
}

/// Aggregated breaker health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub summary: HealthSummary,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerHealth>,
}

impl HealthReport {
    /// Report over every breaker in `registry`
    pub fn from_registry(registry: &ResilienceRegistry) -> Self {
        let breakers = registry.circuit_breakers().all();
        Self::from_breakers(breakers.iter().map(|(_, breaker)| breaker))
    }

    /// Report over the given breakers, keyed by breaker name
    pub fn from_breakers<'a, I>(breakers: I) -> Self
    where
        I: IntoIterator<Item = &'a CircuitBreaker>,
    {
        let mut summary = HealthSummary::default();
        let mut circuit_breakers = BTreeMap::new();

        for breaker in breakers {
            if !breaker.config().register_health_indicator {
                continue;
            }
            let health = CircuitBreakerHealth::of(breaker);
            summary.count(health.state);
            circuit_breakers.insert(breaker.name().to_string(), health);
        }

        let status = if summary.open + summary.forced_open > 0 {
            HealthStatus::Down
        } else {
            HealthStatus::Up
        };
        Self { status, summary, circuit_breakers }
    }

    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    /// Names of breakers currently rejecting calls
    pub fn down_breakers(&self) -> Vec<&str> {
        self.circuit_breakers
            .iter()
            .filter(|(_, health)| health.status == HealthStatus::Down)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn status_of(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Open | CircuitState::ForcedOpen => HealthStatus::Down,
        CircuitState::Closed | CircuitState::HalfOpen | CircuitState::Disabled => HealthStatus::Up,
    }
}
