//! `DestinationHealth` records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::DestinationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::str::FromStr for CircuitBreakerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitBreakerState::Closed),
            "open" => Ok(CircuitBreakerState::Open),
            "half_open" => Ok(CircuitBreakerState::HalfOpen),
            other => anyhow::bail!("unknown circuit breaker state: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disabled => "disabled",
        }
    }
}

/// Per-destination health counters and circuit breaker state, created lazily on
/// first delivery attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DestinationHealth {
    pub destination_id: DestinationId,
    pub consecutive_failures: i32,
    pub total_failures: i64,
    pub total_deliveries: i64,
    pub average_response_time_ms: f64,
    pub circuit_breaker_state: String,
    pub circuit_breaker_opened_at: Option<DateTime<Utc>>,
    /// Set when a `half_open` probe is claimed, cleared by whatever state
    /// transition follows. Admits at most one in-flight probe per destination.
    pub half_open_probe_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl DestinationHealth {
    pub fn state(&self) -> CircuitBreakerState {
        self.circuit_breaker_state.parse().unwrap_or(CircuitBreakerState::Closed)
    }

    /// Lifetime success rate. The circuit breaker itself acts on `consecutive_failures`,
    /// which is windowless by construction.
    pub fn success_rate(&self) -> f64 {
        if self.total_deliveries == 0 {
            return 1.0;
        }
        let successes = self.total_deliveries - self.total_failures;
        successes as f64 / self.total_deliveries as f64
    }
}
