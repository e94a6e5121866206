//! Relay Health - per-provider health records, circuit breaking, metrics
//!
//! One mutable health record exists per provider, created lazily on first
//! reference and guarded by its own mutex so concurrent result updates never
//! lose increments. A circuit breaker per provider short-circuits traffic to
//! persistently failing upstreams; a background probe loop keeps liveness
//! fresh without feeding the circuit threshold.

use std::time::Duration;

pub mod circuit;
pub mod store;

pub use circuit::{Circuit, CircuitState, CircuitTransition};
pub use store::{
    Admission, AggregateSnapshot, HealthEvent, HealthSnapshot, HealthStore, ProviderHealth,
};

/// Health and circuit-breaker configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Run the periodic probe loop.
    pub enable_health_check: bool,
    /// Probe loop wake-up interval.
    pub health_check_interval: Duration,
    /// Per-probe timeout; a timed-out probe counts as unhealthy.
    pub probe_timeout: Duration,
    /// Whether circuits may open at all.
    pub enable_circuit_breaker: bool,
    /// Consecutive real-traffic failures that open the circuit.
    pub circuit_breaker_threshold: u32,
    /// How long an open circuit rejects before admitting a trial.
    pub recovery_timeout: Duration,
    /// When off, latency and aggregate metrics are not collected; circuit
    /// accounting still runs.
    pub enable_metrics: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enable_health_check: true,
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            enable_metrics: true,
        }
    }
}
