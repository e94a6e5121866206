//! The health & metrics store: one guarded record per provider, a global
//! aggregate, an event channel, and the probe loop.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_types::Provider;

use crate::circuit::{Circuit, CircuitState, CircuitTransition};
use crate::HealthConfig;

/// Mutable health record for one provider.
///
/// All mutation happens under the per-provider mutex held by the store; the
/// struct itself is lock-free.
#[derive(Debug)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    /// Cumulative running mean over real requests and probes.
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: u64,
    latency_samples: u64,
    /// Real traffic only; probes never touch the counters.
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub circuit: Circuit,
}

impl ProviderHealth {
    fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            healthy: true,
            last_probe_at: None,
            last_latency_ms: None,
            avg_latency_ms: 0.0,
            min_latency_ms: None,
            max_latency_ms: 0,
            latency_samples: 0,
            total_requests: 0,
            total_failures: 0,
            consecutive_failures: 0,
            in_flight: 0,
            last_used_at: None,
            circuit: Circuit::new(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.total_failures as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    /// Scalar fitness in [0, 1]: 0.4 for liveness, up to 0.3 for latency
    /// under a second, up to 0.3 for the error rate once real traffic
    /// exists. An untouched healthy record scores exactly 0.7.
    pub fn health_score(&self) -> f64 {
        let liveness = if self.healthy { 0.4 } else { 0.0 };
        let latency = 0.3 * (1.0 - self.avg_latency_ms / 1000.0).max(0.0);
        let errors = if self.total_requests > 0 {
            0.3 * (1.0 - self.error_rate())
        } else {
            0.0
        };
        (liveness + latency + errors).clamp(0.0, 1.0)
    }

    fn observe_latency(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.latency_samples += 1;
        self.avg_latency_ms += (ms as f64 - self.avg_latency_ms) / self.latency_samples as f64;
        self.min_latency_ms = Some(self.min_latency_ms.map_or(ms, |min| min.min(ms)));
        self.max_latency_ms = self.max_latency_ms.max(ms);
        self.last_latency_ms = Some(ms);
    }

    fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            provider_id: self.provider_id.clone(),
            healthy: self.healthy,
            circuit_state: self.circuit.state(),
            circuit_open_remaining_ms: self.circuit.open_remaining_ms(Instant::now()),
            circuit_times_opened: self.circuit.times_opened(),
            health_score: self.health_score(),
            error_rate: self.error_rate(),
            avg_latency_ms: self.avg_latency_ms,
            min_latency_ms: self.min_latency_ms,
            max_latency_ms: self.max_latency_ms,
            total_requests: self.total_requests,
            total_failures: self.total_failures,
            consecutive_failures: self.consecutive_failures,
            in_flight: self.in_flight,
            last_probe_at: self.last_probe_at,
            last_used_at: self.last_used_at,
        }
    }
}

/// Serializable point-in-time view of one provider's health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider_id: String,
    pub healthy: bool,
    pub circuit_state: CircuitState,
    pub circuit_open_remaining_ms: Option<u64>,
    pub circuit_times_opened: u64,
    pub health_score: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub in_flight: u32,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Cross-provider aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: u64,
}

/// Health and circuit events, for log sinks and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthEvent {
    CircuitOpened {
        provider_id: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },
    CircuitHalfOpened {
        provider_id: String,
        timestamp: DateTime<Utc>,
    },
    CircuitClosed {
        provider_id: String,
        timestamp: DateTime<Utc>,
    },
    ProbeFailed {
        provider_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

/// Outcome of an admission check against a provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Traffic may pass; `trial` marks the single half-open probe slot.
    Granted { trial: bool },
    /// The circuit is open.
    Rejected,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

/// Store of per-provider health records plus the probe loop.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct HealthStore {
    config: HealthConfig,
    providers: Arc<DashMap<String, Arc<Mutex<ProviderHealth>>>>,
    probe_targets: Arc<DashMap<String, Arc<dyn Provider>>>,
    aggregate: Arc<Mutex<AggregateSnapshot>>,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<HealthEvent>>>>,
    started: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl HealthStore {
    pub fn new(config: HealthConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            providers: Arc::new(DashMap::new()),
            probe_targets: Arc::new(DashMap::new()),
            aggregate: Arc::new(Mutex::new(AggregateSnapshot::default())),
            event_tx,
            event_rx: Arc::new(Mutex::new(Some(event_rx))),
            started: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Fetch or lazily create the record for a provider.
    fn entry(&self, provider_id: &str) -> Arc<Mutex<ProviderHealth>> {
        self.providers
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(provider_id))))
            .clone()
    }

    /// Register a provider for periodic probing.
    pub fn register_probe_target(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        self.entry(&id);
        self.probe_targets.insert(id, provider);
    }

    /// Admission check against the provider's circuit; promotes a due open
    /// circuit to half-open. Callers that claim a trial slot but never run
    /// the request must call [`HealthStore::abandon_trial`].
    pub fn try_admit(&self, provider_id: &str) -> Admission {
        let entry = self.entry(provider_id);
        let mut health = entry.lock();
        let (admitted, transition) = health.circuit.try_admit(Instant::now());
        let was_trial = matches!(transition, Some(CircuitTransition::HalfOpened))
            || (admitted && health.circuit.state() == CircuitState::HalfOpen);
        drop(health);

        if let Some(CircuitTransition::HalfOpened) = transition {
            info!(provider_id, "circuit half-open, admitting trial request");
            let _ = self.event_tx.send(HealthEvent::CircuitHalfOpened {
                provider_id: provider_id.to_string(),
                timestamp: Utc::now(),
            });
        }

        if admitted {
            Admission::Granted { trial: was_trial }
        } else {
            Admission::Rejected
        }
    }

    /// Free a claimed half-open trial slot without reporting a result.
    pub fn abandon_trial(&self, provider_id: &str) {
        let entry = self.entry(provider_id);
        entry.lock().circuit.abandon_trial();
    }

    /// Mark a request as started against a provider.
    pub fn begin_request(&self, provider_id: &str) {
        let entry = self.entry(provider_id);
        let mut health = entry.lock();
        health.in_flight += 1;
        health.last_used_at = Some(Utc::now());
    }

    /// Release the in-flight slot without a result (cancellation path).
    pub fn release_in_flight(&self, provider_id: &str) {
        let entry = self.entry(provider_id);
        let mut health = entry.lock();
        health.in_flight = health.in_flight.saturating_sub(1);
        health.circuit.abandon_trial();
    }

    /// Record the completion of a real request. Updates counters, the
    /// latency mean, the circuit, and the global aggregate.
    pub fn record_request_result(&self, provider_id: &str, success: bool, latency: Duration) {
        let threshold = if self.config.enable_circuit_breaker {
            self.config.circuit_breaker_threshold
        } else {
            u32::MAX
        };

        let transition = {
            let entry = self.entry(provider_id);
            let mut health = entry.lock();
            health.in_flight = health.in_flight.saturating_sub(1);
            health.total_requests += 1;
            if success {
                if health.circuit.state() != CircuitState::Open {
                    health.consecutive_failures = 0;
                }
            } else {
                health.total_failures += 1;
                health.consecutive_failures += 1;
            }
            if self.config.enable_metrics {
                health.observe_latency(latency);
            }
            health.last_used_at = Some(Utc::now());
            let consecutive = health.consecutive_failures;
            health.circuit.on_result(
                success,
                consecutive,
                threshold,
                self.config.recovery_timeout,
                Instant::now(),
            )
        };

        match transition {
            Some(CircuitTransition::Opened) => {
                warn!(provider_id, "circuit opened after repeated failures");
                let consecutive = self.entry(provider_id).lock().consecutive_failures;
                let _ = self.event_tx.send(HealthEvent::CircuitOpened {
                    provider_id: provider_id.to_string(),
                    consecutive_failures: consecutive,
                    timestamp: Utc::now(),
                });
            }
            Some(CircuitTransition::Closed) => {
                info!(provider_id, "circuit closed, provider recovered");
                let _ = self.event_tx.send(HealthEvent::CircuitClosed {
                    provider_id: provider_id.to_string(),
                    timestamp: Utc::now(),
                });
            }
            _ => {}
        }

        let mut aggregate = self.aggregate.lock();
        if success {
            aggregate.successful_requests += 1;
        } else {
            aggregate.failed_requests += 1;
        }
        if self.config.enable_metrics {
            let ms = latency.as_millis() as u64;
            aggregate.latency_samples += 1;
            aggregate.avg_latency_ms +=
                (ms as f64 - aggregate.avg_latency_ms) / aggregate.latency_samples as f64;
            aggregate.min_latency_ms = Some(aggregate.min_latency_ms.map_or(ms, |min| min.min(ms)));
            aggregate.max_latency_ms = aggregate.max_latency_ms.max(ms);
        }
    }

    /// Record a probe outcome. Probes update liveness and the latency mean
    /// but never the failure counters or the circuit threshold.
    pub fn record_probe_result(
        &self,
        provider_id: &str,
        healthy: bool,
        latency: Option<Duration>,
    ) {
        let entry = self.entry(provider_id);
        let mut health = entry.lock();
        health.healthy = healthy;
        health.last_probe_at = Some(Utc::now());
        if let Some(latency) = latency {
            health.observe_latency(latency);
        }
    }

    pub fn circuit_state(&self, provider_id: &str) -> CircuitState {
        self.entry(provider_id).lock().circuit.state()
    }

    pub fn health_score(&self, provider_id: &str) -> f64 {
        self.entry(provider_id).lock().health_score()
    }

    pub fn is_healthy(&self, provider_id: &str) -> bool {
        self.entry(provider_id).lock().healthy
    }

    pub fn avg_latency_ms(&self, provider_id: &str) -> f64 {
        self.entry(provider_id).lock().avg_latency_ms
    }

    pub fn in_flight(&self, provider_id: &str) -> u32 {
        self.entry(provider_id).lock().in_flight
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<HealthSnapshot> {
        self.providers
            .get(provider_id)
            .map(|entry| entry.lock().snapshot())
    }

    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        self.providers
            .iter()
            .map(|entry| entry.value().lock().snapshot())
            .collect()
    }

    pub fn aggregate(&self) -> AggregateSnapshot {
        self.aggregate.lock().clone()
    }

    /// Take the event receiver; only one consumer can exist.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<HealthEvent>> {
        self.event_rx.lock().take()
    }

    /// Zero all counters and close all circuits. Probe targets survive.
    pub fn reset_statistics(&self) {
        for entry in self.providers.iter() {
            let mut health = entry.value().lock();
            let id = health.provider_id.clone();
            *health = ProviderHealth::new(id);
        }
        *self.aggregate.lock() = AggregateSnapshot::default();
    }

    /// Start the probe loop. Idempotent; a no-op when probing is disabled.
    pub fn start(&self) {
        if !self.config.enable_health_check {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = store.shutdown.cancelled() => break,
                    _ = interval.tick() => store.probe_all().await,
                }
            }
            debug!("health probe loop stopped");
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Probe every registered target once, in parallel.
    pub async fn probe_all(&self) {
        let targets: Vec<(String, Arc<dyn Provider>)> = self
            .probe_targets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let probes = targets.into_iter().map(|(id, provider)| {
            let store = self.clone();
            async move {
                let started = Instant::now();
                match tokio::time::timeout(store.config.probe_timeout, provider.check_health())
                    .await
                {
                    Ok(Ok(())) => {
                        store.record_probe_result(&id, true, Some(started.elapsed()));
                    }
                    Ok(Err(err)) => {
                        store.record_probe_result(&id, false, None);
                        debug!(provider_id = %id, error = %err, "probe failed");
                        let _ = store.event_tx.send(HealthEvent::ProbeFailed {
                            provider_id: id,
                            error: err.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                    Err(_) => {
                        store.record_probe_result(&id, false, None);
                        let _ = store.event_tx.send(HealthEvent::ProbeFailed {
                            provider_id: id,
                            error: "probe timeout".to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        });
        futures::future::join_all(probes).await;
    }
}
