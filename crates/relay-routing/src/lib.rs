//! Relay Routing - upstream selection for virtual models
//!
//! The router intersects a virtual model's targets with the providers whose
//! circuits currently admit traffic, picks a load-balancing strategy from the
//! health picture, applies it, and hands back the chosen provider plus a
//! fallback list ordered by health score. Provider-side failures are not the
//! router's business: retry policy lives in the execution optimizer, which
//! asks for a fresh decision on every attempt.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use relay_health::HealthStore;
use relay_types::{RelayError, Result, VirtualModel};

/// Load-balancing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRandom,
    LeastLatency,
    LeastConnections,
    HealthAware,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::WeightedRandom => "weighted_random",
            Strategy::LeastLatency => "least_latency",
            Strategy::LeastConnections => "least_connections",
            Strategy::HealthAware => "health_aware",
        }
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// When off, every decision uses round-robin regardless of health.
    pub enable_load_balancing: bool,
    /// Pin one strategy instead of letting the health picture choose.
    pub strategy_override: Option<Strategy>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_load_balancing: true,
            strategy_override: None,
        }
    }
}

/// The outcome of one routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub provider_id: String,
    pub strategy: Strategy,
    /// Remaining candidates in decreasing health-score order.
    pub fallbacks: Vec<String>,
    pub estimated_latency_ms: f64,
    pub success_probability: f64,
    pub decided_at: DateTime<Utc>,
    /// The selection claimed a half-open trial slot.
    pub trial: bool,
}

/// Counters over routing activity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingStats {
    pub decisions: u64,
    pub failures: u64,
    pub by_strategy: HashMap<String, u64>,
    pub by_provider: HashMap<String, u64>,
}

struct Candidate {
    id: String,
    trial: bool,
    weight: f64,
    healthy: bool,
    score: f64,
    avg_latency_ms: f64,
    in_flight: u32,
    error_rate: f64,
}

/// The routing optimizer.
#[derive(Clone)]
pub struct Router {
    config: RouterConfig,
    health: Arc<HealthStore>,
    cursors: Arc<DashMap<String, AtomicUsize>>,
    stats: Arc<Mutex<RoutingStats>>,
}

impl Router {
    pub fn new(config: RouterConfig, health: Arc<HealthStore>) -> Self {
        Self {
            config,
            health,
            cursors: Arc::new(DashMap::new()),
            stats: Arc::new(Mutex::new(RoutingStats::default())),
        }
    }

    /// Pick one provider (plus fallbacks) for a virtual model.
    pub fn decide(&self, virtual_model: &VirtualModel) -> Result<RoutingDecision> {
        virtual_model.validate()?;

        let mut candidates = self.admit_candidates(virtual_model);
        if candidates.is_empty() {
            self.stats.lock().failures += 1;
            return Err(RelayError::NoHealthyProvider {
                virtual_model: virtual_model.id.clone(),
            });
        }
        // Canonical order makes round-robin fair and tie-breaks deterministic.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let strategy = self.pick_strategy(&candidates);
        let chosen_index = self.apply_strategy(strategy, &candidates);
        let chosen = &candidates[chosen_index];

        // Unchosen candidates that were admitted as half-open trials give the
        // slot back; the chosen one's slot is cleared when its result lands.
        for (i, candidate) in candidates.iter().enumerate() {
            if i != chosen_index && candidate.trial {
                self.health.abandon_trial(&candidate.id);
            }
        }

        let mut fallbacks: Vec<&Candidate> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen_index)
            .map(|(_, c)| c)
            .collect();
        fallbacks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let decision = RoutingDecision {
            provider_id: chosen.id.clone(),
            strategy,
            fallbacks: fallbacks.iter().map(|c| c.id.clone()).collect(),
            estimated_latency_ms: chosen.avg_latency_ms,
            success_probability: (1.0 - chosen.error_rate).clamp(0.0, 1.0),
            decided_at: Utc::now(),
            trial: chosen.trial,
        };

        {
            let mut stats = self.stats.lock();
            stats.decisions += 1;
            *stats
                .by_strategy
                .entry(strategy.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_provider
                .entry(decision.provider_id.clone())
                .or_insert(0) += 1;
        }

        debug!(
            virtual_model = %virtual_model.id,
            provider = %decision.provider_id,
            strategy = strategy.as_str(),
            fallbacks = decision.fallbacks.len(),
            "routing decision"
        );
        Ok(decision)
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats.lock().clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = RoutingStats::default();
        self.cursors.clear();
    }

    fn admit_candidates(&self, virtual_model: &VirtualModel) -> Vec<Candidate> {
        virtual_model
            .targets
            .iter()
            .filter_map(|target| {
                let admission = self.health.try_admit(&target.provider_id);
                match admission {
                    relay_health::Admission::Granted { trial } => {
                        let snapshot = self.health.snapshot(&target.provider_id);
                        let (healthy, score, avg, in_flight, error_rate) = snapshot
                            .map(|s| {
                                (
                                    s.healthy,
                                    s.health_score,
                                    s.avg_latency_ms,
                                    s.in_flight,
                                    s.error_rate,
                                )
                            })
                            .unwrap_or((true, 0.7, 0.0, 0, 0.0));
                        Some(Candidate {
                            id: target.provider_id.clone(),
                            trial,
                            weight: target.weight.unwrap_or(1.0),
                            healthy,
                            score,
                            avg_latency_ms: avg,
                            in_flight,
                            error_rate,
                        })
                    }
                    relay_health::Admission::Rejected => None,
                }
            })
            .collect()
    }

    fn pick_strategy(&self, candidates: &[Candidate]) -> Strategy {
        if !self.config.enable_load_balancing {
            return Strategy::RoundRobin;
        }
        if let Some(strategy) = self.config.strategy_override {
            return strategy;
        }

        let mean_score =
            candidates.iter().map(|c| c.score).sum::<f64>() / candidates.len() as f64;
        if mean_score < 0.5 {
            return Strategy::HealthAware;
        }
        if latency_spread_ms(candidates) > 100.0 {
            return Strategy::LeastLatency;
        }
        Strategy::WeightedRandom
    }

    fn apply_strategy(&self, strategy: Strategy, candidates: &[Candidate]) -> usize {
        match strategy {
            Strategy::RoundRobin => {
                let key = candidates
                    .iter()
                    .map(|c| c.id.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                let cursor = self
                    .cursors
                    .entry(key)
                    .or_insert_with(|| AtomicUsize::new(0));
                cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            Strategy::WeightedRandom => {
                // 1.0 for healthy, 0.1 for merely-admitted, scaled by the
                // target's configured weight.
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|c| if c.healthy { 1.0 } else { 0.1 } * c.weight.max(0.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                if total <= 0.0 {
                    return 0;
                }
                let mut draw = rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..total);
                for (i, weight) in weights.iter().enumerate() {
                    if draw < *weight {
                        return i;
                    }
                    draw -= weight;
                }
                candidates.len() - 1
            }
            Strategy::LeastLatency => argmin_by(candidates, |c| c.avg_latency_ms),
            Strategy::LeastConnections => argmin_by(candidates, |c| c.in_flight as f64),
            Strategy::HealthAware => argmin_by(candidates, |c| -c.score),
        }
    }
}

/// Population standard deviation of candidate mean latencies.
fn latency_spread_ms(candidates: &[Candidate]) -> f64 {
    if candidates.len() < 2 {
        return 0.0;
    }
    let mean = candidates.iter().map(|c| c.avg_latency_ms).sum::<f64>() / candidates.len() as f64;
    let variance = candidates
        .iter()
        .map(|c| (c.avg_latency_ms - mean).powi(2))
        .sum::<f64>()
        / candidates.len() as f64;
    variance.sqrt()
}

/// Index of the candidate minimizing `key`; candidates arrive sorted by id,
/// so the first minimum is the lexicographic tie-break.
fn argmin_by(candidates: &[Candidate], key: impl Fn(&Candidate) -> f64) -> usize {
    let mut best = 0;
    let mut best_key = key(&candidates[0]);
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        let k = key(candidate);
        if k < best_key {
            best = i;
            best_key = k;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_health::{HealthConfig, HealthStore};
    use relay_types::{Target, VirtualModel};
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn setup() -> (Arc<HealthStore>, Router) {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let router = Router::new(RouterConfig::default(), health.clone());
        (health, router)
    }

    fn vm(targets: &[&str]) -> VirtualModel {
        let mut vm = VirtualModel::new("vm-test");
        for t in targets {
            vm = vm.with_target(Target::new(*t));
        }
        vm
    }

    #[test]
    fn empty_virtual_model_is_a_configuration_error() {
        let (_, router) = setup();
        let err = router.decide(&VirtualModel::new("vm-empty")).unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn all_circuits_open_yields_no_healthy_provider() {
        let (health, router) = setup();
        for _ in 0..5 {
            health.begin_request("p1");
            health.record_request_result("p1", false, Duration::from_millis(5));
        }
        let err = router.decide(&vm(&["p1"])).unwrap_err();
        assert!(matches!(err, RelayError::NoHealthyProvider { .. }));
        assert_eq!(router.stats().failures, 1);
    }

    #[test]
    fn round_robin_is_fair_over_many_calls() {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let config = RouterConfig {
            enable_load_balancing: false,
            strategy_override: None,
        };
        let router = Router::new(config, health);
        let model = vm(&["p1", "p2", "p3"]);

        let mut counts: StdHashMap<String, u32> = StdHashMap::new();
        for _ in 0..1000 {
            let decision = router.decide(&model).unwrap();
            assert_eq!(decision.strategy, Strategy::RoundRobin);
            *counts.entry(decision.provider_id).or_insert(0) += 1;
        }
        for provider in ["p1", "p2", "p3"] {
            let n = counts[provider];
            assert!((333..=334).contains(&n), "{provider} selected {n} times");
        }
    }

    #[test]
    fn unhealthy_fleet_switches_to_health_aware() {
        let (health, router) = setup();
        // two unhealthy probes drag the mean score under 0.5
        health.record_probe_result("p1", false, None);
        health.record_probe_result("p2", false, None);
        health.record_probe_result("p3", true, Some(Duration::from_millis(1)));

        let decision = router.decide(&vm(&["p1", "p2", "p3"])).unwrap();
        assert_eq!(decision.strategy, Strategy::HealthAware);
        assert_eq!(decision.provider_id, "p3");
    }

    #[test]
    fn wide_latency_spread_switches_to_least_latency() {
        let (health, router) = setup();
        for _ in 0..3 {
            health.begin_request("p1");
            health.record_request_result("p1", true, Duration::from_millis(800));
            health.begin_request("p2");
            health.record_request_result("p2", true, Duration::from_millis(20));
        }

        let decision = router.decide(&vm(&["p1", "p2"])).unwrap();
        assert_eq!(decision.strategy, Strategy::LeastLatency);
        assert_eq!(decision.provider_id, "p2");
    }

    #[test]
    fn healthy_tight_fleet_uses_weighted_random() {
        let (_, router) = setup();
        let decision = router.decide(&vm(&["p1", "p2"])).unwrap();
        assert_eq!(decision.strategy, Strategy::WeightedRandom);
        assert!(["p1", "p2"].contains(&decision.provider_id.as_str()));
    }

    #[test]
    fn strategy_override_reaches_least_connections() {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let config = RouterConfig {
            enable_load_balancing: true,
            strategy_override: Some(Strategy::LeastConnections),
        };
        let router = Router::new(config, health.clone());

        health.begin_request("p1");
        health.begin_request("p1");
        health.begin_request("p2");

        let decision = router.decide(&vm(&["p1", "p2"])).unwrap();
        assert_eq!(decision.strategy, Strategy::LeastConnections);
        assert_eq!(decision.provider_id, "p2");
    }

    #[test]
    fn fallbacks_are_ordered_by_health_score() {
        let health = Arc::new(HealthStore::new(HealthConfig::default()));
        let config = RouterConfig {
            enable_load_balancing: true,
            strategy_override: Some(Strategy::LeastLatency),
        };
        let router = Router::new(config, health.clone());

        // p1 fastest (chosen); p2 healthy; p3 unhealthy and slow
        health.begin_request("p1");
        health.record_request_result("p1", true, Duration::from_millis(5));
        health.begin_request("p2");
        health.record_request_result("p2", true, Duration::from_millis(50));
        health.record_probe_result("p3", false, Some(Duration::from_millis(200)));

        let decision = router.decide(&vm(&["p1", "p2", "p3"])).unwrap();
        assert_eq!(decision.provider_id, "p1");
        assert_eq!(decision.fallbacks, vec!["p2".to_string(), "p3".to_string()]);
    }

    #[test]
    fn open_circuit_is_excluded_until_recovery() {
        let health = Arc::new(HealthStore::new(HealthConfig {
            recovery_timeout: Duration::from_millis(0),
            ..HealthConfig::default()
        }));
        let router = Router::new(RouterConfig::default(), health.clone());

        for _ in 0..5 {
            health.begin_request("p1");
            health.record_request_result("p1", false, Duration::from_millis(5));
        }
        // zero recovery timeout: the next decision admits p1 as the trial
        let decision = router.decide(&vm(&["p1"])).unwrap();
        assert_eq!(decision.provider_id, "p1");
        assert!(decision.trial);
    }

    #[test]
    fn decision_counters_accumulate() {
        let (_, router) = setup();
        let model = vm(&["p1"]);
        for _ in 0..3 {
            router.decide(&model).unwrap();
        }
        let stats = router.stats();
        assert_eq!(stats.decisions, 3);
        assert_eq!(stats.by_provider["p1"], 3);
    }
}
