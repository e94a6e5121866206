//! Per-provider circuit breaker state machine.
//!
//! Closed counts failures; at the threshold the circuit opens and rejects
//! traffic until the recovery deadline, when the next admission request is
//! promoted to a single half-open trial. The trial's outcome decides between
//! closing again and re-opening with a fresh deadline. Transitions never
//! skip states.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// A state change produced by an admission check or a result report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    HalfOpened,
    Closed,
}

/// Circuit breaker for one provider. Callers hold the provider's health
/// mutex while driving it, so the machine itself needs no locking.
#[derive(Debug)]
pub struct Circuit {
    state: CircuitState,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

impl Circuit {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            open_until: None,
            trial_in_flight: false,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened
    }

    /// Milliseconds until an open circuit admits a trial, if currently open.
    pub fn open_remaining_ms(&self, now: Instant) -> Option<u64> {
        match (self.state, self.open_until) {
            (CircuitState::Open, Some(until)) => {
                Some(until.saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        }
    }

    /// Whether a request may pass right now. Promotes a due open circuit to
    /// half-open; in half-open only a single trial is admitted at a time.
    pub fn try_admit(&mut self, now: Instant) -> (bool, Option<CircuitTransition>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if self.open_until.is_some_and(|until| now >= until) {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    (true, Some(CircuitTransition::HalfOpened))
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    (false, None)
                } else {
                    self.trial_in_flight = true;
                    (true, None)
                }
            }
        }
    }

    /// Report a real-traffic result. `consecutive_failures` is the caller's
    /// updated post-result count; probe results must never reach this.
    pub fn on_result(
        &mut self,
        success: bool,
        consecutive_failures: u32,
        threshold: u32,
        recovery: Duration,
        now: Instant,
    ) -> Option<CircuitTransition> {
        match (self.state, success) {
            (CircuitState::HalfOpen, true) => {
                self.state = CircuitState::Closed;
                self.open_until = None;
                self.trial_in_flight = false;
                Some(CircuitTransition::Closed)
            }
            (CircuitState::HalfOpen, false) => {
                self.open(now, recovery);
                Some(CircuitTransition::Opened)
            }
            (CircuitState::Closed, false) if consecutive_failures >= threshold => {
                self.open(now, recovery);
                Some(CircuitTransition::Opened)
            }
            // Late results from requests admitted before the trip.
            _ => None,
        }
    }

    /// Clear a trial slot without reporting a result (cancellation path).
    pub fn abandon_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// Force the circuit closed, forgetting the deadline.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.open_until = None;
        self.trial_in_flight = false;
    }

    fn open(&mut self, now: Instant, recovery: Duration) {
        self.state = CircuitState::Open;
        self.open_until = Some(now + recovery);
        self.trial_in_flight = false;
        self.times_opened += 1;
    }
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECOVERY: Duration = Duration::from_secs(60);

    #[test]
    fn closed_admits_and_opens_at_threshold() {
        let mut circuit = Circuit::new();
        let now = Instant::now();
        assert!(circuit.try_admit(now).0);

        for failures in 1..5u32 {
            assert_eq!(circuit.on_result(false, failures, 5, RECOVERY, now), None);
        }
        assert_eq!(
            circuit.on_result(false, 5, 5, RECOVERY, now),
            Some(CircuitTransition::Opened)
        );
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.try_admit(now).0);
    }

    #[test]
    fn open_promotes_to_half_open_at_deadline() {
        let mut circuit = Circuit::new();
        let now = Instant::now();
        circuit.on_result(false, 5, 5, RECOVERY, now);
        assert_eq!(circuit.state(), CircuitState::Open);

        let before_deadline = now + Duration::from_secs(30);
        assert!(!circuit.try_admit(before_deadline).0);

        let after_deadline = now + Duration::from_secs(61);
        let (admitted, transition) = circuit.try_admit(after_deadline);
        assert!(admitted);
        assert_eq!(transition, Some(CircuitTransition::HalfOpened));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // Second caller is held back while the trial is in flight.
        assert!(!circuit.try_admit(after_deadline).0);
    }

    #[test]
    fn half_open_trial_success_closes() {
        let mut circuit = Circuit::new();
        let now = Instant::now();
        circuit.on_result(false, 5, 5, RECOVERY, now);
        let later = now + Duration::from_secs(61);
        circuit.try_admit(later);

        assert_eq!(
            circuit.on_result(true, 0, 5, RECOVERY, later),
            Some(CircuitTransition::Closed)
        );
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.try_admit(later).0);
    }

    #[test]
    fn half_open_trial_failure_reopens_with_fresh_deadline() {
        let mut circuit = Circuit::new();
        let now = Instant::now();
        circuit.on_result(false, 5, 5, RECOVERY, now);
        let later = now + Duration::from_secs(61);
        circuit.try_admit(later);

        assert_eq!(
            circuit.on_result(false, 6, 5, RECOVERY, later),
            Some(CircuitTransition::Opened)
        );
        assert_eq!(circuit.state(), CircuitState::Open);
        // new deadline counted from the half-open failure
        assert!(!circuit.try_admit(later + Duration::from_secs(59)).0);
        assert!(circuit.try_admit(later + Duration::from_secs(61)).0);
    }

    #[test]
    fn abandon_trial_frees_the_slot() {
        let mut circuit = Circuit::new();
        let now = Instant::now();
        circuit.on_result(false, 5, 5, RECOVERY, now);
        let later = now + Duration::from_secs(61);
        assert!(circuit.try_admit(later).0);
        assert!(!circuit.try_admit(later).0);
        circuit.abandon_trial();
        assert!(circuit.try_admit(later).0);
    }
}
