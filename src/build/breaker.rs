//! Per-component circuit breaker.
//!
//! ```text
//! Closed --threshold failures--> Open --cool-down--> HalfOpen --success--> Closed
//!                                  ^                     |
//!                                  +------failure--------+
//! ```
//!
//! A changed fingerprint closes an open circuit at once: the source was
//! edited, so the previous failures no longer say anything about it.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::utils::hash::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant, fingerprint: Fingerprint },
    /// One probe build is in flight.
    HalfOpen { fingerprint: Fingerprint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// First attempt after the cool-down.
    Probe,
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    states: DashMap<String, State>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            states: DashMap::new(),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn check(&self, component: &str, fingerprint: Fingerprint) -> Admission {
        let Some(mut state) = self.states.get_mut(component) else {
            return Admission::Allowed;
        };
        let now = Instant::now();

        match *state {
            State::Closed { .. } => Admission::Allowed,
            State::Open { fingerprint: failed, .. } | State::HalfOpen { fingerprint: failed }
                if failed != fingerprint =>
            {
                *state = State::Closed { failures: 0 };
                Admission::Allowed
            }
            State::Open { until, fingerprint } if now >= until => {
                *state = State::HalfOpen { fingerprint };
                Admission::Probe
            }
            State::Open { until, .. } => Admission::Rejected {
                retry_in: until - now,
            },
            State::HalfOpen { .. } => Admission::Rejected {
                retry_in: self.cooldown,
            },
        }
    }

    pub fn record_success(&self, component: &str) {
        self.states.remove(component);
    }

    pub fn record_failure(&self, component: &str, fingerprint: Fingerprint) {
        let open = State::Open {
            until: Instant::now() + self.cooldown,
            fingerprint,
        };
        let mut state = self
            .states
            .entry(component.to_string())
            .or_insert(State::Closed { failures: 0 });

        *state = match *state {
            State::Closed { failures } if failures + 1 >= self.threshold => open,
            State::Closed { failures } => State::Closed {
                failures: failures + 1,
            },
            State::Open { .. } | State::HalfOpen { .. } => open,
        };
    }

    /// A probe that was cancelled leaves the circuit open but immediately
    /// probe-able again.
    pub fn release_probe(&self, component: &str) {
        if let Some(mut state) = self.states.get_mut(component)
            && let State::HalfOpen { fingerprint } = *state
        {
            *state = State::Open {
                until: Instant::now(),
                fingerprint,
            };
        }
    }

    pub fn state(&self, component: &str) -> CircuitState {
        match self.states.get(component).map(|s| *s) {
            None | Some(State::Closed { .. }) => CircuitState::Closed,
            Some(State::Open { .. }) => CircuitState::Open,
            Some(State::HalfOpen { .. }) => CircuitState::HalfOpen,
        }
    }

    pub fn forget(&self, component: &str) {
        self.states.remove(component);
    }
}
