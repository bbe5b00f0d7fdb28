use crate::config::BreakerConfig;
use tokio::time::Instant;

/// Represents the state of one endpoint's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// The circuit is closed and calls are allowed.
    Closed,
    /// The circuit is open and calls are rejected.
    Open,
    /// The circuit is half-open and a single probe call is allowed.
    HalfOpen,
}

impl CircuitState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// State machine for a single endpoint.
///
/// All methods return the `(from, to)` transition they caused, if any, so the
/// registry can emit events after the map lock is released.
pub(crate) struct EndpointCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_state_change: Instant,
    probe_in_flight: bool,
}

impl EndpointCircuit {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_state_change: Instant::now(),
            probe_in_flight: false,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn try_acquire(
        &mut self,
        config: &BreakerConfig,
    ) -> (bool, Option<(CircuitState, CircuitState)>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                if self.last_state_change.elapsed() >= config.open_duration {
                    let transition = self.transition_to(CircuitState::HalfOpen);
                    self.probe_in_flight = true;
                    (true, transition)
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    (false, None)
                } else {
                    self.probe_in_flight = true;
                    (true, None)
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self) -> Option<(CircuitState, CircuitState)> {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => self.transition_to(CircuitState::Closed),
            _ => None,
        }
    }

    pub(crate) fn record_failure(
        &mut self,
        config: &BreakerConfig,
    ) -> Option<(CircuitState, CircuitState)> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open),
            CircuitState::Closed => {
                if self.consecutive_failures >= config.failure_threshold {
                    self.transition_to(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn transition_to(&mut self, state: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == state {
            return None;
        }
        let from = self.state;
        self.state = state;
        self.last_state_change = Instant::now();
        self.probe_in_flight = false;
        if state == CircuitState::Closed {
            self.consecutive_failures = 0;
        }
        Some((from, state))
    }
}
