use crate::CircuitState;
use std::time::Instant;

/// Events reported by the circuit breaker registry to its observer hooks.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// An endpoint circuit changed state.
    StateTransition {
        endpoint: String,
        timestamp: Instant,
        from: CircuitState,
        to: CircuitState,
    },
    /// A call was rejected by an open or probing circuit.
    CallRejected { endpoint: String, timestamp: Instant },
}

impl BreakerEvent {
    /// The endpoint this event concerns.
    pub fn endpoint(&self) -> &str {
        match self {
            BreakerEvent::StateTransition { endpoint, .. } => endpoint,
            BreakerEvent::CallRejected { endpoint, .. } => endpoint,
        }
    }
}
