//! Per-endpoint circuit breaking for outbound proxy calls.
//!
//! The gateway forwards buyer payloads to seller endpoints it does not
//! control. A misbehaving endpoint must not soak up retries forever, so each
//! endpoint gets its own circuit:
//!
//! 1. `Closed`: calls flow; consecutive failures are counted.
//! 2. `Open`: entered after `failure_threshold` consecutive failures; calls
//!    are rejected until `open_duration` has elapsed.
//! 3. `HalfOpen`: entered on the first acquire after the open window; exactly
//!    one probe call is admitted. Success closes the circuit, failure reopens
//!    it.
//!
//! A single [`CircuitBreaker`] registry is shared across all sessions; entries
//! are keyed by endpoint URL.
//!
//! # Example
//!
//! ```
//! use paygate_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     BreakerConfig::builder()
//!         .failure_threshold(3)
//!         .open_duration(Duration::from_secs(30))
//!         .build(),
//! );
//!
//! assert!(breaker.try_acquire("https://seller.example/api"));
//! breaker.record_failure("https://seller.example/api");
//! assert_eq!(breaker.state("https://seller.example/api"), CircuitState::Closed);
//! ```

mod circuit;
mod config;
mod events;

pub use circuit::CircuitState;
pub use config::{BreakerConfig, BreakerConfigBuilder};
pub use events::BreakerEvent;

use circuit::EndpointCircuit;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared registry of per-endpoint circuits.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

struct Inner {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, EndpointCircuit>>,
}

impl CircuitBreaker {
    /// Creates a registry with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                circuits: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns whether a call to `endpoint` is currently permitted.
    ///
    /// An open circuit whose window has elapsed is promoted to half-open and
    /// the caller is admitted as its single probe.
    pub fn try_acquire(&self, endpoint: &str) -> bool {
        let (permitted, transition) = {
            let mut circuits = self.inner.circuits.lock();
            let circuit = circuits
                .entry_ref(endpoint)
                .or_insert_with(EndpointCircuit::new);
            circuit.try_acquire(&self.inner.config)
        };

        self.after_update(endpoint, transition);

        if !permitted {
            #[cfg(feature = "metrics")]
            metrics::counter!(
                "paygate_breaker_rejections_total",
                "endpoint" => endpoint.to_string()
            )
            .increment(1);

            self.inner.config.hooks.dispatch(&BreakerEvent::CallRejected {
                endpoint: endpoint.to_string(),
                timestamp: std::time::Instant::now(),
            });
        }

        permitted
    }

    /// Records a successful call to `endpoint`.
    ///
    /// Resets the consecutive-failure counter; a half-open probe success
    /// closes the circuit.
    pub fn record_success(&self, endpoint: &str) {
        let transition = {
            let mut circuits = self.inner.circuits.lock();
            match circuits.get_mut(endpoint) {
                Some(circuit) => circuit.record_success(),
                None => None,
            }
        };
        self.after_update(endpoint, transition);
    }

    /// Records a failed call to `endpoint`.
    ///
    /// A half-open probe failure reopens the circuit immediately; in the
    /// closed state the circuit opens once `failure_threshold` consecutive
    /// failures accumulate.
    pub fn record_failure(&self, endpoint: &str) {
        let transition = {
            let mut circuits = self.inner.circuits.lock();
            let circuit = circuits
                .entry_ref(endpoint)
                .or_insert_with(EndpointCircuit::new);
            circuit.record_failure(&self.inner.config)
        };
        self.after_update(endpoint, transition);
    }

    /// Returns the current state for `endpoint` (Closed if never seen).
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.inner
            .circuits
            .lock()
            .get(endpoint)
            .map(|c| c.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Number of endpoints currently tracked.
    pub fn len(&self) -> usize {
        self.inner.circuits.lock().len()
    }

    /// Returns true when no endpoint is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.circuits.lock().is_empty()
    }

    /// Emits events and fires the transition callback outside the map lock.
    fn after_update(&self, endpoint: &str, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint, from = ?from, to = ?to, "circuit state transition");

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "paygate_breaker_transitions_total",
            "endpoint" => endpoint.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);

        self.inner.config.hooks.dispatch(&BreakerEvent::StateTransition {
            endpoint: endpoint.to_string(),
            timestamp: std::time::Instant::now(),
            from,
            to,
        });

        // The callback runs on its own task: a slow hook must not stall the
        // proxy hot path.
        if let Some(callback) = self.inner.config.on_transition.clone() {
            let endpoint = endpoint.to_string();
            tokio::spawn(async move {
                callback(&endpoint, from, to);
            });
        }
    }
}
