use crate::events::BreakerEvent;
use crate::CircuitState;
use paygate_core::Hooks;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked (on its own task) when an endpoint circuit changes state.
pub(crate) type TransitionCallback =
    Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Configuration for the per-endpoint circuit breaker.
pub struct BreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) open_duration: Duration,
    pub(crate) on_transition: Option<TransitionCallback>,
    pub(crate) hooks: Hooks<BreakerEvent>,
}

impl BreakerConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::new()
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`BreakerConfig`].
pub struct BreakerConfigBuilder {
    failure_threshold: u32,
    open_duration: Duration,
    on_transition: Option<TransitionCallback>,
    hooks: Hooks<BreakerEvent>,
}

impl BreakerConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            on_transition: None,
            hooks: Hooks::new(),
        }
    }

    /// Consecutive failures required to open a closed circuit.
    ///
    /// Default: 5
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// How long an open circuit rejects calls before allowing a probe.
    ///
    /// Default: 30 seconds
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Sets a callback fired asynchronously on every state transition.
    pub fn on_state_transition<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(callback));
        self
    }

    /// Attaches a named observer hook for breaker events. Hooks run inline;
    /// a panicking hook is contained and reported under its label.
    pub fn on_event<F>(mut self, label: &'static str, hook: F) -> Self
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.hooks.attach(label, hook);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_duration: self.open_duration,
            on_transition: self.on_transition,
            hooks: self.hooks,
        }
    }
}

impl Default for BreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
