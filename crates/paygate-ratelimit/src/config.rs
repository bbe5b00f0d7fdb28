use std::time::Duration;

/// Configuration for the per-session rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Length of one fixed window.
    ///
    /// Default: 60 seconds
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
        }
    }
}
