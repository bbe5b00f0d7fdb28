use std::time::Duration;

/// Configuration for the idempotency cache.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Maximum number of entries (in-flight reservations plus completed
    /// results). At capacity, new keys proceed without dedup.
    ///
    /// Default: 10,000
    pub capacity: usize,
    /// How long a completed outcome is served before it expires.
    ///
    /// Default: 5 minutes
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}
