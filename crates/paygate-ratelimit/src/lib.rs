//! Per-session request rate limiting.
//!
//! Each session carries its own per-minute cap, so the limiter is a keyed
//! registry of fixed 60-second windows rather than a single shared bucket.
//! A window that rolls over after idle time grants a carry-over allowance of
//! at most two windows' worth of requests, preventing unbounded accumulation
//! while still letting a briefly idle session burst.
//!
//! Entries idle for more than two windows are reclaimed by [`RateLimiter::sweep`],
//! which the gateway timer runs on every tick.
//!
//! # Example
//!
//! ```
//! use paygate_ratelimit::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! assert!(limiter.check("gws_abc", 60).is_allowed());
//! ```

mod config;
mod window;

pub use config::RateLimitConfig;
pub use window::RateDecision;

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use window::WindowEntry;

/// Shared registry of per-session fixed windows.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl RateLimiter {
    /// Creates a registry with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Records one request for `session_id` against `limit` requests/window.
    pub fn check(&self, session_id: &str, limit: u32) -> RateDecision {
        let decision = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry_ref(session_id)
                .or_insert_with(|| WindowEntry::new(limit));
            entry.check(limit, self.inner.config.window)
        };

        if let RateDecision::Denied { .. } = decision {
            #[cfg(feature = "tracing")]
            tracing::debug!(session_id, limit, "request rate limited");

            #[cfg(feature = "metrics")]
            metrics::counter!("paygate_ratelimit_denials_total").increment(1);
        }

        decision
    }

    /// Drops the entry for a session (called when the session closes).
    pub fn remove(&self, session_id: &str) {
        self.inner.entries.lock().remove(session_id);
    }

    /// Removes entries idle for more than two windows. Returns how many were
    /// reclaimed.
    pub fn sweep(&self) -> usize {
        let horizon = self.inner.config.window * 2;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.idle_for() <= horizon);
        let swept = before - entries.len();

        #[cfg(feature = "metrics")]
        if swept > 0 {
            metrics::counter!("paygate_ratelimit_swept_total").increment(swept as u64);
        }

        swept
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true when no session is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}
