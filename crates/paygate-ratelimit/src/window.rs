use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The request may proceed.
    Allowed {
        /// Requests remaining in the current window.
        remaining: u32,
    },
    /// The request exceeds the session's cap for this window.
    Denied {
        /// How long until the window rolls over.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Returns true for [`RateDecision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Fixed-window state for one session.
///
/// When the window rolls over after idle time the new allowance is
/// `limit * min(elapsed_windows, 2)`: a session idle for one window gets one
/// window's worth, anything longer is capped at two.
pub(crate) struct WindowEntry {
    window_start: Instant,
    count: u32,
    allowance: u32,
    last_seen: Instant,
}

impl WindowEntry {
    pub(crate) fn new(limit: u32) -> Self {
        let now = Instant::now();
        Self {
            window_start: now,
            count: 0,
            allowance: limit.max(1),
            last_seen: now,
        }
    }

    pub(crate) fn check(&mut self, limit: u32, window: Duration) -> RateDecision {
        let now = Instant::now();
        self.last_seen = now;
        let limit = limit.max(1);

        let elapsed = now.duration_since(self.window_start);
        if elapsed >= window {
            let elapsed_windows =
                (elapsed.as_secs_f64() / window.as_secs_f64()) as u32;
            self.allowance = limit.saturating_mul(elapsed_windows.clamp(1, 2));
            self.window_start = now;
            self.count = 1;
            return RateDecision::Allowed {
                remaining: self.allowance - 1,
            };
        }

        if self.count >= self.allowance {
            RateDecision::Denied {
                retry_after: window - elapsed,
            }
        } else {
            self.count += 1;
            RateDecision::Allowed {
                remaining: self.allowance - self.count,
            }
        }
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }
}
