//! Idempotency deduplication for proxy calls.
//!
//! A buyer retrying a proxy call with the same idempotency key must not be
//! charged twice. The cache keys on `(session id, client key)` and plays two
//! roles at once:
//!
//! - **In-flight dedup** (singleflight): the first caller reserves the key and
//!   executes; concurrent callers with the same key wait on a completion
//!   signal and receive a clone of the leader's outcome.
//! - **Result cache**: a completed outcome is kept until its TTL expires, so a
//!   retry after completion returns the recorded outcome without re-executing.
//!
//! Dropping an uncompleted [`ReservationGuard`] cancels the reservation and
//! wakes waiters so one of them may re-reserve; a crashed leader never
//! strands its followers.
//!
//! The cache is bounded. At capacity, new keys are **not** rejected: the
//! caller is told to proceed without deduplication ([`Acquire::Bypass`]).
//! Refusing service over a full dedup table would be worse than the rare
//! duplicate charge it prevents.
//!
//! # Example
//!
//! ```
//! use paygate_idempotency::{Acquire, IdempotencyCache, IdempotencyConfig};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let cache: IdempotencyCache<String> = IdempotencyCache::new(IdempotencyConfig::default());
//!
//! match cache.get_or_reserve("gws_abc", "key-1").await {
//!     Acquire::Reserved(guard) => guard.complete("result".to_string()),
//!     Acquire::Found(_) | Acquire::Bypass => unreachable!(),
//! }
//!
//! match cache.get_or_reserve("gws_abc", "key-1").await {
//!     Acquire::Found(v) => assert_eq!(v, "result"),
//!     _ => unreachable!(),
//! }
//! # }
//! ```

mod config;

pub use config::IdempotencyConfig;

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;

type Key = (String, String);

enum Entry<V> {
    /// A leader is executing; waiters subscribe to the sender.
    InFlight(broadcast::Sender<V>),
    /// The outcome is recorded until `expires_at`.
    Done { value: V, expires_at: Instant },
}

struct Inner<V> {
    config: IdempotencyConfig,
    entries: Mutex<HashMap<Key, Entry<V>>>,
}

/// Outcome of [`IdempotencyCache::get_or_reserve`].
pub enum Acquire<V: Clone + Send + 'static> {
    /// A completed outcome for this key was found (possibly after waiting for
    /// an in-flight leader).
    Found(V),
    /// The caller is the leader for this key and must complete or cancel the
    /// reservation.
    Reserved(ReservationGuard<V>),
    /// The cache is at capacity; proceed without deduplication.
    Bypass,
}

/// Bounded singleflight + TTL result cache keyed by (session id, client key).
pub struct IdempotencyCache<V: Clone + Send + 'static> {
    inner: Arc<Inner<V>>,
}

impl<V: Clone + Send + 'static> Clone for IdempotencyCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Internal decision taken under the map lock.
enum Step<V: Clone + Send + 'static> {
    Found(V),
    Wait(broadcast::Receiver<V>),
    Reserved(ReservationGuard<V>),
    Bypass,
}

/// First look at an entry, fully owned so the map can be mutated afterwards.
enum Peek<V> {
    Hit(V),
    Expired,
    Wait(broadcast::Receiver<V>),
    Vacant,
}

impl<V: Clone + Send + 'static> IdempotencyCache<V> {
    /// Creates a cache with the given configuration.
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Looks up `(session_id, key)`, reserving it when absent.
    ///
    /// If another caller holds the reservation, this waits for its completion
    /// signal. A cancelled leader wakes its waiters and one of them
    /// re-reserves; callers therefore see either a recorded outcome, their own
    /// reservation, or a capacity bypass, never an error.
    pub async fn get_or_reserve(&self, session_id: &str, key: &str) -> Acquire<V> {
        let map_key = (session_id.to_string(), key.to_string());

        loop {
            let step = {
                let mut entries = self.inner.entries.lock();
                let peek = match entries.get(&map_key) {
                    Some(Entry::Done { value, expires_at }) => {
                        if Instant::now() < *expires_at {
                            Peek::Hit(value.clone())
                        } else {
                            Peek::Expired
                        }
                    }
                    Some(Entry::InFlight(sender)) => Peek::Wait(sender.subscribe()),
                    None => Peek::Vacant,
                };
                match peek {
                    Peek::Hit(value) => {
                        #[cfg(feature = "metrics")]
                        metrics::counter!("paygate_idempotency_hits_total").increment(1);
                        Step::Found(value)
                    }
                    Peek::Wait(receiver) => {
                        #[cfg(feature = "metrics")]
                        metrics::counter!("paygate_idempotency_waits_total").increment(1);
                        Step::Wait(receiver)
                    }
                    Peek::Expired => {
                        entries.remove(&map_key);
                        self.reserve_locked(&mut entries, &map_key)
                    }
                    Peek::Vacant => self.reserve_locked(&mut entries, &map_key),
                }
            };

            match step {
                Step::Found(value) => return Acquire::Found(value),
                Step::Reserved(guard) => return Acquire::Reserved(guard),
                Step::Bypass => return Acquire::Bypass,
                Step::Wait(mut receiver) => match receiver.recv().await {
                    Ok(value) => return Acquire::Found(value),
                    // Leader cancelled without a result; race to re-reserve.
                    Err(_) => continue,
                },
            }
        }
    }

    fn reserve_locked(&self, entries: &mut HashMap<Key, Entry<V>>, map_key: &Key) -> Step<V> {
        if entries.len() >= self.inner.config.capacity {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                capacity = self.inner.config.capacity,
                "idempotency cache full; proceeding without dedup"
            );
            #[cfg(feature = "metrics")]
            metrics::counter!("paygate_idempotency_bypasses_total").increment(1);
            return Step::Bypass;
        }

        let (sender, _receiver) = broadcast::channel(1);
        entries.insert(map_key.clone(), Entry::InFlight(sender));
        Step::Reserved(ReservationGuard {
            inner: Arc::clone(&self.inner),
            key: Some(map_key.clone()),
        })
    }

    /// Removes completed entries whose TTL has expired. Returns how many were
    /// reclaimed. In-flight reservations are never swept.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| match entry {
            Entry::InFlight(_) => true,
            Entry::Done { expires_at, .. } => now < *expires_at,
        });
        before - entries.len()
    }

    /// Number of entries (in-flight and completed) currently held.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}

/// Leader-side handle for an in-flight reservation.
///
/// The holder must call [`complete`](ReservationGuard::complete) with the
/// outcome, or [`cancel`](ReservationGuard::cancel) (also triggered by drop)
/// to release waiters without recording anything.
pub struct ReservationGuard<V: Clone + Send + 'static> {
    inner: Arc<Inner<V>>,
    key: Option<Key>,
}

impl<V: Clone + Send + 'static> ReservationGuard<V> {
    /// Records the outcome, wakes all waiters, and starts the TTL clock.
    pub fn complete(mut self, value: V) {
        if let Some(key) = self.key.take() {
            let mut entries = self.inner.entries.lock();
            if let Some(Entry::InFlight(sender)) = entries.remove(&key) {
                // Waiters subscribed under the lock, so every waiter either
                // receives this send or observes the Done entry.
                let _ = sender.send(value.clone());
            }
            entries.insert(
                key,
                Entry::Done {
                    value,
                    expires_at: Instant::now() + self.inner.config.ttl,
                },
            );
        }
    }

    /// Discards the reservation and wakes waiters so one may re-reserve.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(key) = self.key.take() {
            let mut entries = self.inner.entries.lock();
            // Dropping the sender closes the channel; waiters see RecvError
            // and retry.
            entries.remove(&key);
        }
    }
}

impl<V: Clone + Send + 'static> Drop for ReservationGuard<V> {
    fn drop(&mut self) {
        self.release();
    }
}
