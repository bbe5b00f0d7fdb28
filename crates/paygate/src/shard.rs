//! Sharded per-session locking.
//!
//! Session state and the pending-spend map are only mutated while holding the
//! session's shard. Guards are owned (`OwnedMutexGuard`) so retry loops can
//! drop the lock across a backoff sleep and reacquire afterwards; other
//! sessions hashing to the same shard are never head-of-line blocked by a
//! sleeping retry.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SHARD_COUNT: usize = 256;

/// Guard for one session's shard.
pub type SessionGuard = OwnedMutexGuard<()>;

/// Fixed pool of 256 mutexes keyed by FNV-1a of the session id.
pub struct SessionLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    /// Acquires the shard for `session_id`.
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let shard = Arc::clone(&self.shards[shard_index(session_id)]);
        shard.lock_owned().await
    }
}

impl Default for SessionLocks {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_index(session_id: &str) -> usize {
    (fnv1a(session_id.as_bytes()) % SHARD_COUNT as u64) as usize
}

/// 64-bit FNV-1a.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fnv1a_known_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn same_session_same_shard() {
        assert_eq!(shard_index("gws_abc"), shard_index("gws_abc"));
        assert!(shard_index("gws_abc") < SHARD_COUNT);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_shard() {
        let locks = SessionLocks::new();
        let guard = locks.acquire("gws_abc").await;

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire("gws_abc"),
        )
        .await;
        assert!(second.is_err(), "same session must block");

        drop(guard);
        let third = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire("gws_abc"),
        )
        .await;
        assert!(third.is_ok(), "released shard must be reacquirable");
    }

    #[tokio::test]
    async fn different_shards_do_not_contend() {
        let locks = SessionLocks::new();

        // Find two ids on different shards.
        let a = "gws_a".to_string();
        let mut b = None;
        for i in 0..1000 {
            let candidate = format!("gws_b{i}");
            if shard_index(&candidate) != shard_index(&a) {
                b = Some(candidate);
                break;
            }
        }
        let b = b.expect("a differing shard exists");

        let _guard = locks.acquire(&a).await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&b)).await;
        assert!(other.is_ok(), "distinct shards must not block each other");
    }
}
