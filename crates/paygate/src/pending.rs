//! In-memory pending-spend accounting.
//!
//! Maps session id to the sum reserved by in-flight proxy calls that have not
//! yet settled or failed. Entries are created in the reserve phase, folded
//! into `total_spent` on settlement, and released on failure. All mutation
//! happens while holding the session's shard lock; the internal mutex only
//! guards the map structure itself.

use hashbrown::HashMap;
use parking_lot::Mutex;
use paygate_core::Amount;

#[derive(Default)]
pub struct PendingSpend {
    map: Mutex<HashMap<String, Amount>>,
}

impl PendingSpend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight sum for a session.
    pub fn get(&self, session_id: &str) -> Amount {
        self.map
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    /// Adds a reservation.
    pub fn reserve(&self, session_id: &str, amount: Amount) {
        let mut map = self.map.lock();
        let entry = map.entry_ref(session_id).or_insert(Amount::ZERO);
        *entry = entry.checked_add(amount).unwrap_or(*entry);
    }

    /// Adds a reservation wrapped in a guard. The guard releases on drop, so
    /// a proxy future cancelled mid-flight cannot leak budget; completed
    /// paths call [`Reservation::finish`] explicitly while holding the
    /// session's shard lock.
    pub fn reserve_guarded<'a>(&'a self, session_id: &'a str, amount: Amount) -> Reservation<'a> {
        self.reserve(session_id, amount);
        Reservation {
            pending: self,
            session_id,
            amount,
            armed: true,
        }
    }

    /// Removes a reservation; the entry disappears when nothing remains
    /// in flight.
    pub fn release(&self, session_id: &str, amount: Amount) {
        let mut map = self.map.lock();
        if let Some(entry) = map.get_mut(session_id) {
            *entry = entry.saturating_sub(amount);
            if entry.is_zero() {
                map.remove(session_id);
            }
        }
    }

    /// Drops the session's entry entirely (session close).
    pub fn clear(&self, session_id: &str) {
        self.map.lock().remove(session_id);
    }

    /// Number of sessions with in-flight reservations. Test helper.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Returns true when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

/// Live reservation for one in-flight proxy attempt.
pub struct Reservation<'a> {
    pending: &'a PendingSpend,
    session_id: &'a str,
    amount: Amount,
    armed: bool,
}

impl Reservation<'_> {
    /// Removes the reservation (settled into `total_spent` or abandoned).
    pub fn finish(mut self) {
        self.armed = false;
        self.pending.release(self.session_id, self.amount);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.release(self.session_id, self.amount);
        }
    }
}
