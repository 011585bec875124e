use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::common::clock::SharedClock;
use crate::common::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimisticStatus {
    Pending,
    Confirmed,
    RolledBack,
}

/// A locally applied change awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimisticUpdate<T> {
    pub key: String,
    /// State before the first update in the current sequence.
    pub prior: T,
    /// Latest tentatively applied state.
    pub next: T,
    pub status: OptimisticStatus,
    pub created_at: u64,
    pub updated_at: u64,
    /// Number of updates folded into this entry since it was created.
    pub revisions: u32,
}

/// Tracks optimistic updates by caller-chosen key.
///
/// At most one update is pending per key. Creating another update for a
/// pending key replaces `next` but keeps the original `prior`, so a rollback
/// restores the value from before the whole sequence.
pub struct OptimisticUpdateManager<T> {
    entries: Mutex<HashMap<String, OptimisticUpdate<T>>>,
    clock: SharedClock,
}

impl<T: Clone> OptimisticUpdateManager<T> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Register `next` as the optimistic state for `key` and hand it back for
    /// rendering.
    pub fn create_optimistic_update<K: Into<String>>(&self, key: K, prior: T, next: T) -> T {
        let key = key.into();
        let now = self.clock.now_ms();
        let mut entries = lock(&self.entries);

        match entries.get_mut(&key) {
            Some(existing) => {
                existing.next = next.clone();
                existing.updated_at = now;
                existing.revisions += 1;
            }
            None => {
                entries.insert(
                    key.clone(),
                    OptimisticUpdate {
                        key,
                        prior,
                        next: next.clone(),
                        status: OptimisticStatus::Pending,
                        created_at: now,
                        updated_at: now,
                        revisions: 1,
                    },
                );
            }
        }
        next
    }

    /// Mark the update confirmed and stop tracking it.
    pub fn confirm_optimistic_update(&self, key: &str) -> Option<OptimisticUpdate<T>> {
        let mut update = lock(&self.entries).remove(key)?;
        update.status = OptimisticStatus::Confirmed;
        update.updated_at = self.clock.now_ms();
        Some(update)
    }

    /// Stop tracking the update and return the state to restore.
    pub fn rollback_optimistic_update(&self, key: &str) -> Option<T> {
        self.rollback_entry(key).map(|update| update.prior)
    }

    /// Mark the update rolled back and stop tracking it. The returned entry
    /// carries both `prior` and the discarded `next`.
    pub fn rollback_entry(&self, key: &str) -> Option<OptimisticUpdate<T>> {
        let mut update = lock(&self.entries).remove(key)?;
        update.status = OptimisticStatus::RolledBack;
        update.updated_at = self.clock.now_ms();
        log::debug!(
            "Rolled back optimistic update '{}' after {} revisions",
            key,
            update.revisions
        );
        Some(update)
    }

    pub fn get(&self, key: &str) -> Option<OptimisticUpdate<T>> {
        lock(&self.entries).get(key).cloned()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Drop all tracked updates without restoring anything.
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use std::sync::Arc;

    fn manager() -> (Arc<ManualClock>, OptimisticUpdateManager<&'static str>) {
        let clock = Arc::new(ManualClock::new(100));
        (clock.clone(), OptimisticUpdateManager::new(clock))
    }

    #[test]
    fn create_returns_next_state() {
        let (_clock, m) = manager();
        assert_eq!(m.create_optimistic_update("k", "S0", "S1"), "S1");
        let u = m.get("k").unwrap();
        assert_eq!(u.status, OptimisticStatus::Pending);
        assert_eq!(u.prior, "S0");
        assert_eq!(u.next, "S1");
    }

    #[test]
    fn rollback_restores_state_before_the_whole_sequence() {
        let (_clock, m) = manager();
        m.create_optimistic_update("k", "S0", "S1");
        m.create_optimistic_update("k", "S1", "S2");

        let u = m.get("k").unwrap();
        assert_eq!(u.next, "S2");
        assert_eq!(u.revisions, 2);

        assert_eq!(m.rollback_optimistic_update("k"), Some("S0"));
        assert!(m.get("k").is_none());
    }

    #[test]
    fn confirm_evicts_and_reports_final_state() {
        let (clock, m) = manager();
        m.create_optimistic_update("k", "S0", "S1");
        clock.advance(50);

        let confirmed = m.confirm_optimistic_update("k").unwrap();
        assert_eq!(confirmed.status, OptimisticStatus::Confirmed);
        assert_eq!(confirmed.next, "S1");
        assert_eq!(confirmed.updated_at, 150);
        assert_eq!(m.pending_len(), 0);

        // A fresh sequence after confirmation starts from the new prior.
        m.create_optimistic_update("k", "S1", "S2");
        assert_eq!(m.rollback_optimistic_update("k"), Some("S1"));
    }

    #[test]
    fn rolled_back_entry_reports_its_status() {
        let (clock, m) = manager();
        m.create_optimistic_update("k", "S0", "S1");
        clock.advance(25);

        let rolled = m.rollback_entry("k").unwrap();
        assert_eq!(rolled.status, OptimisticStatus::RolledBack);
        assert_eq!(rolled.prior, "S0");
        assert_eq!(rolled.next, "S1");
        assert_eq!(rolled.updated_at, 125);
        assert!(!m.is_pending("k"));
        assert!(m.rollback_entry("k").is_none());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let (_clock, m) = manager();
        assert!(m.confirm_optimistic_update("nope").is_none());
        assert!(m.rollback_optimistic_update("nope").is_none());
    }

    #[test]
    fn keys_are_independent() {
        let (_clock, m) = manager();
        m.create_optimistic_update("a", "A0", "A1");
        m.create_optimistic_update("b", "B0", "B1");
        assert_eq!(m.rollback_optimistic_update("a"), Some("A0"));
        assert!(m.is_pending("b"));
        m.clear();
        assert_eq!(m.pending_len(), 0);
    }
}
