//! Subscriber records and the expiry-ordered subscriber manager.
//!
//! A subscriber is a (key, heartbeat, timeout, private data) tuple shared
//! behind an `Arc`. The manager indexes subscribers by key and keeps a
//! deadline-ordered expiry index so `first_expired` surfaces timed-out
//! subscribers in non-decreasing deadline order. Rescheduling invalidates the
//! old index entry by token rather than erasing it eagerly; stale entries are
//! skipped and dropped lazily.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use wal_core::{WalDuration, WalTimePoint};

/// Expiry index entry identifier: deadline plus a tie-breaking sequence
type TimerToken = (WalTimePoint, u64);

struct HeartbeatState {
    last_heartbeat: WalTimePoint,
    timeout: WalDuration,
    timer_token: Option<TimerToken>,
}

/// One subscriber of a replication group
pub struct Subscriber<K, U> {
    key: K,
    state: Mutex<HeartbeatState>,
    private_data: RwLock<U>,
}

/// Shared subscriber handle
pub type SubscriberPtr<K, U> = Arc<Subscriber<K, U>>;

impl<K, U> Subscriber<K, U> {
    fn new(key: K, now: WalTimePoint, timeout: WalDuration, private_data: U) -> Self {
        Self {
            key,
            state: Mutex::new(HeartbeatState {
                last_heartbeat: now,
                timeout,
                timer_token: None,
            }),
            private_data: RwLock::new(private_data),
        }
    }

    /// The subscriber key
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Timepoint of the last observed heartbeat
    pub fn last_heartbeat(&self) -> WalTimePoint {
        self.state.lock().last_heartbeat
    }

    /// Record a heartbeat
    pub fn update_heartbeat(&self, now: WalTimePoint) {
        self.state.lock().last_heartbeat = now;
    }

    /// The tolerated heartbeat gap
    pub fn heartbeat_timeout(&self) -> WalDuration {
        self.state.lock().timeout
    }

    /// Change the tolerated heartbeat gap; takes effect at the next reschedule
    pub fn set_heartbeat_timeout(&self, timeout: WalDuration) {
        self.state.lock().timeout = timeout;
    }

    /// A subscriber is offline once its heartbeat deadline has passed
    pub fn is_offline(&self, now: WalTimePoint) -> bool {
        let state = self.state.lock();
        state.last_heartbeat + state.timeout <= now
    }

    /// Subscriber-private data
    pub fn private_data(&self) -> RwLockReadGuard<'_, U> {
        self.private_data.read()
    }

    /// Subscriber-private data, mutable
    pub fn private_data_mut(&self) -> RwLockWriteGuard<'_, U> {
        self.private_data.write()
    }
}

/// Key-indexed subscriber collection with a deadline-ordered expiry index
pub struct SubscriberManager<K, U> {
    subscribers: HashMap<K, SubscriberPtr<K, U>>,
    expiry: BTreeMap<TimerToken, Weak<Subscriber<K, U>>>,
    timer_seq: u64,
}

impl<K: Eq + Hash + Clone, U> Default for SubscriberManager<K, U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, U> SubscriberManager<K, U> {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            expiry: BTreeMap::new(),
            timer_seq: 0,
        }
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether no subscriber is registered
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Look up a subscriber by key
    pub fn find(&self, key: &K) -> Option<SubscriberPtr<K, U>> {
        self.subscribers.get(key).cloned()
    }

    /// All live subscribers, in no particular order
    pub fn all(&self) -> Vec<SubscriberPtr<K, U>> {
        self.subscribers.values().cloned().collect()
    }

    /// Create a subscriber, or refresh the existing one under the same key.
    ///
    /// Refreshing updates the heartbeat and timeout but keeps the current
    /// expiry slot; callers wanting a full renewal use
    /// [`SubscriberManager::subscribe`].
    pub fn create(
        &mut self,
        key: K,
        now: WalTimePoint,
        timeout: WalDuration,
        private_data: U,
    ) -> SubscriberPtr<K, U> {
        if let Some(existing) = self.subscribers.get(&key) {
            existing.update_heartbeat(now);
            existing.set_heartbeat_timeout(timeout);
            return Arc::clone(existing);
        }

        let subscriber = Arc::new(Subscriber::new(key.clone(), now, timeout, private_data));
        self.subscribers.insert(key, Arc::clone(&subscriber));
        self.schedule(&subscriber, now);
        subscriber
    }

    /// Record a heartbeat and reschedule the expiry slot
    pub fn subscribe(&mut self, subscriber: &SubscriberPtr<K, U>, now: WalTimePoint) {
        if !self.owns(subscriber) {
            return;
        }
        subscriber.update_heartbeat(now);
        self.schedule(subscriber, now);
    }

    /// Reschedule the expiry slot without touching the heartbeat
    pub fn reset_timer(&mut self, subscriber: &SubscriberPtr<K, U>, now: WalTimePoint) {
        if !self.owns(subscriber) {
            return;
        }
        self.schedule(subscriber, now);
    }

    /// Remove a subscriber by key
    pub fn unsubscribe_key(&mut self, key: &K) -> Option<SubscriberPtr<K, U>> {
        let subscriber = self.subscribers.remove(key)?;
        self.clear_timer(&subscriber);
        Some(subscriber)
    }

    /// Remove a subscriber by handle; a stale handle that no longer matches
    /// the registered entry is left alone
    pub fn unsubscribe(&mut self, subscriber: &SubscriberPtr<K, U>) -> Option<SubscriberPtr<K, U>> {
        if !self.owns(subscriber) {
            return None;
        }
        let removed = self.subscribers.remove(subscriber.key())?;
        self.clear_timer(&removed);
        Some(removed)
    }

    /// The subscriber with the earliest elapsed deadline, if any.
    ///
    /// Deadlines exactly at `now` are not yet expired. Stale and dangling
    /// index entries encountered on the way are discarded.
    pub fn first_expired(&mut self, now: WalTimePoint) -> Option<SubscriberPtr<K, U>> {
        loop {
            let (token, upgraded) = match self.expiry.first_key_value() {
                None => return None,
                Some((token, weak)) => (*token, weak.upgrade()),
            };
            if token.0 >= now {
                return None;
            }
            match upgraded {
                None => {
                    self.expiry.remove(&token);
                }
                Some(subscriber) => {
                    if subscriber.state.lock().timer_token != Some(token) {
                        self.expiry.remove(&token);
                    } else {
                        return Some(subscriber);
                    }
                }
            }
        }
    }

    fn owns(&self, subscriber: &SubscriberPtr<K, U>) -> bool {
        self.subscribers
            .get(subscriber.key())
            .map_or(false, |registered| Arc::ptr_eq(registered, subscriber))
    }

    fn schedule(&mut self, subscriber: &SubscriberPtr<K, U>, now: WalTimePoint) {
        let mut state = subscriber.state.lock();
        if let Some(previous) = state.timer_token.take() {
            self.expiry.remove(&previous);
        }
        self.timer_seq += 1;
        let token = (now + state.timeout, self.timer_seq);
        state.timer_token = Some(token);
        self.expiry.insert(token, Arc::downgrade(subscriber));
    }

    fn clear_timer(&mut self, subscriber: &SubscriberPtr<K, U>) {
        if let Some(token) = subscriber.state.lock().timer_token.take() {
            self.expiry.remove(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(seconds: i64) -> WalTimePoint {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn secs(seconds: u64) -> WalDuration {
        WalDuration::from_secs(seconds)
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        let first = manager.create(1, at(0), secs(5), ());
        let again = manager.create(1, at(3), secs(9), ());

        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(manager.len(), 1);
        assert_eq!(again.last_heartbeat(), at(3));
        assert_eq!(again.heartbeat_timeout(), secs(9));
    }

    #[test]
    fn test_offline_is_deadline_inclusive() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        let subscriber = manager.create(1, at(0), secs(5), ());

        assert!(!subscriber.is_offline(at(4)));
        assert!(subscriber.is_offline(at(5)));
        assert!(subscriber.is_offline(at(6)));
    }

    #[test]
    fn test_expiry_in_deadline_order() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        manager.create(1, at(0), secs(5), ());
        manager.create(2, at(3), secs(5), ());
        manager.create(3, at(6), secs(5), ());

        // Deadlines: 5, 8, 11. Two have elapsed strictly before t=11.
        let first = manager.first_expired(at(11)).unwrap();
        assert_eq!(*first.key(), 1);
        manager.unsubscribe(&first);

        let second = manager.first_expired(at(11)).unwrap();
        assert_eq!(*second.key(), 2);
        manager.unsubscribe(&second);

        assert!(manager.first_expired(at(11)).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reschedule_invalidates_old_slot() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        let subscriber = manager.create(1, at(0), secs(5), ());

        // Heartbeat at t=4 pushes the deadline to t=9.
        manager.subscribe(&subscriber, at(4));
        assert!(manager.first_expired(at(6)).is_none());
        assert_eq!(*manager.first_expired(at(10)).unwrap().key(), 1);
    }

    #[test]
    fn test_unsubscribe_stale_handle_is_ignored() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        let original = manager.create(1, at(0), secs(5), ());
        manager.unsubscribe_key(&1);
        let replacement = manager.create(1, at(1), secs(5), ());

        assert!(manager.unsubscribe(&original).is_none());
        assert_eq!(manager.len(), 1);
        assert!(Arc::ptr_eq(&manager.find(&1).unwrap(), &replacement));
    }

    #[test]
    fn test_expired_entry_for_removed_subscriber_is_skipped() {
        let mut manager: SubscriberManager<u64, ()> = SubscriberManager::new();
        manager.create(1, at(0), secs(5), ());
        manager.create(2, at(0), secs(7), ());
        manager.unsubscribe_key(&1);

        let expired = manager.first_expired(at(100)).unwrap();
        assert_eq!(*expired.key(), 2);
    }
}
