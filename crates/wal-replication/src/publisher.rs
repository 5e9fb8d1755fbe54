//! The WAL publisher: subscriber-aware broadcast of a log.
//!
//! The publisher layers on a [`WalObject`] (its own, or one shared with a
//! [`crate::WalClient`]) and owns the subscriber set. `broadcast` ships the
//! tail above the broadcast key bound to every subscriber; records inserted
//! *below* an already-broadcast bound are captured as hole logs by a hook on
//! the object and shipped on the next round. A subscribe request is answered
//! with either the incremental tail from the subscriber's checkpoint or a
//! full snapshot - the snapshot wins whenever the checkpoint predates the
//! compacted history, the checkpoint hash diverges from the stored chain, or
//! the application forces it.

use crate::subscriber::{SubscriberManager, SubscriberPtr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};
use wal_core::{
    AppendOutcome, LogCallbacks, LogOperator, LogPtr, SharedWalObject, UnsubscribeReason,
    WalConfig, WalDuration, WalError, WalObject, WalResult, WalTimePoint,
};

/// Default heartbeat tolerance granted to a subscriber (10 minutes)
pub const DEFAULT_SUBSCRIBER_TIMEOUT: WalDuration = WalDuration::from_secs(10 * 60);

/// How often a failed gc-pool broadcast is retried within one round
const LAST_BROADCAST_RETRIES: usize = 3;

/// A subscriber's claim of the latest record it has installed, optionally
/// with that record's chained hash for divergence detection
#[derive(Debug, Clone)]
pub struct Checkpoint<O: LogOperator> {
    /// Greatest key the subscriber claims to have installed
    pub key: O::Key,

    /// The chained hash the subscriber stored for that record
    pub hash: Option<O::HashCode>,
}

impl<O: LogOperator> Checkpoint<O> {
    /// A bare checkpoint without hash verification
    pub fn at(key: O::Key) -> Self {
        Self { key, hash: None }
    }

    /// A checkpoint whose stored hash the publisher should verify
    pub fn verified(key: O::Key, hash: O::HashCode) -> Self {
        Self {
            key,
            hash: Some(hash),
        }
    }
}

/// Configuration of a [`WalPublisher`]; embeds the wrapped object's tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Tuning of the underlying WAL object
    pub wal: WalConfig,

    /// Heartbeat tolerance granted to every subscriber
    pub subscriber_timeout: WalDuration,

    /// Hold removed subscribers in a gc pool for one more broadcast so the
    /// final records still reach them
    pub enable_last_broadcast_for_removed_subscriber: bool,

    /// Capture records inserted below the broadcast bound and ship them on
    /// the next round; when off, such records are silently skipped
    pub enable_hole_log: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            subscriber_timeout: DEFAULT_SUBSCRIBER_TIMEOUT,
            enable_last_broadcast_for_removed_subscriber: false,
            enable_hole_log: false,
        }
    }
}

impl PublisherConfig {
    /// Set the heartbeat tolerance
    pub fn with_subscriber_timeout(mut self, timeout: WalDuration) -> Self {
        self.subscriber_timeout = timeout;
        self
    }

    /// Keep removed subscribers around for one final broadcast
    pub fn with_last_broadcast_for_removed_subscriber(mut self, enable: bool) -> Self {
        self.enable_last_broadcast_for_removed_subscriber = enable;
        self
    }

    /// Capture and rebroadcast hole logs
    pub fn with_hole_log(mut self, enable: bool) -> Self {
        self.enable_hole_log = enable;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> WalResult<()> {
        self.wal.validate()
    }
}

/// Transmit a full snapshot to the given subscribers
pub type SendSnapshotFn<O, S, P, D, K, U> = Box<
    dyn Fn(&mut WalPublisher<O, S, P, D, K, U>, &[SubscriberPtr<K, U>], &P) -> WalResult<()>
        + Send
        + Sync,
>;

/// Transmit a batch of records to the given subscribers
pub type SendLogsFn<O, S, P, D, K, U> = Box<
    dyn Fn(
            &mut WalPublisher<O, S, P, D, K, U>,
            &[LogPtr<O>],
            &[SubscriberPtr<K, U>],
            &P,
        ) -> WalResult<()>
        + Send
        + Sync,
>;

/// Deliver the reply to a subscribe request
pub type SubscribeResponseFn<O, S, P, D, K, U> = Box<
    dyn Fn(
            &mut WalPublisher<O, S, P, D, K, U>,
            &SubscriberPtr<K, U>,
            WalResult<()>,
            &P,
        ) -> WalResult<()>
        + Send
        + Sync,
>;

/// Application-level liveness check, run on every subscriber lookup; `false`
/// removes the subscriber with reason [`UnsubscribeReason::Invalid`]
pub type CheckSubscriberFn<O, S, P, D, K, U> = Box<
    dyn Fn(&mut WalPublisher<O, S, P, D, K, U>, &SubscriberPtr<K, U>, &P) -> bool + Send + Sync,
>;

/// Application-level override demanding a snapshot for a subscribe request
pub type ForceSyncSnapshotFn<O, S, P, D, K, U> = Box<
    dyn Fn(
            &mut WalPublisher<O, S, P, D, K, U>,
            &SubscriberPtr<K, U>,
            &<O as LogOperator>::Key,
            Option<&<O as LogOperator>::HashCode>,
            &P,
        ) -> bool
        + Send
        + Sync,
>;

/// Observer hook on subscriber lifecycle events
pub type SubscriberEventFn<O, S, P, D, K, U> = Box<
    dyn Fn(&mut WalPublisher<O, S, P, D, K, U>, &SubscriberPtr<K, U>, &P) + Send + Sync,
>;

/// Observer hook fired when a subscriber is removed
pub type SubscriberRemovedFn<O, S, P, D, K, U> = Box<
    dyn Fn(&mut WalPublisher<O, S, P, D, K, U>, &SubscriberPtr<K, U>, UnsubscribeReason, &P)
        + Send
        + Sync,
>;

/// The publisher-specific callback table, embedding the object's table.
///
/// `send_snapshot` and `send_logs` are required; the rest is optional.
pub struct PublisherCallbacks<O: LogOperator, S, P, D, K, U> {
    /// The wrapped object's callback table, shared with the object itself
    pub log: Arc<LogCallbacks<O, S, P, D>>,

    /// Transmit a snapshot (required)
    pub send_snapshot: Option<SendSnapshotFn<O, S, P, D, K, U>>,

    /// Transmit records (required)
    pub send_logs: Option<SendLogsFn<O, S, P, D, K, U>>,

    /// Deliver subscribe replies
    pub subscribe_response: Option<SubscribeResponseFn<O, S, P, D, K, U>>,

    /// Liveness veto
    pub check_subscriber: Option<CheckSubscriberFn<O, S, P, D, K, U>>,

    /// Snapshot override
    pub subscriber_force_sync_snapshot: Option<ForceSyncSnapshotFn<O, S, P, D, K, U>>,

    /// Fired on every accepted subscribe request
    pub on_subscriber_request: Option<SubscriberEventFn<O, S, P, D, K, U>>,

    /// Fired when a subscriber joins
    pub on_subscriber_added: Option<SubscriberEventFn<O, S, P, D, K, U>>,

    /// Fired when a subscriber leaves, with the reason
    pub on_subscriber_removed: Option<SubscriberRemovedFn<O, S, P, D, K, U>>,
}

impl<O: LogOperator, S, P, D, K, U> PublisherCallbacks<O, S, P, D, K, U> {
    /// Build a table around an object callback table; publisher-specific
    /// callbacks start unset
    pub fn new(log: Arc<LogCallbacks<O, S, P, D>>) -> Self {
        Self {
            log,
            send_snapshot: None,
            send_logs: None,
            subscribe_response: None,
            check_subscriber: None,
            subscriber_force_sync_snapshot: None,
            on_subscriber_request: None,
            on_subscriber_added: None,
            on_subscriber_removed: None,
        }
    }
}

struct BroadcastState<O: LogOperator> {
    // Greatest key already broadcast; the next round ships everything above it
    key_bound: Option<O::Key>,
    // Records inserted below the bound since the last round
    hole_logs: Vec<LogPtr<O>>,
}

/// The publisher side of a replication group
pub struct WalPublisher<O: LogOperator, S, P, D, K, U> {
    callbacks: Arc<PublisherCallbacks<O, S, P, D, K, U>>,
    config: Arc<PublisherConfig>,
    object: SharedWalObject<O, S, P, D>,
    manager: SubscriberManager<K, U>,
    // Removed subscribers awaiting their final broadcast
    gc_pool: HashMap<K, SubscriberPtr<K, U>>,
    broadcast_state: Arc<Mutex<BroadcastState<O>>>,
}

impl<O, S, P, D, K, U> WalPublisher<O, S, P, D, K, U>
where
    O: LogOperator,
    K: Eq + Hash + Clone + Debug,
{
    /// Create a publisher owning a fresh [`WalObject`].
    pub fn new(
        callbacks: PublisherCallbacks<O, S, P, D, K, U>,
        config: PublisherConfig,
        private_data: D,
    ) -> WalResult<Self> {
        Self::validate(&callbacks)?;
        config.validate()?;
        let object = WalObject::new(
            Arc::clone(&callbacks.log),
            Arc::new(config.wal.clone()),
            private_data,
        )?
        .into_shared();
        Self::build(object, callbacks, config)
    }

    /// Layer a publisher on an existing shared object, e.g. one driven by a
    /// [`crate::WalClient`] in a relay process.
    ///
    /// The object-level callback table and configuration are inherited from
    /// the shared object so the two layers cannot disagree; only the
    /// publisher-specific callbacks of `callbacks` are kept.
    pub fn with_shared_object(
        object: SharedWalObject<O, S, P, D>,
        mut callbacks: PublisherCallbacks<O, S, P, D, K, U>,
        mut config: PublisherConfig,
    ) -> WalResult<Self> {
        {
            let object = object.lock();
            callbacks.log = Arc::clone(object.callbacks());
            config.wal = object.config().as_ref().clone();
        }
        Self::validate(&callbacks)?;
        config.validate()?;
        Self::build(object, callbacks, config)
    }

    fn validate(callbacks: &PublisherCallbacks<O, S, P, D, K, U>) -> WalResult<()> {
        if callbacks.log.allocate_log_key.is_none() {
            return Err(WalError::initialization(
                "publisher requires the allocate_log_key callback",
            ));
        }
        if callbacks.send_snapshot.is_none() {
            return Err(WalError::initialization(
                "publisher requires the send_snapshot callback",
            ));
        }
        if callbacks.send_logs.is_none() {
            return Err(WalError::initialization(
                "publisher requires the send_logs callback",
            ));
        }
        Ok(())
    }

    fn build(
        object: SharedWalObject<O, S, P, D>,
        callbacks: PublisherCallbacks<O, S, P, D, K, U>,
        config: PublisherConfig,
    ) -> WalResult<Self> {
        let config = Arc::new(config);
        let broadcast_state = Arc::new(Mutex::new(BroadcastState {
            key_bound: None,
            hole_logs: Vec::new(),
        }));

        {
            let mut guard = object.lock();

            // A bulk assignment replaces history wholesale: everything in it
            // counts as broadcast and any parked holes are obsolete.
            let state = Arc::clone(&broadcast_state);
            guard.add_assign_hook(move |wal| {
                let mut state = state.lock();
                if let Some(key) = wal.last_key() {
                    state.key_bound = Some(key);
                }
                state.hole_logs.clear();
            });

            let state = Arc::clone(&broadcast_state);
            let hook_config = Arc::clone(&config);
            guard.add_log_added_hook(move |wal, log| {
                if !hook_config.enable_hole_log {
                    return;
                }
                let mut state = state.lock();
                if let Some(bound) = &state.key_bound {
                    if wal.key_of(log) < *bound {
                        state.hole_logs.push(Arc::clone(log));
                    }
                }
            });
        }

        Ok(Self {
            callbacks: Arc::new(callbacks),
            config,
            object,
            manager: SubscriberManager::new(),
            gc_pool: HashMap::new(),
            broadcast_state,
        })
    }

    /// The publisher configuration
    pub fn config(&self) -> &Arc<PublisherConfig> {
        &self.config
    }

    /// Handle to the wrapped object, for sharing with a client
    pub fn object(&self) -> SharedWalObject<O, S, P, D> {
        Arc::clone(&self.object)
    }

    /// Run a closure against the wrapped object
    pub fn with_object<R>(&self, f: impl FnOnce(&mut WalObject<O, S, P, D>) -> R) -> R {
        f(&mut self.object.lock())
    }

    /// The subscriber manager
    pub fn subscriber_manager(&self) -> &SubscriberManager<K, U> {
        &self.manager
    }

    /// All live subscribers
    pub fn subscribers(&self) -> Vec<SubscriberPtr<K, U>> {
        self.manager.all()
    }

    /// Removed subscribers still awaiting their final broadcast
    pub fn gc_pool(&self) -> &HashMap<K, SubscriberPtr<K, U>> {
        &self.gc_pool
    }

    /// Greatest key already broadcast, if any round completed
    pub fn broadcast_key_bound(&self) -> Option<O::Key> {
        self.broadcast_state.lock().key_bound.clone()
    }

    /// Force the broadcast bound, e.g. after restoring publisher state
    pub fn set_broadcast_key_bound(&mut self, key: O::Key) {
        self.broadcast_state.lock().key_bound = Some(key);
    }

    /// Allocate a record through the wrapped object
    pub fn allocate_log(
        &mut self,
        now: WalTimePoint,
        action_case: O::ActionCase,
        param: &P,
        payload: O::Log,
    ) -> WalResult<LogPtr<O>> {
        self.object.lock().allocate_log(now, action_case, param, payload)
    }

    /// Install a record, running its action. Alias of
    /// [`WalPublisher::emplace_back_log`].
    pub fn push_back_log(&mut self, log: LogPtr<O>, param: P) -> WalResult<AppendOutcome> {
        self.emplace_back_log(log, param)
    }

    /// Install a record, running its action
    pub fn emplace_back_log(&mut self, log: LogPtr<O>, param: P) -> WalResult<AppendOutcome> {
        self.object.lock().emplace_back(log, param)
    }

    /// Find a record by key
    pub fn find_log(&self, key: &O::Key) -> Option<LogPtr<O>> {
        self.object.lock().find_log(key)
    }

    /// Replace the log history wholesale; resets the broadcast bound to the
    /// new tail and drops parked hole logs
    pub fn assign_logs<I: IntoIterator<Item = LogPtr<O>>>(&mut self, logs: I) {
        self.object.lock().assign_logs(logs);
    }

    /// Bulk deserialize through the object's load callback
    pub fn load(&mut self, storage: &S, param: &P) -> WalResult<()> {
        self.object.lock().load(storage, param)
    }

    /// Bulk serialize through the object's dump callback
    pub fn dump(&self, storage: &mut S, param: &P) -> WalResult<()> {
        self.object.lock().dump(storage, param)
    }

    /// The greatest key ingest discards as already seen
    pub fn global_ignore_key(&self) -> Option<O::Key> {
        self.object.lock().global_ignore_key().cloned()
    }

    /// Discard ingested records at or below `key`
    pub fn set_global_ignore_key(&mut self, key: O::Key) {
        self.object.lock().set_global_ignore_key(key);
    }

    /// Look up a subscriber, applying the application's liveness veto
    pub fn find_subscriber(&mut self, key: &K, param: &P) -> Option<SubscriberPtr<K, U>> {
        let subscriber = self.manager.find(key)?;
        if !self.check_subscriber(&subscriber, param) {
            return None;
        }
        Some(subscriber)
    }

    /// Apply the application's liveness veto; a vetoed subscriber is removed
    /// with reason [`UnsubscribeReason::Invalid`]
    pub fn check_subscriber(&mut self, subscriber: &SubscriberPtr<K, U>, param: &P) -> bool {
        let callbacks = Arc::clone(&self.callbacks);
        if let Some(check) = &callbacks.check_subscriber {
            if !check(self, subscriber, param) {
                self.remove_subscriber_handle(subscriber, UnsubscribeReason::Invalid, param);
                return false;
            }
        }
        true
    }

    /// Register a subscriber, or refresh the existing one under the same key.
    ///
    /// A new subscriber's registration doubles as a subscribe request from
    /// `checkpoint` - it immediately receives the incremental tail or a
    /// snapshot, exactly as if it had called
    /// [`WalPublisher::receive_subscribe_request`].
    pub fn create_subscriber(
        &mut self,
        key: K,
        now: WalTimePoint,
        checkpoint: Checkpoint<O>,
        param: &P,
        private_data: U,
    ) -> SubscriberPtr<K, U> {
        if let Some(existing) = self.find_subscriber(&key, param) {
            existing.set_heartbeat_timeout(self.config.subscriber_timeout);
            self.manager.subscribe(&existing, now);
            return existing;
        }

        let subscriber =
            self.manager
                .create(key.clone(), now, self.config.subscriber_timeout, private_data);
        debug!(subscriber = ?key, "subscriber added");
        let callbacks = Arc::clone(&self.callbacks);
        if let Some(on_added) = &callbacks.on_subscriber_added {
            on_added(self, &subscriber, param);
        }
        if let Err(error) = self.handle_subscribe_request(&key, checkpoint, now, param, false) {
            debug!(subscriber = ?key, %error, "implicit subscribe after registration failed");
        }
        subscriber
    }

    /// Remove a subscriber by key
    pub fn remove_subscriber(&mut self, key: &K, reason: UnsubscribeReason, param: &P) {
        let Some(subscriber) = self.manager.unsubscribe_key(key) else {
            return;
        };
        self.finish_removal(subscriber, reason, param);
    }

    /// Remove a subscriber by handle
    pub fn remove_subscriber_handle(
        &mut self,
        subscriber: &SubscriberPtr<K, U>,
        reason: UnsubscribeReason,
        param: &P,
    ) {
        let Some(subscriber) = self.manager.unsubscribe(subscriber) else {
            return;
        };
        self.finish_removal(subscriber, reason, param);
    }

    fn finish_removal(
        &mut self,
        subscriber: SubscriberPtr<K, U>,
        reason: UnsubscribeReason,
        param: &P,
    ) {
        debug!(subscriber = ?subscriber.key(), ?reason, "subscriber removed");
        if self.config.enable_last_broadcast_for_removed_subscriber {
            self.gc_pool
                .insert(subscriber.key().clone(), Arc::clone(&subscriber));
        }
        let callbacks = Arc::clone(&self.callbacks);
        if let Some(on_removed) = &callbacks.on_subscriber_removed {
            on_removed(self, &subscriber, reason, param);
        }
    }

    /// Handle a subscribe request: refresh the subscriber's heartbeat, then
    /// catch it up from its checkpoint with either the incremental tail or a
    /// snapshot. The reply is always delivered through `subscribe_response`.
    pub fn receive_subscribe_request(
        &mut self,
        key: &K,
        checkpoint: Checkpoint<O>,
        now: WalTimePoint,
        param: &P,
    ) -> WalResult<()> {
        self.handle_subscribe_request(key, checkpoint, now, param, true)
    }

    fn handle_subscribe_request(
        &mut self,
        key: &K,
        checkpoint: Checkpoint<O>,
        now: WalTimePoint,
        param: &P,
        reset_timer: bool,
    ) -> WalResult<()> {
        let Some(subscriber) = self.manager.find(key) else {
            return Err(WalError::SubscriberNotFound);
        };
        if reset_timer {
            self.manager.reset_timer(&subscriber, now);
        }
        if !self.check_subscriber(&subscriber, param) {
            return Err(WalError::SubscriberNotFound);
        }
        subscriber.update_heartbeat(now);

        let callbacks = Arc::clone(&self.callbacks);
        if let Some(on_request) = &callbacks.on_subscriber_request {
            on_request(self, &subscriber, param);
        }

        if let Some(force_sync) = &callbacks.subscriber_force_sync_snapshot {
            if force_sync(
                self,
                &subscriber,
                &checkpoint.key,
                checkpoint.hash.as_ref(),
                param,
            ) {
                let result = self.send_snapshot_to(&[Arc::clone(&subscriber)], param);
                return self.send_subscribe_response(&subscriber, result, param);
            }
        }

        // A checkpoint below the compacted history cannot be caught up by
        // increments.
        let stale = {
            let object = self.object.lock();
            object
                .last_removed_key()
                .map_or(false, |removed| checkpoint.key < *removed)
        };
        if stale {
            debug!(subscriber = ?key, "checkpoint predates compacted history, sending snapshot");
            let result = self.send_snapshot_to(&[Arc::clone(&subscriber)], param);
            return self.send_subscribe_response(&subscriber, result, param);
        }

        let (diverged, tail) = {
            let object = self.object.lock();
            let mut index = object.lower_bound(&checkpoint.key);
            let mut diverged = false;
            if index < object.len() {
                let candidate = &object.logs()[index];
                if object.key_of(candidate) == checkpoint.key {
                    if let (Some(claimed), true) =
                        (&checkpoint.hash, object.callbacks().hash_chain_enabled())
                    {
                        if let Some(stored) = object.hash_of(candidate) {
                            if stored != *claimed {
                                diverged = true;
                            }
                        }
                    }
                    index += 1;
                }
            }
            let tail: Vec<LogPtr<O>> = if diverged {
                Vec::new()
            } else {
                object.logs().iter().skip(index).cloned().collect()
            };
            (diverged, tail)
        };

        if diverged {
            warn!(subscriber = ?key, "checkpoint hash diverged from stored chain, sending snapshot");
            let result = self.send_snapshot_to(&[Arc::clone(&subscriber)], param);
            return self.send_subscribe_response(&subscriber, result, param);
        }
        if !tail.is_empty() {
            let result = self.send_logs_to(&tail, &[Arc::clone(&subscriber)], param);
            return self.send_subscribe_response(&subscriber, result, param);
        }
        self.send_subscribe_response(&subscriber, Ok(()), param)
    }

    /// Ship the new tail (and any captured hole logs) to every subscriber.
    ///
    /// A delivered tail advances the broadcast bound to its last key; a
    /// failed delivery leaves the bound untouched so the next round retries
    /// the same tail. Removed subscribers parked in the gc pool receive the
    /// same batches once, with bounded retries. Returns the number of records
    /// handed off.
    pub fn broadcast(&mut self, param: &P) -> usize {
        let (tail, holes) = {
            let bound = self.broadcast_state.lock().key_bound.clone();
            let holes = self.broadcast_state.lock().hole_logs.clone();
            let object = self.object.lock();
            let tail: Vec<LogPtr<O>> = match &bound {
                Some(bound) => {
                    let start = object.upper_bound(bound);
                    object.logs().iter().skip(start).cloned().collect()
                }
                None => object.logs().iter().cloned().collect(),
            };
            (tail, holes)
        };

        let subscribers = self.manager.all();
        let mut tail_delivered = true;
        let mut holes_delivered = true;
        if !subscribers.is_empty() {
            if !tail.is_empty() {
                tail_delivered = self.send_logs_to(&tail, &subscribers, param).is_ok();
            }
            if !holes.is_empty() {
                holes_delivered = self.send_logs_to(&holes, &subscribers, param).is_ok();
            }
        }

        if !self.gc_pool.is_empty() {
            self.last_broadcast_to_removed(&tail, &holes, param);
        }

        let mut sent = 0;
        if holes_delivered && !holes.is_empty() {
            sent += holes.len();
            let mut state = self.broadcast_state.lock();
            let parked = holes.len().min(state.hole_logs.len());
            state.hole_logs.drain(..parked);
        }
        if tail_delivered {
            if let Some(last) = tail.last() {
                let key = self.object.lock().key_of(last);
                debug!(bound = ?key, count = tail.len(), "broadcast advanced");
                self.broadcast_state.lock().key_bound = Some(key);
                sent += tail.len();
            }
        }
        sent
    }

    /// One final delivery to subscribers removed since the previous round.
    fn last_broadcast_to_removed(&mut self, tail: &[LogPtr<O>], holes: &[LogPtr<O>], param: &P) {
        let mut retries = LAST_BROADCAST_RETRIES;
        while !self.gc_pool.is_empty() && retries > 0 {
            retries -= 1;
            let mut parked = std::mem::take(&mut self.gc_pool);
            let departed: Vec<SubscriberPtr<K, U>> = parked.values().cloned().collect();

            let mut delivered = true;
            if !tail.is_empty() {
                delivered &= self.send_logs_to(tail, &departed, param).is_ok();
            }
            if !holes.is_empty() {
                delivered &= self.send_logs_to(holes, &departed, param).is_ok();
            }
            if delivered {
                break;
            }

            // Subscribers removed during the send callbacks join the retry.
            for (key, subscriber) in self.gc_pool.drain() {
                parked.insert(key, subscriber);
            }
            self.gc_pool = parked;
        }

        if !self.gc_pool.is_empty() {
            warn!(
                remaining = self.gc_pool.len(),
                "final broadcast to removed subscribers kept failing, dropping them"
            );
        }
        self.gc_pool.clear();
    }

    /// Drive the publisher: broadcast, collect garbage below the broadcast
    /// bound, and expire silent subscribers. `max_events` caps the total
    /// work; each inner round handles up to a sixteenth of it per task kind.
    pub fn tick(&mut self, now: WalTimePoint, param: &P, max_events: usize) -> usize {
        let max_events = if max_events == 0 { usize::MAX } else { max_events };
        let mut processed = 0;
        let mut has_event = true;
        while processed < max_events && has_event {
            has_event = false;
            let round = if max_events > 16 {
                max_events / 16
            } else {
                max_events
            };

            let sent = self.broadcast(param);
            if sent > 0 {
                has_event = true;
                processed += sent;
            }

            // Never collect a record that has not been broadcast yet.
            let hold = self.broadcast_state.lock().key_bound.clone();
            let removed = self.object.lock().gc(now, hold.as_ref(), round);
            if removed > 0 {
                has_event = true;
                processed += removed;
            }

            for _ in 0..round {
                match self.manager.first_expired(now) {
                    Some(subscriber) => {
                        self.remove_subscriber_handle(
                            &subscriber,
                            UnsubscribeReason::Timeout,
                            param,
                        );
                        processed += 1;
                        has_event = true;
                    }
                    None => break,
                }
            }
        }
        processed
    }

    /// Invoke the snapshot transmitter for the given subscribers
    pub fn send_snapshot_to(
        &mut self,
        subscribers: &[SubscriberPtr<K, U>],
        param: &P,
    ) -> WalResult<()> {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(send) = &callbacks.send_snapshot else {
            return Err(WalError::ActionNotSet);
        };
        if subscribers.is_empty() {
            return Ok(());
        }
        send(self, subscribers, param)
    }

    /// Invoke the record transmitter for the given batch and subscribers
    pub fn send_logs_to(
        &mut self,
        logs: &[LogPtr<O>],
        subscribers: &[SubscriberPtr<K, U>],
        param: &P,
    ) -> WalResult<()> {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(send) = &callbacks.send_logs else {
            return Err(WalError::ActionNotSet);
        };
        if logs.is_empty() || subscribers.is_empty() {
            return Ok(());
        }
        send(self, logs, subscribers, param)
    }

    /// Deliver a subscribe reply; without a `subscribe_response` callback the
    /// code is handed back to the caller unchanged
    pub fn send_subscribe_response(
        &mut self,
        subscriber: &SubscriberPtr<K, U>,
        code: WalResult<()>,
        param: &P,
    ) -> WalResult<()> {
        let callbacks = Arc::clone(&self.callbacks);
        match &callbacks.subscribe_response {
            Some(respond) => respond(self, subscriber, code, param),
            None => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PublisherConfig::default();
        assert_eq!(config.subscriber_timeout, WalDuration::from_secs(600));
        assert!(!config.enable_last_broadcast_for_removed_subscriber);
        assert!(!config.enable_hole_log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_and_serde() {
        let config = PublisherConfig::default()
            .with_subscriber_timeout(WalDuration::from_secs(5))
            .with_last_broadcast_for_removed_subscriber(true)
            .with_hole_log(true);
        assert!(config.enable_hole_log);

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: PublisherConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.subscriber_timeout, WalDuration::from_secs(5));
        assert!(decoded.enable_last_broadcast_for_removed_subscriber);
    }
}
