//! The WAL client: the subscriber side of a replication group.
//!
//! A client wraps a [`WalObject`], applies logs pushed by the remote
//! publisher idempotently against its `last_finished_log_key` watermark,
//! installs full snapshots wholesale, and emits subscribe/heartbeat requests
//! on a configurable cadence with a shorter retry cadence after a failed
//! send.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use wal_core::{
    AppendOutcome, LogCallbacks, LogOperator, LogPtr, SharedWalObject, WalConfig, WalDuration,
    WalError, WalObject, WalResult, WalTimePoint,
};

/// Default cadence of outbound subscribe requests (3 minutes)
pub const DEFAULT_HEARTBEAT_INTERVAL: WalDuration = WalDuration::from_secs(3 * 60);

/// Default cadence after a failed subscribe request (1 minute)
pub const DEFAULT_HEARTBEAT_RETRY_INTERVAL: WalDuration = WalDuration::from_secs(60);

/// Configuration of a [`WalClient`]; embeds the wrapped object's tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Tuning of the underlying WAL object
    pub wal: WalConfig,

    /// Normal cadence of outbound subscribe requests
    pub subscriber_heartbeat_interval: WalDuration,

    /// Cadence after a failed send
    pub subscriber_heartbeat_retry_interval: WalDuration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            wal: WalConfig::default(),
            subscriber_heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            subscriber_heartbeat_retry_interval: DEFAULT_HEARTBEAT_RETRY_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Set the heartbeat cadences
    pub fn with_heartbeat_intervals(mut self, normal: WalDuration, retry: WalDuration) -> Self {
        self.subscriber_heartbeat_interval = normal;
        self.subscriber_heartbeat_retry_interval = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> WalResult<()> {
        self.wal.validate()
    }
}

/// Install a snapshot received from the publisher; expected to rebuild the
/// wrapped object with [`WalClient::assign_logs`]
pub type ReceiveSnapshotFn<O, S, P, D, Sn> = Box<
    dyn Fn(&mut WalClient<O, S, P, D, Sn>, &Sn, &P) -> WalResult<()> + Send + Sync,
>;

/// React to the publisher's reply to a subscribe request
pub type ReceiveSubscribeResponseFn<O, S, P, D, Sn> =
    Box<dyn Fn(&mut WalClient<O, S, P, D, Sn>, &P) -> WalResult<()> + Send + Sync>;

/// Emit an outbound subscribe/heartbeat request
pub type SubscribeRequestFn<O, S, P, D, Sn> =
    Box<dyn Fn(&mut WalClient<O, S, P, D, Sn>, &P) -> WalResult<()> + Send + Sync>;

/// The client-specific callback table, embedding the object's table.
///
/// `on_receive_snapshot` is required; the rest is optional.
pub struct ClientCallbacks<O: LogOperator, S, P, D, Sn> {
    /// The wrapped object's callback table, shared with the object itself
    pub log: Arc<LogCallbacks<O, S, P, D>>,

    /// Install a received snapshot (required)
    pub on_receive_snapshot: Option<ReceiveSnapshotFn<O, S, P, D, Sn>>,

    /// Reply notification
    pub on_receive_subscribe_response: Option<ReceiveSubscribeResponseFn<O, S, P, D, Sn>>,

    /// Outbound heartbeat emitter
    pub subscribe_request: Option<SubscribeRequestFn<O, S, P, D, Sn>>,
}

impl<O: LogOperator, S, P, D, Sn> ClientCallbacks<O, S, P, D, Sn> {
    /// Build a table around an object callback table; client-specific
    /// callbacks start unset
    pub fn new(log: Arc<LogCallbacks<O, S, P, D>>) -> Self {
        Self {
            log,
            on_receive_snapshot: None,
            on_receive_subscribe_response: None,
            subscribe_request: None,
        }
    }
}

/// The subscriber side of a replication group
pub struct WalClient<O: LogOperator, S, P, D, Sn> {
    callbacks: Arc<ClientCallbacks<O, S, P, D, Sn>>,
    config: Arc<ClientConfig>,
    object: SharedWalObject<O, S, P, D>,
    next_heartbeat: WalTimePoint,
    // Greatest key observed from the publisher; shared with the assign hook
    last_finished: Arc<Mutex<Option<O::Key>>>,
}

impl<O, S, P, D, Sn> WalClient<O, S, P, D, Sn>
where
    O: LogOperator,
    P: Clone,
{
    /// Create a client owning a fresh [`WalObject`]. The first heartbeat is
    /// due at `now`.
    pub fn new(
        now: WalTimePoint,
        callbacks: ClientCallbacks<O, S, P, D, Sn>,
        config: ClientConfig,
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
        Self::build(now, object, callbacks, config)
    }

    /// Layer a client on an existing shared object. The object-level
    /// callback table and configuration are inherited from the shared object;
    /// only the client-specific callbacks of `callbacks` are kept.
    pub fn with_shared_object(
        now: WalTimePoint,
        object: SharedWalObject<O, S, P, D>,
        mut callbacks: ClientCallbacks<O, S, P, D, Sn>,
        mut config: ClientConfig,
    ) -> WalResult<Self> {
        {
            let object = object.lock();
            callbacks.log = Arc::clone(object.callbacks());
            config.wal = object.config().as_ref().clone();
        }
        Self::validate(&callbacks)?;
        config.validate()?;
        Self::build(now, object, callbacks, config)
    }

    fn validate(callbacks: &ClientCallbacks<O, S, P, D, Sn>) -> WalResult<()> {
        if callbacks.log.allocate_log_key.is_none() {
            return Err(WalError::initialization(
                "client requires the allocate_log_key callback",
            ));
        }
        if callbacks.on_receive_snapshot.is_none() {
            return Err(WalError::initialization(
                "client requires the on_receive_snapshot callback",
            ));
        }
        Ok(())
    }

    fn build(
        now: WalTimePoint,
        object: SharedWalObject<O, S, P, D>,
        callbacks: ClientCallbacks<O, S, P, D, Sn>,
        config: ClientConfig,
    ) -> WalResult<Self> {
        let last_finished: Arc<Mutex<Option<O::Key>>> = Arc::new(Mutex::new(None));

        // A snapshot installation finishes every record it carries.
        let watermark = Arc::clone(&last_finished);
        object.lock().add_assign_hook(move |wal| {
            if let Some(key) = wal.last_key() {
                let mut watermark = watermark.lock();
                let advance = watermark.as_ref().map_or(true, |current| *current < key);
                if advance {
                    *watermark = Some(key);
                }
            }
        });

        Ok(Self {
            callbacks: Arc::new(callbacks),
            config: Arc::new(config),
            object,
            next_heartbeat: now,
            last_finished,
        })
    }

    /// The client configuration
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Handle to the wrapped object, for sharing with a publisher
    pub fn object(&self) -> SharedWalObject<O, S, P, D> {
        Arc::clone(&self.object)
    }

    /// Run a closure against the wrapped object
    pub fn with_object<R>(&self, f: impl FnOnce(&mut WalObject<O, S, P, D>) -> R) -> R {
        f(&mut self.object.lock())
    }

    /// When the next outbound heartbeat is due
    pub fn next_heartbeat(&self) -> WalTimePoint {
        self.next_heartbeat
    }

    /// Greatest key observed from the publisher, if any
    pub fn last_finished_log_key(&self) -> Option<O::Key> {
        self.last_finished.lock().clone()
    }

    /// Force the idempotence watermark, e.g. after restoring client state
    pub fn set_last_finished_log_key(&mut self, key: O::Key) {
        *self.last_finished.lock() = Some(key);
    }

    /// Apply one record pushed by the publisher.
    ///
    /// Records at or below the watermark return [`AppendOutcome::Ignored`]
    /// and leave the container untouched; anything newer advances the
    /// watermark and is installed through the wrapped object.
    pub fn receive_log(&mut self, param: &P, log: LogPtr<O>) -> WalResult<AppendOutcome> {
        let key = self.object.lock().key_of(&log);
        {
            let mut watermark = self.last_finished.lock();
            if watermark.as_ref().map_or(false, |current| key <= *current) {
                return Ok(AppendOutcome::Ignored);
            }
            *watermark = Some(key);
        }
        self.object.lock().emplace_back(log, param.clone())
    }

    /// Apply a batch of records; returns how many were installed
    pub fn receive_logs<I: IntoIterator<Item = LogPtr<O>>>(&mut self, param: &P, logs: I) -> usize {
        let mut applied = 0;
        for log in logs {
            if matches!(self.receive_log(param, log), Ok(AppendOutcome::Appended)) {
                applied += 1;
            }
        }
        applied
    }

    /// Install a full snapshot. The callback is expected to rebuild the
    /// wrapped object via [`WalClient::assign_logs`], which also advances the
    /// watermark to the snapshot's greatest key.
    pub fn receive_snapshot(&mut self, snapshot: &Sn, param: &P) -> WalResult<()> {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(install) = &callbacks.on_receive_snapshot else {
            return Err(WalError::initialization(
                "on_receive_snapshot callback is not set",
            ));
        };
        debug!("installing snapshot");
        install(self, snapshot, param)
    }

    /// Forward the publisher's subscribe reply to the application
    pub fn receive_subscribe_response(&mut self, param: &P) -> WalResult<()> {
        let callbacks = Arc::clone(&self.callbacks);
        match &callbacks.on_receive_subscribe_response {
            Some(notify) => notify(self, param),
            None => Err(WalError::ActionNotSet),
        }
    }

    /// Replace the log history wholesale; advances the watermark to the new
    /// tail's greatest key
    pub fn assign_logs<I: IntoIterator<Item = LogPtr<O>>>(&mut self, logs: I) {
        self.object.lock().assign_logs(logs);
    }

    /// Find a record by key
    pub fn find_log(&self, key: &O::Key) -> Option<LogPtr<O>> {
        self.object.lock().find_log(key)
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

    /// Drive the client: collect garbage and keep the heartbeat alive.
    ///
    /// When a heartbeat is due, `subscribe_request` is emitted; success
    /// schedules the next one a full interval out, failure schedules the
    /// retry interval instead.
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

            let removed = self.object.lock().gc(now, None, round);
            if removed > 0 {
                has_event = true;
                processed += removed;
            }

            if now >= self.next_heartbeat {
                let callbacks = Arc::clone(&self.callbacks);
                let result = match &callbacks.subscribe_request {
                    Some(send) => send(self, param),
                    None => Ok(()),
                };
                let interval = match &result {
                    Ok(_) => self.config.subscriber_heartbeat_interval,
                    Err(error) => {
                        warn!(%error, "subscribe request failed, scheduling retry");
                        self.config.subscriber_heartbeat_retry_interval
                    }
                };
                self.next_heartbeat = now + interval;
                if self.next_heartbeat <= now {
                    // A zero interval must not spin the tick loop.
                    self.next_heartbeat = now + DEFAULT_HEARTBEAT_INTERVAL;
                }
                processed += 1;
                has_event = true;
            }
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(
            config.subscriber_heartbeat_interval,
            WalDuration::from_secs(180)
        );
        assert_eq!(
            config.subscriber_heartbeat_retry_interval,
            WalDuration::from_secs(60)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = ClientConfig::default()
            .with_heartbeat_intervals(WalDuration::from_secs(30), WalDuration::from_secs(10));
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: ClientConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            decoded.subscriber_heartbeat_interval,
            WalDuration::from_secs(30)
        );
    }
}
