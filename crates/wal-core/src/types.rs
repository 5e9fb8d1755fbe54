//! Common type definitions shared by the log core and the replication layer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Timepoint carried by log metadata and heartbeats. Always injected by the
/// caller; the core never reads the wall clock.
pub type WalTimePoint = DateTime<Utc>;

/// Duration type used by every timeout and expiry setting
pub type WalDuration = std::time::Duration;

/// Chained digest stored on each record to detect replica divergence.
///
/// The digest of a record folds in its predecessor's digest; a fresh chain
/// starts from [`ChainHash::initial`].
pub trait ChainHash: Clone + PartialEq + Debug + Send + Sync + 'static {
    /// The hash value a chain starts from when there is no predecessor
    fn initial() -> Self;
}

impl ChainHash for u64 {
    fn initial() -> Self {
        0
    }
}

impl ChainHash for u128 {
    fn initial() -> Self {
        0
    }
}

/// Type bundle wiring a log payload to the core.
///
/// The user comparator of the original design is the `Ord` impl of
/// [`LogOperator::Key`]; wrap the key in a newtype for exotic orders.
pub trait LogOperator: Sized + 'static {
    /// The application-defined record payload, opaque to the core
    type Log: Send + Sync + 'static;

    /// Totally-ordered log identifier
    type Key: Ord + Clone + Debug + Send + Sync + 'static;

    /// Enumerated discriminator used to pick an action handler
    type ActionCase: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// The chained hash value stored on each record
    type HashCode: ChainHash;
}

/// Shared handle to a single log record.
///
/// Records are reference-counted so iterators, hole queues and send batches
/// held by callbacks stay valid while the container mutates.
pub type LogPtr<O> = Arc<RwLock<<O as LogOperator>::Log>>;

/// Wrap a payload into a shared record handle
pub fn new_log<O: LogOperator>(payload: O::Log) -> LogPtr<O> {
    Arc::new(RwLock::new(payload))
}

/// The metadata triple stamped on every record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMeta<K, A> {
    /// Injected wall-clock stamp, used by age-based GC
    pub timepoint: WalTimePoint,

    /// Totally-ordered log key
    pub key: K,

    /// Discriminator used for action dispatch
    pub action_case: A,
}

/// Success variants of log ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendOutcome {
    /// The record was installed and its action ran
    Appended,

    /// The record was already seen and discarded without side effects
    Ignored,

    /// The append was queued behind an in-flight action callback; it is
    /// applied before the enclosing outer call returns
    Pending,

    /// A record with the same key existed; the payloads were merged
    Merged,
}

impl AppendOutcome {
    /// Check if the record itself was installed by this call
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended)
    }

    /// Check if the record was discarded as already seen
    pub fn is_ignored(&self) -> bool {
        matches!(self, AppendOutcome::Ignored)
    }
}

/// Why a subscriber left the replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsubscribeReason {
    /// No reason recorded
    None,

    /// The heartbeat deadline elapsed
    Timeout,

    /// The subscriber asked to leave
    ClientRequest,

    /// The application vetoed the subscriber
    Invalid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_chain_hash_initial() {
        assert_eq!(<u64 as ChainHash>::initial(), 0);
        assert_eq!(<u128 as ChainHash>::initial(), 0);
    }

    #[test]
    fn test_append_outcome_predicates() {
        assert!(AppendOutcome::Appended.is_appended());
        assert!(!AppendOutcome::Merged.is_appended());
        assert!(AppendOutcome::Ignored.is_ignored());
    }

    #[test]
    fn test_meta_serialization_round_trip() {
        let meta = LogMeta {
            timepoint: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            key: 42u64,
            action_case: 7u32,
        };
        let encoded = serde_json::to_string(&meta).unwrap();
        let decoded: LogMeta<u64, u32> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(meta, decoded);
    }
}
