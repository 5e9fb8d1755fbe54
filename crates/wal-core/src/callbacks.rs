//! The callback table bridging opaque log payloads and the core.
//!
//! Every interaction between a [`WalObject`] and the application goes through
//! this table: meta access, key allocation, hashing, bulk load/dump, merge on
//! duplicate keys, observer hooks and per-action dispatch. The table is
//! shared immutably (behind an `Arc`) between a `WalObject` and any publisher
//! or client layered on top of it.
//!
//! Handlers receive the record they operate on directly; they must not try
//! to re-lock that record through the container.

use crate::error::WalResult;
use crate::object::WalObject;
use crate::types::{LogMeta, LogOperator, LogPtr};
use std::collections::HashMap;

/// Meta triple for an operator
pub type Meta<O> = LogMeta<<O as LogOperator>::Key, <O as LogOperator>::ActionCase>;

/// Bulk-deserialize records from an opaque storage handle into the object
pub type LoadFn<O, S, P, D> =
    Box<dyn Fn(&mut WalObject<O, S, P, D>, &S, &P) -> WalResult<()> + Send + Sync>;

/// Bulk-serialize the object into an opaque storage handle
pub type DumpFn<O, S, P, D> =
    Box<dyn Fn(&WalObject<O, S, P, D>, &mut S, &P) -> WalResult<()> + Send + Sync>;

/// Read the meta triple of a record
pub type GetMetaFn<O, S, P, D> = Box<
    dyn Fn(&WalObject<O, S, P, D>, &<O as LogOperator>::Log) -> WalResult<Meta<O>> + Send + Sync,
>;

/// Stamp the meta triple on a freshly allocated record
pub type SetMetaFn<O, S, P, D> =
    Box<dyn Fn(&WalObject<O, S, P, D>, &mut <O as LogOperator>::Log, &Meta<O>) + Send + Sync>;

/// Combine payloads when two records share a key
pub type MergeLogFn<O, S, P, D> = Box<
    dyn Fn(&WalObject<O, S, P, D>, &P, &mut <O as LogOperator>::Log, &<O as LogOperator>::Log)
        + Send
        + Sync,
>;

/// Read the key of a record
pub type GetLogKeyFn<O, S, P, D> = Box<
    dyn Fn(&WalObject<O, S, P, D>, &<O as LogOperator>::Log) -> <O as LogOperator>::Key
        + Send
        + Sync,
>;

/// Allocate the key for a new record
pub type AllocateLogKeyFn<O, S, P, D> = Box<
    dyn Fn(
            &mut WalObject<O, S, P, D>,
            &<O as LogOperator>::Log,
            &P,
        ) -> WalResult<<O as LogOperator>::Key>
        + Send
        + Sync,
>;

/// Observer hook fired after a record is installed or removed
pub type LogEventFn<O, S, P, D> =
    Box<dyn Fn(&mut WalObject<O, S, P, D>, &LogPtr<O>) + Send + Sync>;

/// Read the chained hash stored on a record
pub type GetHashCodeFn<O, S, P, D> = Box<
    dyn Fn(&WalObject<O, S, P, D>, &<O as LogOperator>::Log) -> <O as LogOperator>::HashCode
        + Send
        + Sync,
>;

/// Store a chained hash on a record
pub type SetHashCodeFn<O, S, P, D> = Box<
    dyn Fn(&WalObject<O, S, P, D>, &mut <O as LogOperator>::Log, <O as LogOperator>::HashCode)
        + Send
        + Sync,
>;

/// Fold a record into its predecessor's hash
pub type CalculateHashCodeFn<O, S, P, D> = Box<
    dyn Fn(
            &WalObject<O, S, P, D>,
            <O as LogOperator>::HashCode,
            &<O as LogOperator>::Log,
        ) -> <O as LogOperator>::HashCode
        + Send
        + Sync,
>;

/// Rewrite a record before its action runs; a non-Ok result short-circuits
pub type LogPatchFn<O, S, P, D> = Box<
    dyn Fn(&mut WalObject<O, S, P, D>, &mut <O as LogOperator>::Log, &P) -> WalResult<()>
        + Send
        + Sync,
>;

/// Execute the state mutation a record describes
pub type LogActionFn<O, S, P, D> = Box<
    dyn Fn(&mut WalObject<O, S, P, D>, &<O as LogOperator>::Log, &P) -> WalResult<()>
        + Send
        + Sync,
>;

/// Handler pair for one action case
pub struct LogDelegate<O: LogOperator, S, P, D> {
    /// Optional rewrite step; runs first, non-Ok short-circuits the action
    pub patch: Option<LogPatchFn<O, S, P, D>>,

    /// The action itself; its result is the operation's result
    pub action: Option<LogActionFn<O, S, P, D>>,
}

impl<O: LogOperator, S, P, D> Default for LogDelegate<O, S, P, D> {
    fn default() -> Self {
        Self {
            patch: None,
            action: None,
        }
    }
}

impl<O: LogOperator, S, P, D> LogDelegate<O, S, P, D> {
    /// Delegate with only an action
    pub fn with_action(
        action: impl Fn(&mut WalObject<O, S, P, D>, &O::Log, &P) -> WalResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            patch: None,
            action: Some(Box::new(action)),
        }
    }

    /// Delegate with only a patch step
    pub fn with_patch(
        patch: impl Fn(&mut WalObject<O, S, P, D>, &mut O::Log, &P) -> WalResult<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            patch: Some(Box::new(patch)),
            action: None,
        }
    }

    /// Check whether any handler is present
    pub fn is_empty(&self) -> bool {
        self.patch.is_none() && self.action.is_none()
    }
}

/// The callback table of a [`WalObject`].
///
/// `get_meta` and `get_log_key` are mandatory; everything else is optional.
/// Hash chaining is active only when all three hash callbacks are present.
pub struct LogCallbacks<O: LogOperator, S, P, D> {
    /// Bulk deserialize from storage
    pub load: Option<LoadFn<O, S, P, D>>,

    /// Bulk serialize into storage
    pub dump: Option<DumpFn<O, S, P, D>>,

    /// Read the meta triple (required)
    pub get_meta: GetMetaFn<O, S, P, D>,

    /// Stamp meta on a fresh record
    pub set_meta: Option<SetMetaFn<O, S, P, D>>,

    /// Combine payloads on duplicate key
    pub merge_log: Option<MergeLogFn<O, S, P, D>>,

    /// Read the record key (required)
    pub get_log_key: GetLogKeyFn<O, S, P, D>,

    /// Allocate a key for a new record
    pub allocate_log_key: Option<AllocateLogKeyFn<O, S, P, D>>,

    /// Fired after a record is installed
    pub on_log_added: Option<LogEventFn<O, S, P, D>>,

    /// Fired after a record is popped by GC
    pub on_log_removed: Option<LogEventFn<O, S, P, D>>,

    /// Read the stored chained hash
    pub get_hash_code: Option<GetHashCodeFn<O, S, P, D>>,

    /// Store a chained hash
    pub set_hash_code: Option<SetHashCodeFn<O, S, P, D>>,

    /// Fold a record into the chain
    pub calculate_hash_code: Option<CalculateHashCodeFn<O, S, P, D>>,

    /// Per-action dispatch table
    pub delegates: HashMap<O::ActionCase, LogDelegate<O, S, P, D>>,

    /// Fallback when no delegate matches the action case
    pub default_delegate: LogDelegate<O, S, P, D>,
}

impl<O: LogOperator, S, P, D> LogCallbacks<O, S, P, D> {
    /// Build a table from the two mandatory callbacks; everything else
    /// starts unset
    pub fn new(
        get_meta: impl Fn(&WalObject<O, S, P, D>, &O::Log) -> WalResult<Meta<O>>
            + Send
            + Sync
            + 'static,
        get_log_key: impl Fn(&WalObject<O, S, P, D>, &O::Log) -> O::Key + Send + Sync + 'static,
    ) -> Self {
        Self {
            load: None,
            dump: None,
            get_meta: Box::new(get_meta),
            set_meta: None,
            merge_log: None,
            get_log_key: Box::new(get_log_key),
            allocate_log_key: None,
            on_log_added: None,
            on_log_removed: None,
            get_hash_code: None,
            set_hash_code: None,
            calculate_hash_code: None,
            delegates: HashMap::new(),
            default_delegate: LogDelegate::default(),
        }
    }

    /// Hash chaining is active when all three hash callbacks are present
    pub fn hash_chain_enabled(&self) -> bool {
        self.get_hash_code.is_some()
            && self.set_hash_code.is_some()
            && self.calculate_hash_code.is_some()
    }
}
