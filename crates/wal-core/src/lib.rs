//! # WAL Core
//!
//! Core write-ahead-log primitives for building replicated state machines.
//! A [`WalObject`] owns an ordered sequence of reference-counted log records,
//! dispatches each record's action through a user-supplied callback table,
//! maintains a chained hash across the sequence to detect replica divergence,
//! and garbage-collects old records by age and size.
//!
//! ## Key Components
//!
//! - **WalObject**: The log container with reentrancy-safe append, ordered
//!   insertion, merge-on-duplicate-key, and front-only garbage collection
//! - **LogCallbacks**: The callback table bridging the opaque record payload
//!   and the core (meta access, key allocation, hashing, action dispatch)
//! - **WalConfig**: GC and size tuning with validation
//! - **Error/Outcome types**: [`WalError`] for failures, [`AppendOutcome`]
//!   for the success variants of ingestion (appended, merged, ignored,
//!   pending)
//!
//! The core performs no I/O and never suspends; storage, transport and clock
//! all live behind the callbacks. Each instance is single-threaded
//! cooperative - callers serialise access, handles may cross threads.
//!
//! ## Example Usage
//!
//! ```rust
//! use wal_core::{LogCallbacks, LogMeta, LogOperator, WalConfig, WalObject};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone)]
//! struct Entry { key: u64, stamp: wal_core::WalTimePoint }
//!
//! struct Op;
//! impl LogOperator for Op {
//!     type Log = Entry;
//!     type Key = u64;
//!     type ActionCase = u32;
//!     type HashCode = u64;
//! }
//!
//! # fn main() -> wal_core::WalResult<()> {
//! let callbacks = LogCallbacks::<Op, (), (), ()>::new(
//!     |_, log: &Entry| Ok(LogMeta { timepoint: log.stamp, key: log.key, action_case: 0 }),
//!     |_, log: &Entry| log.key,
//! );
//! let wal = WalObject::new(Arc::new(callbacks), Arc::new(WalConfig::default()), ())?;
//! assert!(wal.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod callbacks;
pub mod config;
pub mod error;
pub mod object;
pub mod types;

pub use callbacks::{LogCallbacks, LogDelegate};
pub use config::WalConfig;
pub use error::{WalError, WalResult};
pub use object::{SharedWalObject, WalObject};
pub use types::{
    new_log, AppendOutcome, ChainHash, LogMeta, LogOperator, LogPtr, UnsubscribeReason,
    WalDuration, WalTimePoint,
};

/// Current version of the WAL core implementation
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
