//! # WAL Replication
//!
//! Publisher/subscriber replication on top of [`wal_core`]. A single
//! publisher keeps every replica's derived state identical to its own by
//! shipping log records for deterministic re-execution, falling back to full
//! snapshots when an increment cannot catch a subscriber up.
//!
//! ## Key Components
//!
//! - **WalPublisher**: Tracks subscribers with heartbeats, broadcasts the new
//!   tail (plus hole logs inserted below the previous broadcast watermark),
//!   decides between snapshot and incremental catch-up, and verifies chained
//!   hashes to detect divergent replicas
//! - **WalClient**: Applies pushed logs idempotently, installs snapshots
//!   wholesale, and keeps a subscribe/heartbeat loop alive
//! - **SubscriberManager**: Indexes subscribers by key and orders them by
//!   next heartbeat expiry
//!
//! Transport, storage and snapshot encoding are all callback contracts; the
//! crate itself performs no I/O. A publisher and a client can share one
//! [`wal_core::WalObject`] so a process acts as both source and relay.

pub mod client;
pub mod publisher;
pub mod subscriber;

pub use client::{ClientCallbacks, ClientConfig, WalClient};
pub use publisher::{Checkpoint, PublisherCallbacks, PublisherConfig, WalPublisher};
pub use subscriber::{Subscriber, SubscriberManager, SubscriberPtr};

/// Current version of the replication layer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
