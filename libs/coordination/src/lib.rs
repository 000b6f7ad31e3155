//! # coordination
//!
//! Session adapter for a hierarchical, ZooKeeper-style coordination service.
//!
//! This library provides:
//! - **Coordinator trait** with create/read/write/delete/children, atomic
//!   multi-op transactions, one-shot watches and session state events.
//! - **Permanent watches** that re-arm one-shot watches until the watched
//!   node is deleted or the subscription is cancelled.
//! - **Path scheme** translating server hosts and channel ids to tree paths.
//! - **Payload codecs** for counters and owner hosts.
//! - **In-process tree** backend with multi-session semantics and failure
//!   injection, used by the server binary and by tests.

#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod client;
pub mod codec;
pub mod error;
pub mod memory;
pub mod paths;
pub mod watch;

pub use client::{
    ConnectPolicy, Coordinator, CreateMode, EventKind, NodeEvent, Op, SessionState, WatchKind,
    Watcher, connect_with_retry,
};
pub use error::{CoordinationError, CoordinationResult};
pub use memory::{MemoryCoordinator, MemoryTree};
pub use paths::{ChannelPaths, Counter, ServerPaths};
pub use watch::{PermanentWatch, Subscription, SubscriptionState, WatchHandler};
