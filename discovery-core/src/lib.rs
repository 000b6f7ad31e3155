//! # discovery-core
//!
//! Service discovery and channel assignment for a fleet of stateful servers.
//! Servers advertise themselves and their load as ephemeral nodes in a
//! coordination service; clients ask for a server to host a new channel or
//! for the server that owns an existing one.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use coordination;
pub use tokio;
pub use tracing;

pub use crate::error::{DiscoveryError, DiscoveryResult};
pub use crate::models::{ChannelRecord, LoadUpdate, ServerDescriptor, ServerRecord};
pub use crate::registry::{Registry, RegistryOptions, RegistryState};

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
mod members;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod selector;
pub mod server;
