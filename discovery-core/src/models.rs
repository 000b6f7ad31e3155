//! Cached records and the descriptor handed to discovery callers.

use coordination::Counter;
use serde::{Deserialize, Serialize};

/// Load snapshot of one registered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub host: String,
    pub connections: u64,
    pub queued: u64,
}

impl ServerRecord {
    /// Record for a server whose counters have not been read yet.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connections: 0,
            queued: 0,
        }
    }

    /// Active plus queued connections.
    pub fn load(&self) -> u64 {
        self.connections.saturating_add(self.queued)
    }

    /// Copy of this record with one counter replaced.
    pub fn with_counter(&self, counter: Counter, value: u64) -> Self {
        let mut next = self.clone();
        match counter {
            Counter::Connections => next.connections = value,
            Counter::Queued => next.queued = value,
        }
        next
    }
}

/// Ownership and load snapshot of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub owner: String,
    pub connections: u64,
    pub queued: u64,
}

impl ChannelRecord {
    pub fn new(channel_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            owner: owner.into(),
            connections: 0,
            queued: 0,
        }
    }

    pub fn with_counter(&self, counter: Counter, value: u64) -> Self {
        let mut next = self.clone();
        match counter {
            Counter::Connections => next.connections = value,
            Counter::Queued => next.queued = value,
        }
        next
    }
}

/// Server returned by the discovery operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub host: String,
    pub connections: u64,
    pub queued_connections: u64,
}

impl From<&ServerRecord> for ServerDescriptor {
    fn from(record: &ServerRecord) -> Self {
        Self {
            host: record.host.clone(),
            connections: record.connections,
            queued_connections: record.queued,
        }
    }
}

/// Counter update sent by a server for itself or one of its channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadUpdate {
    pub connections: u64,
    pub queued: u64,
}
