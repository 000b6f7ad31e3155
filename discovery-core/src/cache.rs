//! Local, eventually consistent mirror of the coordination tree.
//!
//! Entries are immutable snapshots behind `Arc` and are replaced wholesale.
//! Only watch handlers and the resync path write; readers clone the `Arc`.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::RwLock;

use crate::metrics;
use crate::models::{ChannelRecord, ServerRecord};

/// Server and channel caches shared by the registries and the selector.
#[derive(Debug, Default)]
pub struct LocalCache {
    servers: RwLock<BTreeMap<String, Arc<ServerRecord>>>,
    channels: RwLock<BTreeMap<String, Arc<ChannelRecord>>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self, host: &str) -> Option<Arc<ServerRecord>> {
        self.servers.read().get(host).cloned()
    }

    /// Snapshot of every cached server, ordered by host.
    pub fn servers(&self) -> Vec<Arc<ServerRecord>> {
        self.servers.read().values().cloned().collect()
    }

    pub fn server_hosts(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<ChannelRecord>> {
        self.channels.read().get(channel_id).cloned()
    }

    /// Snapshot of every cached channel, ordered by id.
    pub fn channels(&self) -> Vec<Arc<ChannelRecord>> {
        self.channels.read().values().cloned().collect()
    }

    /// Insert `record` unless the host is already cached.
    pub(crate) fn insert_server(&self, record: ServerRecord) -> bool {
        let mut servers = self.servers.write();
        if servers.contains_key(&record.host) {
            return false;
        }
        servers.insert(record.host.clone(), Arc::new(record));
        metrics::CACHED_SERVERS.set(servers.len() as i64);
        true
    }

    /// Replace the record for `host` with `f(current)`. No-op if the host
    /// is not cached.
    pub(crate) fn update_server(
        &self,
        host: &str,
        f: impl FnOnce(&ServerRecord) -> ServerRecord,
    ) -> bool {
        let mut servers = self.servers.write();
        match servers.get_mut(host) {
            Some(entry) => {
                *entry = Arc::new(f(entry));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_server(&self, host: &str) -> Option<Arc<ServerRecord>> {
        let mut servers = self.servers.write();
        let removed = servers.remove(host);
        metrics::CACHED_SERVERS.set(servers.len() as i64);
        removed
    }

    /// Insert or replace the record for a channel.
    pub(crate) fn put_channel(&self, record: ChannelRecord) {
        let mut channels = self.channels.write();
        channels.insert(record.channel_id.clone(), Arc::new(record));
        metrics::CACHED_CHANNELS.set(channels.len() as i64);
    }

    pub(crate) fn update_channel(
        &self,
        channel_id: &str,
        f: impl FnOnce(&ChannelRecord) -> ChannelRecord,
    ) -> bool {
        let mut channels = self.channels.write();
        match channels.get_mut(channel_id) {
            Some(entry) => {
                *entry = Arc::new(f(entry));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_channel(&self, channel_id: &str) -> Option<Arc<ChannelRecord>> {
        let mut channels = self.channels.write();
        let removed = channels.remove(channel_id);
        metrics::CACHED_CHANNELS.set(channels.len() as i64);
        removed
    }

    pub(crate) fn clear_servers(&self) {
        self.servers.write().clear();
        metrics::CACHED_SERVERS.set(0);
    }

    pub(crate) fn clear_channels(&self) {
        self.channels.write().clear();
        metrics::CACHED_CHANNELS.set(0);
    }

    pub(crate) fn clear(&self) {
        self.clear_servers();
        self.clear_channels();
    }
}

#[cfg(test)]
mod tests {
    use coordination::Counter;

    use super::*;

    #[test]
    fn test_snapshots_are_replaced_not_mutated() {
        let cache = LocalCache::new();
        assert!(cache.insert_server(ServerRecord::new("a")));
        assert!(!cache.insert_server(ServerRecord::new("a")));

        let before = cache.server("a").unwrap();
        assert!(cache.update_server("a", |r| r.with_counter(Counter::Connections, 3)));
        assert_eq!(before.connections, 0);
        assert_eq!(cache.server("a").unwrap().connections, 3);

        assert!(!cache.update_server("missing", |r| r.clone()));
        assert!(cache.server("missing").is_none());
    }

    #[test]
    fn test_ordering_and_clear() {
        let cache = LocalCache::new();
        for host in ["c", "a", "b"] {
            cache.insert_server(ServerRecord::new(host));
        }
        cache.put_channel(ChannelRecord::new("c1", "a"));
        assert_eq!(cache.server_hosts(), vec!["a", "b", "c"]);
        assert_eq!(cache.channels().len(), 1);

        assert!(cache.remove_server("b").is_some());
        assert!(cache.remove_server("b").is_none());
        cache.clear();
        assert!(cache.servers().is_empty());
        assert!(cache.channel("c1").is_none());
    }
}
