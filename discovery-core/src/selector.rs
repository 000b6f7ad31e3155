//! Discovery selector.
//!
//! Picks a server for a new channel and resolves an existing channel to its
//! owner. Decisions are made against the local cache; the only
//! coordination-service access is a point read of a channel that the cache
//! has not seen yet.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    cache::LocalCache,
    channel::ChannelRegistry,
    error::{DiscoveryError, DiscoveryResult},
    metrics::DISCOVERY_COUNT,
    models::{ChannelRecord, ServerRecord},
};

/// Least loaded server, ties broken by the smallest host.
pub fn pick_least_loaded(servers: &[Arc<ServerRecord>]) -> Option<Arc<ServerRecord>> {
    servers
        .iter()
        .min_by(|a, b| (a.load(), &a.host).cmp(&(b.load(), &b.host)))
        .cloned()
}

#[derive(Debug, Clone)]
pub struct DiscoverySelector {
    cache: Arc<LocalCache>,
    channels: ChannelRegistry,
    load_ceiling: u64,
}

impl DiscoverySelector {
    pub fn new(cache: Arc<LocalCache>, channels: ChannelRegistry, load_ceiling: u64) -> Self {
        Self {
            cache,
            channels,
            load_ceiling,
        }
    }

    /// Load at or above which an owner is asked to be retried later.
    pub fn load_ceiling(&self) -> u64 {
        self.load_ceiling
    }

    /// Server that should host a new channel.
    pub fn pick_server_for_new_channel(&self) -> DiscoveryResult<Arc<ServerRecord>> {
        let result = self.pick();
        let stats = &DISCOVERY_COUNT.new_channel;
        match &result {
            Ok(_) => stats.ok.inc(),
            Err(DiscoveryError::NoServersAvailable) => stats.no_servers.inc(),
            Err(_) => stats.error.inc(),
        }
        result
    }

    /// Server currently hosting `channel_id`, or a server for it if the
    /// channel does not exist yet.
    ///
    /// An owner missing from the server cache gives `OwnerUnavailable`; an
    /// owner at or above the load ceiling gives `RetryLater`. Ownership is
    /// never reassigned here.
    pub async fn resolve_server_for_channel(
        &self,
        channel_id: &str,
    ) -> DiscoveryResult<Arc<ServerRecord>> {
        let result = self.resolve(channel_id).await;
        let stats = &DISCOVERY_COUNT.resolve_channel;
        match &result {
            Ok(_) => stats.ok.inc(),
            Err(DiscoveryError::NoServersAvailable) => stats.no_servers.inc(),
            Err(DiscoveryError::RetryLater { .. }) => stats.retry_later.inc(),
            Err(DiscoveryError::OwnerUnavailable { .. }) => stats.owner_unavailable.inc(),
            Err(_) => stats.error.inc(),
        }
        result
    }

    fn pick(&self) -> DiscoveryResult<Arc<ServerRecord>> {
        let server =
            pick_least_loaded(&self.cache.servers()).ok_or(DiscoveryError::NoServersAvailable)?;
        trace!(host = %server.host, load = server.load(), "picked server for new channel");
        Ok(server)
    }

    async fn resolve(&self, channel_id: &str) -> DiscoveryResult<Arc<ServerRecord>> {
        let Some(channel) = self.lookup(channel_id).await? else {
            debug!(channel_id, "unknown channel, picking a server");
            return self.pick();
        };
        let Some(owner) = self.cache.server(&channel.owner) else {
            debug!(channel_id, owner = %channel.owner, "channel owner unavailable");
            return Err(DiscoveryError::OwnerUnavailable {
                channel_id: channel_id.to_owned(),
                host: channel.owner.clone(),
            });
        };
        let load = owner.load();
        if load >= self.load_ceiling {
            debug!(channel_id, owner = %owner.host, load, ceiling = self.load_ceiling, "channel owner over ceiling");
            return Err(DiscoveryError::RetryLater {
                host: owner.host.clone(),
                load,
                ceiling: self.load_ceiling,
            });
        }
        Ok(owner)
    }

    /// Cached channel, falling back to a point read for channels the cache
    /// has not caught up with.
    async fn lookup(&self, channel_id: &str) -> DiscoveryResult<Option<Arc<ChannelRecord>>> {
        if let Some(channel) = self.cache.channel(channel_id) {
            return Ok(Some(channel));
        }
        match self.channels.get_channel(channel_id).await {
            Ok(record) => Ok(Some(Arc::new(record))),
            Err(DiscoveryError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use coordination::{Coordinator, MemoryTree, paths::CHANNELS_ROOT};

    use super::*;

    fn server(host: &str, connections: u64, queued: u64) -> Arc<ServerRecord> {
        Arc::new(ServerRecord {
            host: host.into(),
            connections,
            queued,
        })
    }

    #[test]
    fn test_pick_least_loaded() {
        assert!(pick_least_loaded(&[]).is_none());

        let servers = [server("b", 5, 0), server("a", 1, 3), server("c", 0, 1)];
        assert_eq!(pick_least_loaded(&servers).unwrap().host, "c");
    }

    #[test]
    fn test_pick_ties_by_host() {
        // A{2,0} and B{1,1} have the same load
        let servers = [server("B", 1, 1), server("A", 2, 0)];
        assert_eq!(pick_least_loaded(&servers).unwrap().host, "A");
    }

    #[test]
    fn test_pick_saturating_load() {
        let servers = [server("a", u64::MAX, 1), server("b", u64::MAX, 0)];
        assert_eq!(pick_least_loaded(&servers).unwrap().host, "a");
    }

    async fn selector(ceiling: u64) -> (Arc<LocalCache>, ChannelRegistry, DiscoverySelector) {
        let tree = MemoryTree::new();
        let session: Arc<dyn Coordinator> = Arc::new(tree.open_session().unwrap());
        session.ensure_path(CHANNELS_ROOT).await.unwrap();
        let cache = Arc::new(LocalCache::new());
        let channels = ChannelRegistry::new(session, Arc::clone(&cache), "a:1");
        let selector = DiscoverySelector::new(Arc::clone(&cache), channels.clone(), ceiling);
        (cache, channels, selector)
    }

    #[tokio::test]
    async fn test_resolve_policy() {
        let (cache, channels, selector) = selector(10).await;
        assert_eq!(
            selector.pick_server_for_new_channel(),
            Err(DiscoveryError::NoServersAvailable)
        );

        cache.insert_server(ServerRecord::new("a:1"));
        cache.insert_server(ServerRecord::new("b:1"));
        cache.update_server("b:1", |r| ServerRecord {
            connections: 9,
            queued: 1,
            ..r.clone()
        });

        // unknown channel behaves like a new one
        assert_eq!(
            selector.resolve_server_for_channel("new").await.unwrap().host,
            "a:1"
        );

        cache.put_channel(ChannelRecord::new("on-a", "a:1"));
        cache.put_channel(ChannelRecord::new("on-b", "b:1"));
        cache.put_channel(ChannelRecord::new("on-gone", "gone:1"));
        assert_eq!(
            selector.resolve_server_for_channel("on-a").await.unwrap().host,
            "a:1"
        );
        assert_eq!(
            selector.resolve_server_for_channel("on-b").await,
            Err(DiscoveryError::RetryLater {
                host: "b:1".into(),
                load: 10,
                ceiling: 10
            })
        );
        assert_eq!(
            selector.resolve_server_for_channel("on-gone").await,
            Err(DiscoveryError::OwnerUnavailable {
                channel_id: "on-gone".into(),
                host: "gone:1".into()
            })
        );

        // cache miss falls back to a point read
        channels.create_channel("fresh", "b:1").await.unwrap();
        assert!(matches!(
            selector.resolve_server_for_channel("fresh").await,
            Err(DiscoveryError::RetryLater { .. })
        ));
    }
}
