//! Channel registry.
//!
//! A channel is the ephemeral node `/Channels/{id}` whose payload is the
//! owner host, plus two ephemeral counter children. Creation and removal are
//! single transactions, so a channel is either fully present or absent.
//! Ownership is fixed at creation; counter updates are accepted only from
//! the owner.

use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use coordination::{
    ChannelPaths, CoordinationError, CoordinationResult, Coordinator, Counter, CreateMode,
    EventKind, Op, PermanentWatch, Subscription, WatchHandler, WatchKind, codec,
    paths::{self, ALL_COUNTERS, CHANNELS_ROOT},
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::LocalCache,
    error::{DiscoveryError, DiscoveryResult},
    members::Members,
    metrics,
    models::ChannelRecord,
};

/// Channel ownership records and their cache.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    coordinator: Arc<dyn Coordinator>,
    cache: Arc<LocalCache>,
    /// Host of this process, the only owner whose channels it may update.
    local_host: String,
    root: Mutex<Option<Subscription>>,
    members: Members,
}

impl ChannelRegistry {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        cache: Arc<LocalCache>,
        local_host: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                coordinator,
                cache,
                local_host: local_host.into(),
                root: Mutex::new(None),
                members: Members::default(),
            }),
        }
    }

    /// Record `host` as the owner of a new channel with zeroed counters.
    pub async fn create_channel(&self, channel_id: &str, host: &str) -> DiscoveryResult<()> {
        let paths = ChannelPaths::new(channel_id)?;
        paths::validate_name(host)?;
        let ops = vec![
            Op::create(&paths.node, codec::encode_host(host), CreateMode::Ephemeral),
            Op::create(&paths.connections, codec::encode_counter(0), CreateMode::Ephemeral),
            Op::create(&paths.queued, codec::encode_counter(0), CreateMode::Ephemeral),
        ];
        match self.inner.coordinator.multi(ops).await {
            Ok(()) => {
                info!(channel_id, owner = host, "channel created");
                Ok(())
            }
            Err(CoordinationError::NodeExists(_)) => {
                debug!(channel_id, "channel already exists");
                Err(DiscoveryError::AlreadyExists(channel_id.to_owned()))
            }
            Err(err) => {
                error!(channel_id, error = %err, "failed to create channel");
                Err(err.into())
            }
        }
    }

    /// Read a channel straight from the coordination service.
    pub async fn get_channel(&self, channel_id: &str) -> DiscoveryResult<ChannelRecord> {
        let paths = ChannelPaths::new(channel_id)?;
        let coordinator = &self.inner.coordinator;
        let (owner, connections, queued) = tokio::try_join!(
            coordinator.read(&paths.node),
            coordinator.read(&paths.connections),
            coordinator.read(&paths.queued),
        )
        .map_err(|err| not_found_as_channel(err, channel_id))?;

        Ok(ChannelRecord {
            channel_id: channel_id.to_owned(),
            owner: codec::decode_host(&paths.node, &owner)?,
            connections: codec::decode_counter(&paths.connections, &connections)?,
            queued: codec::decode_counter(&paths.queued, &queued)?,
        })
    }

    /// Publish a channel's counters. Only the owner may update them.
    ///
    /// The ownership check is part of the same transaction as the counter
    /// writes, so a channel removed and recreated under another owner is
    /// never written to.
    pub async fn update_channel(
        &self,
        channel_id: &str,
        connections: u64,
        queued: u64,
    ) -> DiscoveryResult<()> {
        let paths = ChannelPaths::new(channel_id)?;
        let inner = &self.inner;
        let ops = vec![
            Op::check(&paths.node, codec::encode_host(&inner.local_host)),
            Op::set_data(&paths.connections, codec::encode_counter(connections)),
            Op::set_data(&paths.queued, codec::encode_counter(queued)),
        ];
        match inner.coordinator.multi(ops).await {
            Ok(()) => {
                trace!(channel_id, connections, queued, "channel counters updated");
                Ok(())
            }
            Err(CoordinationError::CheckFailed(_)) => {
                let data = inner
                    .coordinator
                    .read(&paths.node)
                    .await
                    .map_err(|err| not_found_as_channel(err, channel_id))?;
                let owner = codec::decode_host(&paths.node, &data)?;
                warn!(channel_id, %owner, local = %inner.local_host, "rejected update from non-owner");
                Err(DiscoveryError::NotOwner {
                    channel_id: channel_id.to_owned(),
                    owner,
                })
            }
            Err(err) => Err(not_found_as_channel(err, channel_id)),
        }
    }

    /// Delete a channel and its counters in one transaction.
    pub async fn remove_channel(&self, channel_id: &str) -> DiscoveryResult<()> {
        let paths = ChannelPaths::new(channel_id)?;
        let ops = vec![
            Op::delete(&paths.connections),
            Op::delete(&paths.queued),
            Op::delete(&paths.node),
        ];
        self.inner
            .coordinator
            .multi(ops)
            .await
            .map_err(|err| not_found_as_channel(err, channel_id))?;
        info!(channel_id, "channel removed");
        Ok(())
    }

    /// Mirror every channel into the cache and keep it current.
    pub async fn watch_all_channels(&self) -> DiscoveryResult<()> {
        let inner = &self.inner;
        let handler = Arc::new(ChannelWatch {
            target: Target::Root,
            registry: Arc::downgrade(inner),
        });
        let sub = PermanentWatch::start(
            Arc::clone(&inner.coordinator),
            CHANNELS_ROOT,
            WatchKind::Children,
            handler,
        )
        .await?;
        let previous = inner.root.lock().replace(sub);
        drop(previous);

        inner.sync_members().await?;
        debug!(channels = inner.cache.channels().len(), "channel cache synced");
        Ok(())
    }

    /// Cancel every channel watch and clear the channel cache.
    pub fn stop_watching(&self) {
        let inner = &self.inner;
        let root = inner.root.lock().take();
        drop(root);
        drop(inner.members.clear());
        inner.cache.clear_channels();
    }
}

fn not_found_as_channel(err: CoordinationError, channel_id: &str) -> DiscoveryError {
    match err {
        CoordinationError::NotFound(_) => DiscoveryError::NotFound(channel_id.to_owned()),
        other => other.into(),
    }
}

impl Inner {
    async fn sync_members(self: &Arc<Self>) -> CoordinationResult<()> {
        let live: BTreeSet<String> = self
            .coordinator
            .children(CHANNELS_ROOT)
            .await?
            .into_iter()
            .collect();

        for channel_id in self.members.names() {
            if !live.contains(&channel_id) {
                self.forget(&channel_id);
            }
        }
        let added = live
            .into_iter()
            .filter(|channel_id| !self.members.contains(channel_id));
        let results = futures::future::join_all(added.map(|id| self.track(id))).await;
        results.into_iter().collect()
    }

    async fn track(self: &Arc<Self>, channel_id: String) -> CoordinationResult<()> {
        let Some(generation) = self.members.claim(&channel_id) else {
            return Ok(());
        };
        let paths = match ChannelPaths::new(&channel_id) {
            Ok(paths) => paths,
            Err(err) => {
                self.members.release(&channel_id);
                warn!(channel_id, error = %err, "ignoring channel with invalid id");
                return Ok(());
            }
        };

        let subscriptions = match self.subscribe(&channel_id, generation, &paths).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                if self.members.is_current(&channel_id, generation) {
                    self.forget(&channel_id);
                }
                return Err(err);
            }
        };
        if self
            .members
            .attach(&channel_id, generation, subscriptions)
            .is_err()
        {
            return Ok(());
        }

        let loaded = async {
            self.load_owner(&channel_id, generation).await?;
            for &counter in ALL_COUNTERS {
                self.load_counter(&channel_id, counter).await?;
            }
            Ok::<_, CoordinationError>(())
        }
        .await;
        match loaded {
            Ok(()) => Ok(()),
            Err(CoordinationError::NotFound(_)) => {
                if self.members.is_current(&channel_id, generation) {
                    self.forget(&channel_id);
                }
                Ok(())
            }
            Err(err) => {
                error!(channel_id, error = %err, "failed to load channel");
                Ok(())
            }
        }
    }

    async fn subscribe(
        self: &Arc<Self>,
        channel_id: &str,
        generation: u64,
        paths: &ChannelPaths,
    ) -> CoordinationResult<Vec<Subscription>> {
        let mut subscriptions = Vec::with_capacity(1 + ALL_COUNTERS.len());
        subscriptions.push(
            self.start_watch(&paths.node, Target::Channel(channel_id.to_owned(), generation))
                .await?,
        );
        for &counter in ALL_COUNTERS {
            subscriptions.push(
                self.start_watch(
                    paths.counter(counter),
                    Target::Counter(channel_id.to_owned(), counter),
                )
                .await?,
            );
        }
        Ok(subscriptions)
    }

    async fn start_watch(
        self: &Arc<Self>,
        path: &str,
        target: Target,
    ) -> CoordinationResult<Subscription> {
        let handler = Arc::new(ChannelWatch {
            target,
            registry: Arc::downgrade(self),
        });
        PermanentWatch::start(
            Arc::clone(&self.coordinator),
            path,
            WatchKind::Node,
            handler,
        )
        .await
    }

    /// Cache the owner of `channel_id`, keeping known counters.
    ///
    /// The record is written only while the claim identified by
    /// `generation` is current, so a channel forgotten while the read was in
    /// flight is not brought back.
    async fn load_owner(&self, channel_id: &str, generation: u64) -> CoordinationResult<()> {
        let paths = ChannelPaths::new(channel_id)?;
        let data = self.coordinator.read(&paths.node).await?;
        let owner = codec::decode_host(&paths.node, &data)?;
        let cached = self.members.if_current(channel_id, generation, || {
            let record = match self.cache.channel(channel_id) {
                Some(current) => ChannelRecord {
                    owner: owner.clone(),
                    ..(*current).clone()
                },
                None => ChannelRecord::new(channel_id, owner.as_str()),
            };
            self.cache.put_channel(record);
        });
        match cached {
            Some(()) => debug!(channel_id, %owner, "channel cached"),
            None => trace!(channel_id, "channel no longer tracked, not cached"),
        }
        Ok(())
    }

    async fn load_counter(&self, channel_id: &str, counter: Counter) -> CoordinationResult<()> {
        let paths = ChannelPaths::new(channel_id)?;
        let path = paths.counter(counter);
        let data = self.coordinator.read(path).await?;
        let value = codec::decode_counter(path, &data)?;
        if self
            .cache
            .update_channel(channel_id, |record| record.with_counter(counter, value))
        {
            trace!(channel_id, %counter, value, "channel counter cached");
        }
        Ok(())
    }

    fn forget(&self, channel_id: &str) {
        let subscriptions = self.members.release(channel_id);
        drop(subscriptions);
        if self.cache.remove_channel(channel_id).is_some() {
            debug!(channel_id, "channel evicted");
        }
    }

    fn forget_all(&self) {
        drop(self.members.clear());
        self.cache.clear_channels();
    }
}

#[derive(Debug, Clone)]
enum Target {
    Root,
    /// Ownership node of a channel, with the generation of its claim.
    Channel(String, u64),
    Counter(String, Counter),
}

struct ChannelWatch {
    target: Target,
    registry: Weak<Inner>,
}

impl ChannelWatch {
    async fn handle(&self, kind: EventKind) -> CoordinationResult<()> {
        metrics::record_watch_event(kind);
        let Some(inner) = self.registry.upgrade() else {
            return Ok(());
        };
        let result = match (&self.target, kind) {
            (Target::Root, EventKind::ChildrenChanged) => inner.sync_members().await,
            (Target::Root, EventKind::Deleted) => {
                warn!(root = CHANNELS_ROOT, "channels root deleted");
                inner.forget_all();
                Ok(())
            }
            (Target::Channel(channel_id, _), EventKind::Deleted) => {
                inner.forget(channel_id);
                Ok(())
            }
            (
                Target::Channel(channel_id, generation),
                EventKind::Created | EventKind::DataChanged,
            ) => inner.load_owner(channel_id, *generation).await,
            (Target::Counter(channel_id, counter), EventKind::Created | EventKind::DataChanged) => {
                inner.load_counter(channel_id, *counter).await
            }
            _ => Ok(()),
        };
        match result {
            Err(CoordinationError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl WatchHandler for ChannelWatch {
    async fn on_created(&self, _path: &str) -> CoordinationResult<()> {
        self.handle(EventKind::Created).await
    }

    async fn on_data_changed(&self, _path: &str) -> CoordinationResult<()> {
        self.handle(EventKind::DataChanged).await
    }

    async fn on_children_changed(&self, _path: &str) -> CoordinationResult<()> {
        self.handle(EventKind::ChildrenChanged).await
    }

    async fn on_deleted(&self, _path: &str) -> CoordinationResult<()> {
        self.handle(EventKind::Deleted).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coordination::MemoryTree;
    use tracing_test::traced_test;

    use super::*;

    async fn setup(tree: &MemoryTree, host: &str) -> (Arc<dyn Coordinator>, Arc<LocalCache>, ChannelRegistry) {
        let session: Arc<dyn Coordinator> = Arc::new(tree.open_session().unwrap());
        session.ensure_path(CHANNELS_ROOT).await.unwrap();
        let cache = Arc::new(LocalCache::new());
        let registry = ChannelRegistry::new(Arc::clone(&session), Arc::clone(&cache), host);
        (session, cache, registry)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_create_and_get() {
        let tree = MemoryTree::new();
        let (_session, _cache, registry) = setup(&tree, "a:1").await;
        registry.create_channel("c1", "a:1").await.unwrap();
        assert_eq!(
            registry.get_channel("c1").await.unwrap(),
            ChannelRecord::new("c1", "a:1")
        );
        assert_eq!(
            registry.create_channel("c1", "b:1").await,
            Err(DiscoveryError::AlreadyExists("c1".into()))
        );
        assert_eq!(
            registry.get_channel("c2").await,
            Err(DiscoveryError::NotFound("c2".into()))
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_ids() {
        let tree = MemoryTree::new();
        let (_session, _cache, registry) = setup(&tree, "a:1").await;
        assert!(registry.create_channel("a/b", "a:1").await.unwrap_err().is_invalid_name());
        assert!(registry.create_channel("c1", "").await.unwrap_err().is_invalid_name());
        assert!(registry.get_channel("..").await.unwrap_err().is_invalid_name());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_corrupt_counter() {
        let tree = MemoryTree::new();
        let (session, _cache, registry) = setup(&tree, "a:1").await;
        registry.create_channel("c1", "a:1").await.unwrap();
        session
            .write("/Channels/c1/CurrentQueuedConnections", b"-3")
            .await
            .unwrap();
        assert!(matches!(
            registry.get_channel("c1").await,
            Err(DiscoveryError::CorruptRecord { path, .. }) if path == "/Channels/c1/CurrentQueuedConnections"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_update_by_owner_only() {
        let tree = MemoryTree::new();
        let (_session, _cache, mine) = setup(&tree, "a:1").await;
        let (_other_session, _other_cache, theirs) = setup(&tree, "b:1").await;
        mine.create_channel("c1", "a:1").await.unwrap();

        mine.update_channel("c1", 5, 1).await.unwrap();
        let record = mine.get_channel("c1").await.unwrap();
        assert_eq!((record.connections, record.queued), (5, 1));

        assert_eq!(
            theirs.update_channel("c1", 0, 0).await,
            Err(DiscoveryError::NotOwner {
                channel_id: "c1".into(),
                owner: "a:1".into()
            })
        );
        assert_eq!(
            mine.update_channel("missing", 1, 1).await,
            Err(DiscoveryError::NotFound("missing".into()))
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_update_after_recreate_by_other_owner() {
        let tree = MemoryTree::new();
        let (_session, _cache, mine) = setup(&tree, "a:1").await;
        let (_other_session, _other_cache, theirs) = setup(&tree, "b:1").await;
        mine.create_channel("c1", "a:1").await.unwrap();
        mine.remove_channel("c1").await.unwrap();
        theirs.create_channel("c1", "b:1").await.unwrap();

        assert_eq!(
            mine.update_channel("c1", 9, 9).await,
            Err(DiscoveryError::NotOwner {
                channel_id: "c1".into(),
                owner: "b:1".into()
            })
        );
        let record = theirs.get_channel("c1").await.unwrap();
        assert_eq!((record.connections, record.queued), (0, 0));
        assert!(logs_contain("rejected update from non-owner"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_remove_twice() {
        let tree = MemoryTree::new();
        let (_session, _cache, registry) = setup(&tree, "a:1").await;
        registry.create_channel("c1", "a:1").await.unwrap();
        registry.create_channel("c2", "a:1").await.unwrap();

        registry.remove_channel("c1").await.unwrap();
        assert_eq!(
            registry.remove_channel("c1").await,
            Err(DiscoveryError::NotFound("c1".into()))
        );
        assert!(registry.get_channel("c2").await.is_ok());
        assert!(!tree.contains("/Channels/c1"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_create_leaves_nothing() {
        let tree = MemoryTree::new();
        let (_session, _cache, registry) = setup(&tree, "a:1").await;
        tree.fail_next_multi_at(2);
        assert!(registry.create_channel("c1", "a:1").await.is_err());
        assert_eq!(tree.paths(), vec![CHANNELS_ROOT]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cache_tracks_channels() {
        let tree = MemoryTree::new();
        let (_session, cache, registry) = setup(&tree, "a:1").await;
        registry.create_channel("c0", "a:1").await.unwrap();
        registry.watch_all_channels().await.unwrap();
        assert_eq!(cache.channel("c0").unwrap().owner, "a:1");

        registry.create_channel("c1", "a:1").await.unwrap();
        eventually(|| cache.channel("c1").is_some()).await;

        registry.update_channel("c1", 3, 4).await.unwrap();
        eventually(|| {
            cache
                .channel("c1")
                .is_some_and(|c| c.connections == 3 && c.queued == 4)
        })
        .await;

        registry.remove_channel("c1").await.unwrap();
        eventually(|| cache.channel("c1").is_none()).await;
        assert!(cache.channel("c0").is_some());

        registry.stop_watching();
        assert!(cache.channels().is_empty());
    }
}
