//! Server registry.
//!
//! Registers this process under `/AvailableServers/{host}` as three
//! ephemeral nodes and mirrors every registered server, with its load
//! counters, into the [`LocalCache`]. The cache is written only from watch
//! callbacks: a children watch on the root adds and evicts hosts, a node
//! watch per host observes its removal, and node watches on both counters
//! keep the load current.

use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use coordination::{
    CoordinationError, CoordinationResult, Coordinator, Counter, CreateMode, EventKind, Op,
    PermanentWatch, ServerPaths, Subscription, WatchHandler, WatchKind, codec,
    paths::{ALL_COUNTERS, SERVERS_ROOT},
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::LocalCache,
    error::{DiscoveryError, DiscoveryResult},
    members::Members,
    metrics,
    models::ServerRecord,
};

/// Registration and presence tracking of servers.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    coordinator: Arc<dyn Coordinator>,
    cache: Arc<LocalCache>,
    host: String,
    paths: ServerPaths,
    root: Mutex<Option<Subscription>>,
    members: Members,
}

impl ServerRegistry {
    /// Registry for this process, registering as `host`.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        cache: Arc<LocalCache>,
        host: impl Into<String>,
    ) -> DiscoveryResult<Self> {
        let host = host.into();
        let paths = ServerPaths::new(&host)?;
        Ok(Self {
            inner: Arc::new(Inner {
                coordinator,
                cache,
                host,
                paths,
                root: Mutex::new(None),
                members: Members::default(),
            }),
        })
    }

    /// Host this process registers as.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Advertise this process as an available server with zeroed counters.
    ///
    /// The node and both counters are created in one transaction. If the
    /// host is already registered the existing registration is kept and
    /// `AlreadyRegistered` is returned.
    pub async fn register_self(&self) -> DiscoveryResult<()> {
        let inner = &self.inner;
        let paths = &inner.paths;
        let ops = vec![
            Op::create(&paths.node, Vec::new(), CreateMode::Ephemeral),
            Op::create(&paths.connections, codec::encode_counter(0), CreateMode::Ephemeral),
            Op::create(&paths.queued, codec::encode_counter(0), CreateMode::Ephemeral),
        ];
        match inner.coordinator.multi(ops).await {
            Ok(()) => {
                info!(host = %inner.host, "registered as available server");
                Ok(())
            }
            Err(CoordinationError::NodeExists(path)) => {
                warn!(host = %inner.host, path, "server already registered, keeping existing registration");
                Err(DiscoveryError::AlreadyRegistered(inner.host.clone()))
            }
            Err(err) => {
                error!(host = %inner.host, error = %err, "failed to register server");
                Err(err.into())
            }
        }
    }

    /// Publish this server's current load. The cache picks the change up
    /// through the counter watches.
    pub async fn update_load(&self, connections: u64, queued: u64) -> DiscoveryResult<()> {
        let inner = &self.inner;
        let ops = vec![
            Op::set_data(&inner.paths.connections, codec::encode_counter(connections)),
            Op::set_data(&inner.paths.queued, codec::encode_counter(queued)),
        ];
        match inner.coordinator.multi(ops).await {
            Ok(()) => {
                trace!(host = %inner.host, connections, queued, "load updated");
                Ok(())
            }
            Err(CoordinationError::NotFound(_)) => {
                Err(DiscoveryError::NotFound(inner.paths.node.clone()))
            }
            Err(err) => {
                error!(host = %inner.host, error = %err, "failed to update load");
                Err(err.into())
            }
        }
    }

    /// Remove this server's registration. An absent registration is not an
    /// error.
    pub async fn deregister(&self) -> DiscoveryResult<()> {
        let inner = &self.inner;
        let paths = &inner.paths;
        let ops = vec![
            Op::delete(&paths.connections),
            Op::delete(&paths.queued),
            Op::delete(&paths.node),
        ];
        match inner.coordinator.multi(ops).await {
            Ok(()) => {
                info!(host = %inner.host, "server deregistered");
                Ok(())
            }
            Err(CoordinationError::NotFound(path)) => {
                debug!(host = %inner.host, path, "server was not registered");
                Ok(())
            }
            Err(err) => {
                warn!(host = %inner.host, error = %err, "failed to deregister server");
                Err(err.into())
            }
        }
    }

    /// Mirror every registered server into the cache and keep it current.
    ///
    /// Replaces any previous root subscription, so it is also the resync
    /// entry point after a reconnect.
    pub async fn watch_all_servers(&self) -> DiscoveryResult<()> {
        let inner = &self.inner;
        let handler = Arc::new(ServerWatch {
            target: Target::Root,
            registry: Arc::downgrade(inner),
        });
        let sub = PermanentWatch::start(
            Arc::clone(&inner.coordinator),
            SERVERS_ROOT,
            WatchKind::Children,
            handler,
        )
        .await?;
        let previous = inner.root.lock().replace(sub);
        drop(previous);

        inner.sync_members().await?;
        debug!(servers = inner.cache.servers().len(), "server cache synced");
        Ok(())
    }

    /// Cancel every server watch and clear the server cache.
    pub fn stop_watching(&self) {
        let inner = &self.inner;
        let root = inner.root.lock().take();
        drop(root);
        drop(inner.members.clear());
        inner.cache.clear_servers();
    }
}

impl Inner {
    /// Reconcile tracked hosts with the root's current children.
    async fn sync_members(self: &Arc<Self>) -> CoordinationResult<()> {
        let live: BTreeSet<String> = self
            .coordinator
            .children(SERVERS_ROOT)
            .await?
            .into_iter()
            .collect();

        for host in self.members.names() {
            if !live.contains(&host) {
                self.forget(&host);
            }
        }
        let added = live.into_iter().filter(|host| !self.members.contains(host));
        let results = futures::future::join_all(added.map(|host| self.track(host))).await;
        results.into_iter().collect()
    }

    async fn track(self: &Arc<Self>, host: String) -> CoordinationResult<()> {
        let Some(generation) = self.members.claim(&host) else {
            return Ok(());
        };
        let paths = match ServerPaths::new(&host) {
            Ok(paths) => paths,
            Err(err) => {
                self.members.release(&host);
                warn!(host, error = %err, "ignoring server with invalid host name");
                return Ok(());
            }
        };
        let joined = self.members.if_current(&host, generation, || {
            self.cache.insert_server(ServerRecord::new(&host))
        });
        match joined {
            Some(true) => info!(host, "server joined"),
            Some(false) => {}
            None => return Ok(()),
        }

        let subscriptions = match self.subscribe(&host, &paths).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                if self.members.is_current(&host, generation) {
                    self.forget(&host);
                }
                return Err(err);
            }
        };
        if let Err(late) = self.members.attach(&host, generation, subscriptions) {
            drop(late);
            if !self.members.contains(&host) {
                self.cache.remove_server(&host);
            }
            return Ok(());
        }

        for &counter in ALL_COUNTERS {
            match self.load_counter(&host, counter).await {
                Ok(()) => {}
                Err(CoordinationError::NotFound(_)) => {
                    if self.members.is_current(&host, generation) {
                        self.forget(&host);
                    }
                    return Ok(());
                }
                Err(err) => {
                    error!(host, %counter, error = %err, "failed to load server counter");
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        self: &Arc<Self>,
        host: &str,
        paths: &ServerPaths,
    ) -> CoordinationResult<Vec<Subscription>> {
        let mut subscriptions = Vec::with_capacity(1 + ALL_COUNTERS.len());
        subscriptions.push(
            self.start_watch(&paths.node, Target::Host(host.to_owned()))
                .await?,
        );
        for &counter in ALL_COUNTERS {
            subscriptions.push(
                self.start_watch(
                    paths.counter(counter),
                    Target::Counter(host.to_owned(), counter),
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
        let handler = Arc::new(ServerWatch {
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

    async fn load_counter(&self, host: &str, counter: Counter) -> CoordinationResult<()> {
        let paths = ServerPaths::new(host)?;
        let path = paths.counter(counter);
        let data = self.coordinator.read(path).await?;
        let value = codec::decode_counter(path, &data)?;
        if self
            .cache
            .update_server(host, |record| record.with_counter(counter, value))
        {
            trace!(host, %counter, value, "server counter cached");
        }
        Ok(())
    }

    fn forget(&self, host: &str) {
        let subscriptions = self.members.release(host);
        drop(subscriptions);
        if self.cache.remove_server(host).is_some() {
            info!(host, "server left");
        }
    }

    fn forget_all(&self) {
        drop(self.members.clear());
        self.cache.clear_servers();
    }
}

#[derive(Debug, Clone)]
enum Target {
    Root,
    Host(String),
    Counter(String, Counter),
}

struct ServerWatch {
    target: Target,
    registry: Weak<Inner>,
}

impl ServerWatch {
    async fn handle(&self, kind: EventKind) -> CoordinationResult<()> {
        metrics::record_watch_event(kind);
        let Some(inner) = self.registry.upgrade() else {
            return Ok(());
        };
        match (&self.target, kind) {
            (Target::Root, EventKind::ChildrenChanged) => inner.sync_members().await,
            (Target::Root, EventKind::Deleted) => {
                warn!(root = SERVERS_ROOT, "servers root deleted");
                inner.forget_all();
                Ok(())
            }
            (Target::Host(host), EventKind::Deleted) => {
                inner.forget(host);
                Ok(())
            }
            (Target::Counter(host, counter), EventKind::Created | EventKind::DataChanged) => {
                match inner.load_counter(host, *counter).await {
                    Err(CoordinationError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl WatchHandler for ServerWatch {
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
