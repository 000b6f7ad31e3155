//! Per-process registry.
//!
//! [`Registry`] owns the coordination session, the local cache, both
//! registries and the selector. [`Registry::open`] prepares the tree,
//! registers this server and starts the watches; a monitor task then follows
//! the session:
//!
//! - `Disconnected`: caches are cleared and watches cancelled
//!   ([`RegistryState::Resyncing`]).
//! - `Connected` after a disconnect: registration and watches are restored,
//!   retried with backoff for as long as the session stays connected.
//! - `Expired`: caches are cleared and the registry is [`RegistryState::Expired`];
//!   a new session and registry are required.
//! - `Closed`: the registry is [`RegistryState::Closed`].

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use coordination::{ConnectPolicy, CoordinationError, Coordinator, SessionState, paths::ROOTS};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

use crate::{
    cache::LocalCache,
    channel::ChannelRegistry,
    error::{DiscoveryError, DiscoveryResult},
    metrics,
    models::{LoadUpdate, ServerDescriptor},
    selector::DiscoverySelector,
    server::ServerRegistry,
};

/// Delay before the first resync retry.
const RESYNC_BASE_DELAY: Duration = Duration::from_millis(100);
/// Upper bound for the resync retry delay.
const RESYNC_MAX_DELAY: Duration = Duration::from_secs(5);

/// Options for [`Registry::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Host this process registers as.
    pub host: String,
    /// Load at or above which a channel's owner is reported busy.
    pub load_ceiling: u64,
}

/// Lifecycle of a [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryState {
    Opening,
    Active,
    /// Session lost; caches are empty until it reconnects.
    Resyncing,
    Expired,
    Closed,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryState::Opening => write!(f, "opening"),
            RegistryState::Active => write!(f, "active"),
            RegistryState::Resyncing => write!(f, "resyncing"),
            RegistryState::Expired => write!(f, "expired"),
            RegistryState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    coordinator: Arc<dyn Coordinator>,
    cache: Arc<LocalCache>,
    servers: ServerRegistry,
    channels: ChannelRegistry,
    selector: DiscoverySelector,
    state: watch::Sender<RegistryState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    resync_policy: ConnectPolicy,
}

impl Registry {
    /// Open the registry on an established session.
    ///
    /// Creates the persistent roots if missing, registers this host and
    /// syncs both caches before returning. A host that is already
    /// registered is logged and kept.
    pub async fn open(
        coordinator: Arc<dyn Coordinator>,
        options: RegistryOptions,
    ) -> DiscoveryResult<Arc<Self>> {
        coordinator.state().check()?;
        // subscribe before any work so no transition is missed
        let events = coordinator.session_events();

        let cache = Arc::new(LocalCache::new());
        let servers = ServerRegistry::new(
            Arc::clone(&coordinator),
            Arc::clone(&cache),
            options.host.clone(),
        )?;
        let channels = ChannelRegistry::new(
            Arc::clone(&coordinator),
            Arc::clone(&cache),
            options.host.clone(),
        );
        let selector =
            DiscoverySelector::new(Arc::clone(&cache), channels.clone(), options.load_ceiling);

        let registry = Arc::new(Self {
            coordinator,
            cache,
            servers,
            channels,
            selector,
            state: watch::Sender::new(RegistryState::Opening),
            monitor: Mutex::new(None),
            resync_policy: ConnectPolicy {
                base_delay: RESYNC_BASE_DELAY,
                max_delay: RESYNC_MAX_DELAY,
                ..ConnectPolicy::default()
            },
        });

        for root in ROOTS {
            registry.coordinator.ensure_path(root).await?;
        }
        registry.start().await?;

        let span = tracing::info_span!("session_monitor", host = %options.host);
        let monitor = tokio::spawn(monitor(Arc::downgrade(&registry), events).instrument(span));
        *registry.monitor.lock() = Some(monitor);

        metrics::SESSION_CONNECTED.set(1);
        registry.set_state(RegistryState::Active);
        info!(
            host = %options.host,
            load_ceiling = registry.selector.load_ceiling(),
            "registry open"
        );
        Ok(registry)
    }

    /// Register this host and start both watches.
    async fn start(&self) -> DiscoveryResult<()> {
        match self.servers.register_self().await {
            Ok(()) | Err(DiscoveryError::AlreadyRegistered(_)) => {}
            Err(err) => return Err(err),
        }
        self.servers.watch_all_servers().await?;
        self.channels.watch_all_channels().await?;
        Ok(())
    }

    fn stop_watching(&self) {
        self.servers.stop_watching();
        self.channels.stop_watching();
    }

    fn set_state(&self, state: RegistryState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "registry state changed");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegistryState {
        *self.state.borrow()
    }

    /// Follow lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RegistryState> {
        self.state.subscribe()
    }

    /// Host this process is registered as.
    pub fn host(&self) -> &str {
        self.servers.host()
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn selector(&self) -> &DiscoverySelector {
        &self.selector
    }

    fn ensure_usable(&self) -> DiscoveryResult<()> {
        match self.state() {
            RegistryState::Expired => Err(DiscoveryError::Expired),
            RegistryState::Closed => Err(CoordinationError::SessionClosed.into()),
            _ => Ok(()),
        }
    }

    /// Server that should host a new channel.
    pub fn get_server_for_new_channel(&self) -> DiscoveryResult<ServerDescriptor> {
        self.ensure_usable()?;
        let server = self.selector.pick_server_for_new_channel()?;
        Ok(ServerDescriptor::from(server.as_ref()))
    }

    /// Server hosting `channel_id`, see
    /// [`DiscoverySelector::resolve_server_for_channel`].
    pub async fn get_server_for_channel(
        &self,
        channel_id: &str,
    ) -> DiscoveryResult<ServerDescriptor> {
        self.ensure_usable()?;
        let server = self.selector.resolve_server_for_channel(channel_id).await?;
        Ok(ServerDescriptor::from(server.as_ref()))
    }

    /// Publish this server's load.
    pub async fn update_load(&self, load: LoadUpdate) -> DiscoveryResult<()> {
        self.ensure_usable()?;
        self.servers
            .update_load(load.connections, load.queued)
            .await
    }

    /// Create a channel owned by this server.
    pub async fn create_channel(&self, channel_id: &str) -> DiscoveryResult<()> {
        self.ensure_usable()?;
        self.channels
            .create_channel(channel_id, self.servers.host())
            .await
    }

    /// Publish the load of a channel owned by this server.
    pub async fn update_channel(&self, channel_id: &str, load: LoadUpdate) -> DiscoveryResult<()> {
        self.ensure_usable()?;
        self.channels
            .update_channel(channel_id, load.connections, load.queued)
            .await
    }

    pub async fn remove_channel(&self, channel_id: &str) -> DiscoveryResult<()> {
        self.ensure_usable()?;
        self.channels.remove_channel(channel_id).await
    }

    /// Deregister, stop every watch and close the session.
    pub async fn close(&self) -> DiscoveryResult<()> {
        if matches!(
            self.state(),
            RegistryState::Closed | RegistryState::Expired
        ) {
            return Ok(());
        }
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.stop_watching();
        if let Err(err) = self.servers.deregister().await {
            warn!(error = %err, "deregister on close failed");
        }
        let closed = match self.coordinator.close().await {
            Ok(()) | Err(CoordinationError::SessionClosed) => Ok(()),
            Err(err) => Err(err.into()),
        };
        metrics::SESSION_CONNECTED.set(0);
        self.set_state(RegistryState::Closed);
        info!(host = %self.host(), "registry closed");
        closed
    }

    /// Apply a session transition. Returns false once the session is over.
    async fn on_session_state(&self, session: SessionState) -> bool {
        match session {
            SessionState::Disconnected => {
                warn!(host = %self.host(), "coordination session disconnected, clearing caches");
                metrics::SESSION_CONNECTED.set(0);
                self.stop_watching();
                self.set_state(RegistryState::Resyncing);
                true
            }
            SessionState::Connected => {
                metrics::SESSION_CONNECTED.set(1);
                if self.state() != RegistryState::Resyncing {
                    return true;
                }
                info!(host = %self.host(), "coordination session reconnected, resyncing");
                self.resync().await;
                true
            }
            SessionState::Expired => {
                error!(host = %self.host(), "coordination session expired");
                metrics::SESSION_CONNECTED.set(0);
                self.stop_watching();
                self.set_state(RegistryState::Expired);
                false
            }
            SessionState::Closed => {
                metrics::SESSION_CONNECTED.set(0);
                self.stop_watching();
                self.set_state(RegistryState::Closed);
                false
            }
        }
    }

    /// Restore registration and watches after a reconnect.
    ///
    /// Failed attempts are retried with backoff while the registry is
    /// `Resyncing` and the session is connected. Any other session
    /// transition arrives through the monitor once this returns.
    async fn resync(&self) {
        let mut retry = 0u32;
        loop {
            match self.start().await {
                Ok(()) => {
                    metrics::RESYNC_COUNT.inc();
                    self.set_state(RegistryState::Active);
                    info!(
                        servers = self.cache.servers().len(),
                        channels = self.cache.channels().len(),
                        "caches resynced"
                    );
                    return;
                }
                Err(err) => {
                    self.stop_watching();
                    let delay = self.resync_policy.retry_delay(retry);
                    error!(
                        error = %err,
                        attempt = retry + 1,
                        retry_in_ms = delay.as_millis(),
                        "resync failed"
                    );
                    tokio::time::sleep(delay).await;
                    if self.state() != RegistryState::Resyncing
                        || self.coordinator.state() != SessionState::Connected
                    {
                        debug!(state = %self.state(), "resync abandoned");
                        return;
                    }
                    retry = retry.saturating_add(1);
                }
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

async fn monitor(registry: Weak<Registry>, mut events: broadcast::Receiver<SessionState>) {
    loop {
        let event = events.recv().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        let session = match event {
            Ok(session) => session,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed session events, using current state");
                registry.coordinator.state()
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !registry.on_session_state(session).await {
            break;
        }
    }
    debug!("session monitor stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use coordination::{MemoryCoordinator, MemoryTree};
    use tracing_test::traced_test;

    use super::*;

    fn options(host: &str) -> RegistryOptions {
        RegistryOptions {
            host: host.into(),
            load_ceiling: 100,
        }
    }

    async fn open(tree: &MemoryTree, host: &str) -> (Arc<MemoryCoordinator>, Arc<Registry>) {
        let session = Arc::new(tree.open_session().unwrap());
        let registry = Registry::open(session.clone(), options(host)).await.unwrap();
        (session, registry)
    }

    async fn wait_for(registry: &Registry, state: RegistryState) {
        let mut rx = registry.subscribe_state();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_registers_and_syncs() {
        let tree = MemoryTree::new();
        let (_session, registry) = open(&tree, "a:1").await;
        assert_eq!(registry.state(), RegistryState::Active);
        assert!(tree.contains("/Channels"));
        assert_eq!(registry.cache().server_hosts(), vec!["a:1"]);
        assert_eq!(
            registry.get_server_for_new_channel().unwrap().host,
            "a:1"
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_on_dead_session() {
        let tree = MemoryTree::new();
        let session = tree.open_session().unwrap();
        session.expire();
        let result = Registry::open(Arc::new(session), options("a:1")).await;
        assert_eq!(result.unwrap_err(), DiscoveryError::Expired);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_disconnect_clears_and_reconnect_resyncs() {
        let tree = MemoryTree::new();
        let (session, registry) = open(&tree, "a:1").await;
        registry.create_channel("c1").await.unwrap();

        session.disconnect();
        wait_for(&registry, RegistryState::Resyncing).await;
        assert!(registry.cache().servers().is_empty());
        assert!(registry.cache().channels().is_empty());
        assert_eq!(
            registry.get_server_for_new_channel(),
            Err(DiscoveryError::NoServersAvailable)
        );

        session.reconnect();
        wait_for(&registry, RegistryState::Active).await;
        assert_eq!(registry.cache().server_hosts(), vec!["a:1"]);
        assert_eq!(registry.cache().channel("c1").unwrap().owner, "a:1");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_resync_retries_after_failure() {
        let tree = MemoryTree::new();
        let (session, registry) = open(&tree, "a:1").await;

        session.disconnect();
        wait_for(&registry, RegistryState::Resyncing).await;
        tree.fail_next_multi_at(0);
        session.reconnect();

        wait_for(&registry, RegistryState::Active).await;
        assert_eq!(registry.cache().server_hosts(), vec!["a:1"]);
        assert!(logs_contain("resync failed"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expire_marks_registry() {
        let tree = MemoryTree::new();
        let (session, registry) = open(&tree, "a:1").await;
        session.expire();
        wait_for(&registry, RegistryState::Expired).await;
        assert!(registry.cache().servers().is_empty());
        assert_eq!(
            registry.get_server_for_channel("c1").await,
            Err(DiscoveryError::Expired)
        );
        assert!(!tree.contains("/AvailableServers/a:1"));
        assert!(logs_contain("coordination session expired"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_deregisters() {
        let tree = MemoryTree::new();
        let (_session, registry) = open(&tree, "a:1").await;
        registry.close().await.unwrap();
        assert_eq!(registry.state(), RegistryState::Closed);
        assert!(!tree.contains("/AvailableServers/a:1"));
        assert!(tree.contains("/AvailableServers"));
        // closing twice is fine
        registry.close().await.unwrap();
        assert!(registry.create_channel("c1").await.is_err());
    }
}
