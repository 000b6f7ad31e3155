//! In-process coordination tree.
//!
//! [`MemoryTree`] plays the part of the coordination service: a consistent
//! key tree shared by any number of sessions, each a [`MemoryCoordinator`].
//! It implements ephemeral ownership, all-or-nothing transactions and
//! one-shot watches, and exposes hooks to simulate disconnects, session
//! expiry, unreachable service and mid-transaction failures.
//!
//! Unlike ZooKeeper, ephemeral nodes may have children.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

use crate::client::{
    ConnectPolicy, Coordinator, CreateMode, EventKind, NodeEvent, Op, SessionState, WatchKind,
    Watcher, connect_with_retry,
};
use crate::error::{CoordinationError, CoordinationResult};
use crate::paths;

/// Capacity of each session's state broadcast channel.
const SESSION_EVENT_CAPACITY: usize = 16;

type SessionId = u64;

#[derive(Debug, Clone)]
struct MemoryNode {
    data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct PendingWatch {
    session: SessionId,
    path: String,
    kind: WatchKind,
    tx: oneshot::Sender<NodeEvent>,
}

#[derive(Debug)]
struct SessionEntry {
    state: SessionState,
    events: broadcast::Sender<SessionState>,
}

#[derive(Debug)]
struct TreeInner {
    nodes: BTreeMap<String, MemoryNode>,
    sessions: HashMap<SessionId, SessionEntry>,
    watches: Vec<PendingWatch>,
    next_session: SessionId,
    reachable: bool,
    fail_multi_at: Option<usize>,
}

impl Default for TreeInner {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            sessions: HashMap::new(),
            watches: Vec::new(),
            next_session: 1,
            reachable: true,
            fail_multi_at: None,
        }
    }
}

/// Shared in-process coordination service.
#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    inner: Arc<Mutex<TreeInner>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session, retrying per `policy` while the tree is unreachable.
    pub async fn connect(&self, policy: &ConnectPolicy) -> CoordinationResult<MemoryCoordinator> {
        connect_with_retry("memory", policy, || async move { self.open_session() }).await
    }

    /// Open a session immediately, failing if the tree is unreachable.
    pub fn open_session(&self) -> CoordinationResult<MemoryCoordinator> {
        let mut inner = self.inner.lock();
        if !inner.reachable {
            return Err(CoordinationError::ConnectionLoss(
                "coordination service unreachable".into(),
            ));
        }
        let id = inner.next_session;
        inner.next_session += 1;
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        inner.sessions.insert(
            id,
            SessionEntry {
                state: SessionState::Connected,
                events: events.clone(),
            },
        );
        debug!(session = id, "memory session opened");
        Ok(MemoryCoordinator {
            tree: self.clone(),
            session: id,
            events,
        })
    }

    /// Make new sessions fail to connect.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Make the next transaction fail at op `index`, leaving nothing applied.
    pub fn fail_next_multi_at(&self, index: usize) {
        self.inner.lock().fail_multi_at = Some(index);
    }

    /// Whether a node exists, regardless of session state.
    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().nodes.contains_key(path)
    }

    /// All node paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.inner.lock().nodes.keys().cloned().collect()
    }
}

/// One session on a [`MemoryTree`].
#[derive(Debug)]
pub struct MemoryCoordinator {
    tree: MemoryTree,
    session: SessionId,
    events: broadcast::Sender<SessionState>,
}

impl MemoryCoordinator {
    /// Identifier of this session within its tree.
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Simulate a transient disconnect. The session and its ephemeral nodes
    /// survive; pending watches are dropped.
    pub fn disconnect(&self) {
        self.transition(SessionState::Disconnected, false);
    }

    /// Recover from [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        let state = self.state();
        if state == SessionState::Disconnected {
            self.transition(SessionState::Connected, false);
        } else {
            warn!(session = self.session, %state, "reconnect ignored");
        }
    }

    /// Simulate the service expiring this session: its ephemeral nodes are
    /// removed and every further call fails with `SessionExpired`.
    pub fn expire(&self) {
        self.transition(SessionState::Expired, true);
    }

    fn transition(&self, next: SessionState, end_session: bool) {
        let mut inner = self.tree.inner.lock();
        let Some(entry) = inner.sessions.get_mut(&self.session) else {
            return;
        };
        if matches!(entry.state, SessionState::Expired | SessionState::Closed) {
            return;
        }
        entry.state = next;
        let events = entry.events.clone();

        if next != SessionState::Connected {
            let session = self.session;
            inner.watches.retain(|w| w.session != session);
        }
        if end_session {
            let removed = remove_session_nodes(&mut inner, self.session);
            info!(session = self.session, removed, state = %next, "memory session ended");
        } else {
            debug!(session = self.session, state = %next, "memory session state changed");
        }
        drop(inner);
        // no receivers is not an error
        let _ = events.send(next);
    }

    fn with_live<T>(
        &self,
        f: impl FnOnce(&mut TreeInner) -> CoordinationResult<T>,
    ) -> CoordinationResult<T> {
        let mut inner = self.tree.inner.lock();
        let state = inner
            .sessions
            .get(&self.session)
            .map(|s| s.state)
            .unwrap_or(SessionState::Closed);
        state.check()?;
        f(&mut inner)
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn state(&self) -> SessionState {
        self.tree
            .inner
            .lock()
            .sessions
            .get(&self.session)
            .map(|s| s.state)
            .unwrap_or(SessionState::Closed)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionState> {
        self.events.subscribe()
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<()> {
        self.multi(vec![Op::create(path, data.to_vec(), mode)]).await
    }

    async fn read(&self, path: &str) -> CoordinationResult<Vec<u8>> {
        paths::validate_path(path)?;
        self.with_live(|inner| {
            inner
                .nodes
                .get(path)
                .map(|node| node.data.clone())
                .ok_or_else(|| CoordinationError::NotFound(path.to_owned()))
        })
    }

    async fn write(&self, path: &str, data: &[u8]) -> CoordinationResult<()> {
        self.multi(vec![Op::set_data(path, data.to_vec())]).await
    }

    async fn delete(&self, path: &str) -> CoordinationResult<()> {
        self.multi(vec![Op::delete(path)]).await
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        paths::validate_path(path)?;
        self.with_live(|inner| Ok(inner.nodes.contains_key(path)))
    }

    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        if path != "/" {
            paths::validate_path(path)?;
        }
        self.with_live(|inner| {
            if path != "/" && !inner.nodes.contains_key(path) {
                return Err(CoordinationError::NotFound(path.to_owned()));
            }
            Ok(direct_children(&inner.nodes, path))
        })
    }

    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()> {
        for op in &ops {
            paths::validate_path(op.path())?;
        }
        let session = self.session;
        self.with_live(|inner| {
            let fail_at = inner.fail_multi_at.take();
            let mut staged = inner.nodes.clone();
            let mut fired = Vec::new();
            for (index, op) in ops.iter().enumerate() {
                if fail_at == Some(index) {
                    warn!(session, index, path = op.path(), "injected transaction failure");
                    return Err(CoordinationError::Transport(format!(
                        "injected failure at op {index} ({})",
                        op.path()
                    )));
                }
                apply(&mut staged, session, op, &mut fired)?;
            }
            inner.nodes = staged;
            trace!(session, ops = ops.len(), "transaction committed");
            for event in fired {
                fire(&mut inner.watches, event);
            }
            Ok(())
        })
    }

    async fn watch(&self, path: &str, kind: WatchKind) -> CoordinationResult<Watcher> {
        if path != "/" {
            paths::validate_path(path)?;
        }
        let session = self.session;
        self.with_live(|inner| {
            if kind == WatchKind::Children && path != "/" && !inner.nodes.contains_key(path) {
                return Err(CoordinationError::NotFound(path.to_owned()));
            }
            let (tx, rx) = oneshot::channel();
            inner.watches.push(PendingWatch {
                session,
                path: path.to_owned(),
                kind,
                tx,
            });
            Ok(Watcher::new(path, rx))
        })
    }

    async fn close(&self) -> CoordinationResult<()> {
        self.state().check()?;
        self.transition(SessionState::Closed, true);
        Ok(())
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        let live = !matches!(self.state(), SessionState::Expired | SessionState::Closed);
        if live {
            self.transition(SessionState::Closed, true);
        }
        self.tree.inner.lock().sessions.remove(&self.session);
    }
}

fn direct_children(nodes: &BTreeMap<String, MemoryNode>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_owned()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(key, _)| key.starts_with(&prefix))
        .filter_map(|(key, _)| {
            let rest = &key[prefix.len()..];
            (!rest.contains('/')).then(|| rest.to_owned())
        })
        .collect()
}

fn has_children(nodes: &BTreeMap<String, MemoryNode>, path: &str) -> bool {
    let prefix = format!("{path}/");
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

fn apply(
    nodes: &mut BTreeMap<String, MemoryNode>,
    session: SessionId,
    op: &Op,
    fired: &mut Vec<NodeEvent>,
) -> CoordinationResult<()> {
    match op {
        Op::Create { path, data, mode } => {
            if nodes.contains_key(path) {
                return Err(CoordinationError::NodeExists(path.clone()));
            }
            let parent = paths::parent(path).unwrap_or("/");
            if parent != "/" && !nodes.contains_key(parent) {
                return Err(CoordinationError::NotFound(parent.to_owned()));
            }
            nodes.insert(
                path.clone(),
                MemoryNode {
                    data: data.clone(),
                    owner: (*mode == CreateMode::Ephemeral).then_some(session),
                },
            );
            fired.push(event(EventKind::Created, path));
            fired.push(event(EventKind::ChildrenChanged, parent));
        }
        Op::SetData { path, data } => {
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| CoordinationError::NotFound(path.clone()))?;
            node.data = data.clone();
            fired.push(event(EventKind::DataChanged, path));
        }
        Op::Delete { path } => {
            if !nodes.contains_key(path) {
                return Err(CoordinationError::NotFound(path.clone()));
            }
            if has_children(nodes, path) {
                return Err(CoordinationError::NotEmpty(path.clone()));
            }
            nodes.remove(path);
            fired.push(event(EventKind::Deleted, path));
            fired.push(event(
                EventKind::ChildrenChanged,
                paths::parent(path).unwrap_or("/"),
            ));
        }
        Op::Check { path, data } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| CoordinationError::NotFound(path.clone()))?;
            if node.data != *data {
                return Err(CoordinationError::CheckFailed(path.clone()));
            }
        }
    }
    Ok(())
}

/// Remove every node owned by `session`, deepest first, together with any
/// descendants, and fire the matching watches.
fn remove_session_nodes(inner: &mut TreeInner, session: SessionId) -> usize {
    let mut owned: Vec<String> = inner
        .nodes
        .iter()
        .filter(|(_, node)| node.owner == Some(session))
        .map(|(path, _)| path.clone())
        .collect();
    owned.sort_by_key(|path| std::cmp::Reverse(path.matches('/').count()));

    let mut fired = Vec::new();
    let mut removed = 0;
    for path in owned {
        let prefix = format!("{path}/");
        let mut doomed: Vec<String> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        doomed.push(path);
        for victim in doomed {
            if inner.nodes.remove(&victim).is_some() {
                removed += 1;
                fired.push(event(EventKind::Deleted, &victim));
                fired.push(event(
                    EventKind::ChildrenChanged,
                    paths::parent(&victim).unwrap_or("/"),
                ));
            }
        }
    }
    for event in fired {
        fire(&mut inner.watches, event);
    }
    removed
}

fn event(kind: EventKind, path: &str) -> NodeEvent {
    NodeEvent {
        kind,
        path: path.to_owned(),
    }
}

/// Deliver `event` to every pending watch it triggers; those watches are
/// consumed.
fn fire(watches: &mut Vec<PendingWatch>, event: NodeEvent) {
    let (hit, kept): (Vec<_>, Vec<_>) = std::mem::take(watches)
        .into_iter()
        .partition(|w| w.path == event.path && event.kind.triggers(w.kind));
    *watches = kept;
    for watch in hit {
        // receiver gone means the subscriber stopped caring
        let _ = watch.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    async fn test_create_read_write_delete() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.create("/a", b"1", CreateMode::Persistent).await?;
        assert_eq!(s.read("/a").await?, b"1");
        s.write("/a", b"2").await?;
        assert_eq!(s.read("/a").await?, b"2");
        assert!(s.exists("/a").await?);
        s.delete("/a").await?;
        assert!(!s.exists("/a").await?);
        assert!(matches!(
            s.read("/a").await,
            Err(CoordinationError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_errors() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        assert!(matches!(
            s.create("/missing/child", b"", CreateMode::Persistent).await,
            Err(CoordinationError::NotFound(p)) if p == "/missing"
        ));
        s.create("/a", b"", CreateMode::Persistent).await?;
        assert!(matches!(
            s.create("/a", b"", CreateMode::Persistent).await,
            Err(CoordinationError::NodeExists(_))
        ));
        s.create("/a/b", b"", CreateMode::Persistent).await?;
        assert!(matches!(
            s.delete("/a").await,
            Err(CoordinationError::NotEmpty(_))
        ));
        assert!(matches!(
            s.create("relative", b"", CreateMode::Persistent).await,
            Err(CoordinationError::InvalidName(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.ensure_path("/Channels").await?;
        s.ensure_path("/Channels").await?;
        assert!(tree.contains("/Channels"));
        Ok(())
    }

    #[tokio::test]
    async fn test_children_sorted_and_direct() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.ensure_path("/r").await?;
        for name in ["b", "a", "c"] {
            s.create(&format!("/r/{name}"), b"", CreateMode::Persistent)
                .await?;
        }
        s.create("/r/a/deep", b"", CreateMode::Persistent).await?;
        s.ensure_path("/r2").await?;
        assert_eq!(s.children("/r").await?, vec!["a", "b", "c"]);
        assert_eq!(s.children("/").await?, vec!["r", "r2"]);
        assert!(s.children("/nope").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_multi_is_atomic() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.ensure_path("/r").await?;
        s.create("/r/taken", b"", CreateMode::Persistent).await?;

        let result = s
            .multi(vec![
                Op::create("/r/x", b"".to_vec(), CreateMode::Ephemeral),
                Op::create("/r/x/child", b"".to_vec(), CreateMode::Ephemeral),
                Op::create("/r/taken", b"".to_vec(), CreateMode::Ephemeral),
            ])
            .await;
        assert!(matches!(result, Err(CoordinationError::NodeExists(p)) if p == "/r/taken"));
        assert!(!tree.contains("/r/x"));
        assert!(!tree.contains("/r/x/child"));
        Ok(())
    }

    #[tokio::test]
    async fn test_check_guards_transaction() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.create("/owned", b"a:1", CreateMode::Persistent).await?;
        s.create("/count", b"0", CreateMode::Persistent).await?;

        s.multi(vec![
            Op::check("/owned", b"a:1".to_vec()),
            Op::set_data("/count", b"1".to_vec()),
        ])
        .await?;
        assert_eq!(s.read("/count").await?, b"1");

        let result = s
            .multi(vec![
                Op::check("/owned", b"b:1".to_vec()),
                Op::set_data("/count", b"2".to_vec()),
            ])
            .await;
        assert_eq!(result, Err(CoordinationError::CheckFailed("/owned".into())));
        assert_eq!(s.read("/count").await?, b"1");

        let result = s.multi(vec![Op::check("/gone", b"".to_vec())]).await;
        assert!(matches!(result, Err(CoordinationError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failure() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.ensure_path("/r").await?;
        tree.fail_next_multi_at(1);
        let result = s
            .multi(vec![
                Op::create("/r/x", b"".to_vec(), CreateMode::Ephemeral),
                Op::create("/r/x/a", b"0".to_vec(), CreateMode::Ephemeral),
            ])
            .await;
        assert!(matches!(result, Err(CoordinationError::Transport(_))));
        assert!(!tree.contains("/r/x"));

        // the hook only applies once
        s.create("/r/y", b"", CreateMode::Ephemeral).await?;
        assert!(tree.contains("/r/y"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expire_removes_ephemeral_nodes() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let owner = tree.open_session()?;
        let other = tree.open_session()?;
        owner.ensure_path("/r").await?;
        owner.create("/r/e", b"", CreateMode::Ephemeral).await?;
        owner.create("/r/e/c", b"", CreateMode::Ephemeral).await?;
        other.create("/r/o", b"", CreateMode::Ephemeral).await?;

        let mut events = owner.session_events();
        let gone = other.watch("/r/e", WatchKind::Node).await?;
        let parent = other.watch("/r", WatchKind::Children).await?;

        owner.expire();
        assert_eq!(events.recv().await.unwrap(), SessionState::Expired);
        assert_eq!(gone.changed().await?.kind, EventKind::Deleted);
        assert_eq!(parent.changed().await?.kind, EventKind::ChildrenChanged);

        assert_eq!(tree.paths(), vec!["/r", "/r/o"]);
        assert_eq!(owner.read("/r").await, Err(CoordinationError::SessionExpired));
        assert!(other.exists("/r/o").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_keeps_nodes() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        s.create("/e", b"", CreateMode::Ephemeral).await?;
        let pending = s.watch("/e", WatchKind::Node).await?;
        let mut events = s.session_events();

        s.disconnect();
        assert_eq!(events.recv().await.unwrap(), SessionState::Disconnected);
        assert!(matches!(
            s.read("/e").await,
            Err(CoordinationError::ConnectionLoss(_))
        ));
        assert!(pending.changed().await.is_err());
        assert!(tree.contains("/e"));

        s.reconnect();
        assert_eq!(events.recv().await.unwrap(), SessionState::Connected);
        assert!(s.exists("/e").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_and_drop_end_session() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let a = tree.open_session()?;
        a.create("/a", b"", CreateMode::Ephemeral).await?;
        a.close().await?;
        assert!(!tree.contains("/a"));
        assert_eq!(a.close().await, Err(CoordinationError::SessionClosed));

        let b = tree.open_session()?;
        b.create("/b", b"", CreateMode::Ephemeral).await?;
        drop(b);
        assert!(!tree.contains("/b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_fires_once() -> CoordinationResult<()> {
        let tree = MemoryTree::new();
        let s = tree.open_session()?;
        let w = s.watch("/n", WatchKind::Node).await?;
        s.create("/n", b"1", CreateMode::Persistent).await?;
        s.write("/n", b"2").await?;
        let event = w.changed().await?;
        assert_eq!(event.kind, EventKind::Created);
        assert_eq!(event.path, "/n");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_connect_unreachable_is_fatal() {
        let tree = MemoryTree::new();
        tree.set_reachable(false);
        let policy = ConnectPolicy {
            timeout: Duration::from_millis(50),
            retry_max: 1,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
        };
        let err = tree.connect(&policy).await.unwrap_err();
        assert!(matches!(err, CoordinationError::ConnectionFatal(_)));

        tree.set_reachable(true);
        assert!(tree.connect(&policy).await.is_ok());
    }
}
