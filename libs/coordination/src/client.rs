//! Session abstraction over the coordination service.
//!
//! [`Coordinator`] is the seam every registry talks through: one shared
//! session per process, non-blocking request/response calls, one-shot
//! watches and a stream of session state transitions. Backends implement it;
//! [`connect_with_retry`] gives them a common bootstrap with backoff.

use std::{fmt, future::Future, time::Duration};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tracing::{error, info, warn};

use crate::error::{CoordinationError, CoordinationResult};

/// Default per-attempt connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay for retrying initial connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed by the service when the creating session ends.
    Ephemeral,
}

/// One operation inside a [`Coordinator::multi`] transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    SetData {
        path: String,
        data: Vec<u8>,
    },
    Delete {
        path: String,
    },
    /// Fails the transaction unless the node exists and holds `data`.
    Check {
        path: String,
        data: Vec<u8>,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, data: impl Into<Vec<u8>>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    pub fn set_data(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::SetData {
            path: path.into(),
            data: data.into(),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Op::Delete { path: path.into() }
    }

    pub fn check(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Op::Check {
            path: path.into(),
            data: data.into(),
        }
    }

    /// Path this operation targets.
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::SetData { path, .. }
            | Op::Delete { path }
            | Op::Check { path, .. } => path,
        }
    }
}

/// What a one-shot watch observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Creation, data change or deletion of the node itself. May be set on
    /// an absent node.
    Node,
    /// Addition or removal of direct children, or deletion of the node.
    Children,
}

/// Kind of change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    DataChanged,
    ChildrenChanged,
    Deleted,
}

impl EventKind {
    /// Whether a watch of `kind` is triggered by this event.
    pub fn triggers(&self, kind: WatchKind) -> bool {
        match kind {
            WatchKind::Node => matches!(
                self,
                EventKind::Created | EventKind::DataChanged | EventKind::Deleted
            ),
            WatchKind::Children => {
                matches!(self, EventKind::ChildrenChanged | EventKind::Deleted)
            }
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::DataChanged => write!(f, "data_changed"),
            EventKind::ChildrenChanged => write!(f, "children_changed"),
            EventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// Notification delivered to a one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: EventKind,
    pub path: String,
}

/// Session state transitions, observable via [`Coordinator::session_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connected and operating normally.
    Connected,
    /// Temporarily cut off; the session (and its ephemeral nodes) may still
    /// be alive on the service side.
    Disconnected,
    /// The service ended the session and removed its ephemeral nodes.
    Expired,
    /// The session was closed by its owner.
    Closed,
}

impl SessionState {
    /// Error returned for calls made while in this state, if any.
    pub fn check(self) -> CoordinationResult<()> {
        match self {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(CoordinationError::ConnectionLoss(
                "session disconnected".into(),
            )),
            SessionState::Expired => Err(CoordinationError::SessionExpired),
            SessionState::Closed => Err(CoordinationError::SessionClosed),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Expired => write!(f, "expired"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Pending one-shot watch.
///
/// Resolves once with the event that fired it. If the backend drops the
/// watch (disconnect, session end) it resolves with `ConnectionLoss`.
#[derive(Debug)]
pub struct Watcher {
    path: String,
    rx: oneshot::Receiver<NodeEvent>,
}

impl Watcher {
    pub fn new(path: impl Into<String>, rx: oneshot::Receiver<NodeEvent>) -> Self {
        Self {
            path: path.into(),
            rx,
        }
    }

    /// Path the watch was set on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the watch to fire.
    pub async fn changed(self) -> CoordinationResult<NodeEvent> {
        let path = self.path;
        self.rx
            .await
            .map_err(|_| CoordinationError::ConnectionLoss(format!("watch on '{path}' dropped")))
    }
}

/// A session with the coordination service.
///
/// All calls are non-blocking and may be in flight concurrently; completion
/// order is decided by the service. Changes made through a session become
/// visible to watches only after the call returns successfully.
#[async_trait]
pub trait Coordinator: Send + Sync + fmt::Debug + 'static {
    /// Current session state.
    fn state(&self) -> SessionState;

    /// Subscribe to session state transitions.
    fn session_events(&self) -> broadcast::Receiver<SessionState>;

    /// Create a node. The parent must exist.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> CoordinationResult<()>;

    /// Read a node's data. `NotFound` if absent.
    async fn read(&self, path: &str) -> CoordinationResult<Vec<u8>>;

    /// Replace a node's data. `NotFound` if absent.
    async fn write(&self, path: &str, data: &[u8]) -> CoordinationResult<()>;

    /// Delete a childless node. `NotFound` if absent.
    async fn delete(&self, path: &str) -> CoordinationResult<()>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Names of the direct children of `path`, sorted.
    async fn children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// Apply `ops` as one all-or-nothing transaction. On failure nothing is
    /// applied and the error of the first failing op is returned.
    async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<()>;

    /// Set a one-shot watch on `path`.
    async fn watch(&self, path: &str, kind: WatchKind) -> CoordinationResult<Watcher>;

    /// End the session. Ephemeral nodes owned by it are removed.
    async fn close(&self) -> CoordinationResult<()>;

    /// Create `path` as a persistent node unless it already exists.
    async fn ensure_path(&self, path: &str) -> CoordinationResult<()> {
        match self.create(path, &[], CreateMode::Persistent).await {
            Ok(()) => Ok(()),
            Err(CoordinationError::NodeExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Retry configuration for establishing a session.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Attempts made after the first one fails.
    pub retry_max: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
    /// Upper bound for the retry delay.
    pub max_delay: Duration,
}

impl ConnectPolicy {
    /// Delay before retry number `retry` (zero based): `base_delay` doubled
    /// per retry, capped at `max_delay`.
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_max: 3,
            base_delay: CONNECT_RETRY_BASE_DELAY,
            max_delay: MAX_CONNECT_RETRY_DELAY,
        }
    }
}

/// Run `attempt` until it yields a session or the policy is exhausted.
///
/// Each attempt is bounded by `policy.timeout`. Failed attempts back off
/// exponentially. When every attempt fails the last error is wrapped in
/// [`CoordinationError::ConnectionFatal`].
pub async fn connect_with_retry<T, F, Fut>(
    endpoint: &str,
    policy: &ConnectPolicy,
    mut attempt: F,
) -> CoordinationResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoordinationResult<T>>,
{
    let total_attempts = policy.retry_max.saturating_add(1);
    info!(endpoint, total_attempts, "connecting to coordination service");

    let mut attempt_idx = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.timeout, attempt()).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::Timeout(format!(
                "connect to '{endpoint}' timed out after {:?}",
                policy.timeout
            ))),
        };
        let attempt_num = attempt_idx + 1;
        match result {
            Ok(session) => {
                info!(
                    endpoint,
                    attempt = attempt_num,
                    total_attempts,
                    "coordination session established"
                );
                return Ok(session);
            }
            Err(err) if attempt_num >= total_attempts => {
                error!(
                    endpoint,
                    attempts = total_attempts,
                    error = %err,
                    "coordination connect failed after all retry attempts"
                );
                return Err(CoordinationError::ConnectionFatal(format!(
                    "'{endpoint}' unreachable after {total_attempts} attempt(s): {err}"
                )));
            }
            Err(err) => {
                let delay = policy.retry_delay(attempt_idx);
                warn!(
                    endpoint,
                    attempt = attempt_num,
                    total_attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %err,
                    "coordination connect attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt_idx += 1;
            }
        }
    }
}
