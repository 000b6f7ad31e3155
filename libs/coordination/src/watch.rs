//! Permanent watches built from one-shot watches.
//!
//! A [`PermanentWatch`] sets a one-shot watch, and every time it fires
//! re-arms it before dispatching the event to a [`WatchHandler`]. Deletion of
//! the watched node ends the subscription: an ephemeral node that is gone has
//! nothing left to watch. The loop runs as its own task; its lifecycle is the
//! [`Subscription`] returned to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, trace, warn};
use tracing_futures::Instrument;

use crate::client::{Coordinator, EventKind, NodeEvent, WatchKind, Watcher};
use crate::error::CoordinationResult;

/// Callbacks invoked by a [`PermanentWatch`], one per event kind.
///
/// Errors are logged by the watch loop and never end the subscription.
#[async_trait]
pub trait WatchHandler: Send + Sync + 'static {
    async fn on_created(&self, _path: &str) -> CoordinationResult<()> {
        Ok(())
    }

    async fn on_data_changed(&self, _path: &str) -> CoordinationResult<()> {
        Ok(())
    }

    async fn on_children_changed(&self, _path: &str) -> CoordinationResult<()> {
        Ok(())
    }

    async fn on_deleted(&self, _path: &str) -> CoordinationResult<()> {
        Ok(())
    }
}

/// Lifecycle of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Active,
    Cancelled,
}

/// Handle to a running permanent watch.
///
/// Dropping the handle cancels the watch.
#[derive(Debug)]
pub struct Subscription {
    path: String,
    kind: WatchKind,
    state: Arc<watch::Sender<SubscriptionState>>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Path being watched.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Kind of watch being re-armed.
    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Whether the watch is still being re-armed.
    pub fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    /// Stop re-arming and discard any pending notification.
    pub fn cancel(&self) {
        self.task.abort();
        self.state.send_replace(SubscriptionState::Cancelled);
    }

    /// Wait until the subscription has ended.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // sender is owned by `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|s| *s == SubscriptionState::Cancelled).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        trace!(path = %self.path, "subscription dropped");
        self.cancel();
    }
}

/// Continuous subscription emulated with one-shot watches.
#[derive(Debug)]
pub struct PermanentWatch;

impl PermanentWatch {
    /// Arm the first watch on `path` and spawn the re-arming loop.
    ///
    /// The first watch is set before this returns, so errors such as a
    /// missing node for a children watch are reported to the caller and
    /// every change made afterwards is observed.
    pub async fn start(
        coordinator: Arc<dyn Coordinator>,
        path: impl Into<String>,
        kind: WatchKind,
        handler: Arc<dyn WatchHandler>,
    ) -> CoordinationResult<Subscription> {
        let path = path.into();
        let watcher = coordinator.watch(&path, kind).await?;
        let state = Arc::new(watch::Sender::new(SubscriptionState::Active));

        let span = tracing::debug_span!("permanent_watch", path = %path, ?kind);
        let task = tokio::spawn(
            run(coordinator, kind, handler, watcher, Arc::clone(&state)).instrument(span),
        );
        debug!(path = %path, ?kind, "permanent watch started");

        Ok(Subscription {
            path,
            kind,
            state,
            task,
        })
    }
}

async fn run(
    coordinator: Arc<dyn Coordinator>,
    kind: WatchKind,
    handler: Arc<dyn WatchHandler>,
    mut watcher: Watcher,
    state: Arc<watch::Sender<SubscriptionState>>,
) {
    loop {
        let path = watcher.path().to_owned();
        let event = match watcher.changed().await {
            Ok(event) => event,
            Err(err) => {
                warn!(path, error = %err, "watch dropped by session, subscription ended");
                break;
            }
        };
        trace!(path, kind = %event.kind, "watch fired");

        if event.kind == EventKind::Deleted {
            dispatch(handler.as_ref(), &event).await;
            debug!(path, "watched node deleted, subscription ended");
            break;
        }

        // re-arm before dispatch so changes made while the handler runs still fire
        let rearmed = coordinator.watch(&path, kind).await;
        dispatch(handler.as_ref(), &event).await;
        match rearmed {
            Ok(next) => watcher = next,
            Err(err) => {
                error!(path, error = %err, "failed to re-arm watch, subscription ended");
                break;
            }
        }
    }
    state.send_replace(SubscriptionState::Cancelled);
}

async fn dispatch(handler: &dyn WatchHandler, event: &NodeEvent) {
    let path = event.path.as_str();
    let result = match event.kind {
        EventKind::Created => handler.on_created(path).await,
        EventKind::DataChanged => handler.on_data_changed(path).await,
        EventKind::ChildrenChanged => handler.on_children_changed(path).await,
        EventKind::Deleted => handler.on_deleted(path).await,
    };
    if let Err(err) = result {
        error!(path, kind = %event.kind, error = %err, "watch handler failed");
    }
}
