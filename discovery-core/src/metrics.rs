#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! registry, cache and discovery statistics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum Operation {
        new_channel,
        resolve_channel,
    }
    pub label_enum Outcome {
        ok,
        no_servers,
        retry_later,
        owner_unavailable,
        error,
    }
    pub struct DiscoveryStats: IntCounter {
        "operation" => Operation,
        "outcome" => Outcome,
    }
    pub label_enum WatchEvent {
        created,
        data_changed,
        children_changed,
        deleted,
    }
    pub struct WatchStats: IntCounter {
        "event" => WatchEvent
    }
}

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();
    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    pub static ref DISCOVERY_COUNT_VEC: IntCounterVec = register_int_counter_vec!(
        "discovery_requests",
        "discovery requests by operation and outcome",
        &["operation", "outcome"]
    )
    .unwrap();
    /// outcomes of discovery requests
    pub static ref DISCOVERY_COUNT: DiscoveryStats = DiscoveryStats::from(&DISCOVERY_COUNT_VEC);

    pub static ref WATCH_EVENT_VEC: IntCounterVec = register_int_counter_vec!(
        "watch_events",
        "watch notifications handled, by event kind",
        &["event"]
    )
    .unwrap();
    /// watch notifications handled
    pub static ref WATCH_EVENTS: WatchStats = WatchStats::from(&WATCH_EVENT_VEC);

    /// # of servers in the local cache
    pub static ref CACHED_SERVERS: IntGauge =
        register_int_gauge!("cached_servers", "count of servers in the local cache").unwrap();
    /// # of channels in the local cache
    pub static ref CACHED_CHANNELS: IntGauge =
        register_int_gauge!("cached_channels", "count of channels in the local cache").unwrap();

    /// 1 when the coordination session is connected
    pub static ref SESSION_CONNECTED: IntGauge =
        register_int_gauge!("coordination_session_connected", "coordination session connected (1) or not (0)").unwrap();
    /// # of cache resyncs after a session reconnect
    pub static ref RESYNC_COUNT: IntCounter =
        register_int_counter!("cache_resyncs", "count of cache resyncs after reconnect").unwrap();
}

/// Count a handled watch notification.
pub fn record_watch_event(kind: coordination::EventKind) {
    use coordination::EventKind;
    match kind {
        EventKind::Created => WATCH_EVENTS.created.inc(),
        EventKind::DataChanged => WATCH_EVENTS.data_changed.inc(),
        EventKind::ChildrenChanged => WATCH_EVENTS.children_changed.inc(),
        EventKind::Deleted => WATCH_EVENTS.deleted.inc(),
    }
}
