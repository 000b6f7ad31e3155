//! Path scheme for server and channel records.
//!
//! A pure, stateless translator from logical entities (server host, channel
//! id) to coordination-tree paths. This is the wire contract with the
//! coordination service; no other module builds these strings by hand.

use crate::error::{CoordinationError, CoordinationResult};

/// Persistent parent of every server registration.
pub const SERVERS_ROOT: &str = "/AvailableServers";
/// Persistent parent of every channel record.
pub const CHANNELS_ROOT: &str = "/Channels";

/// Child of a server node holding its connection count.
pub const SERVER_CONNECTIONS: &str = "CurrentTotalConnections";
/// Child of a server node holding its queued connection count.
pub const SERVER_QUEUED: &str = "CurrentTotalQueuedConnections";
/// Child of a channel node holding its connection count.
pub const CHANNEL_CONNECTIONS: &str = "CurrentConnections";
/// Child of a channel node holding its queued connection count.
pub const CHANNEL_QUEUED: &str = "CurrentQueuedConnections";

/// Roots that must exist before anything registers.
pub const ROOTS: &[&str] = &[SERVERS_ROOT, CHANNELS_ROOT];

/// Check that `name` can be used as a single node name.
///
/// Rejects empty names, `.` and `..`, and names containing a path separator
/// or NUL.
pub fn validate_name(name: &str) -> CoordinationResult<&str> {
    if name.is_empty() {
        return Err(CoordinationError::InvalidName("name is empty".into()));
    }
    if name == "." || name == ".." {
        return Err(CoordinationError::InvalidName(format!(
            "'{name}' is a reserved name"
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(CoordinationError::InvalidName(format!(
            "'{}' contains a path separator or NUL",
            name.escape_debug()
        )));
    }
    Ok(name)
}

/// Check that `path` is absolute and every component is a valid name.
pub fn validate_path(path: &str) -> CoordinationResult<&str> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(CoordinationError::InvalidName(format!(
            "path '{path}' is not absolute"
        )));
    };
    for component in rest.split('/') {
        validate_name(component)
            .map_err(|err| CoordinationError::InvalidName(format!("path '{path}': {err}")))?;
    }
    Ok(path)
}

/// Parent of `path`, `/` for top-level nodes, `None` for the root itself.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Last component of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// The two counters stored under each server and channel node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Connections,
    Queued,
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Counter::Connections => write!(f, "connections"),
            Counter::Queued => write!(f, "queued"),
        }
    }
}

/// Both counters, for iteration.
pub const ALL_COUNTERS: &[Counter] = &[Counter::Connections, Counter::Queued];

/// Paths making up one server registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPaths {
    pub node: String,
    pub connections: String,
    pub queued: String,
}

impl ServerPaths {
    /// Paths for `host`. Fails if `host` is not a valid node name.
    pub fn new(host: &str) -> CoordinationResult<Self> {
        let node = join(SERVERS_ROOT, validate_name(host)?);
        Ok(Self {
            connections: join(&node, SERVER_CONNECTIONS),
            queued: join(&node, SERVER_QUEUED),
            node,
        })
    }

    /// Path of the given counter.
    pub fn counter(&self, counter: Counter) -> &str {
        match counter {
            Counter::Connections => &self.connections,
            Counter::Queued => &self.queued,
        }
    }
}

/// Paths making up one channel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    /// Ownership node; its payload is the owner host.
    pub node: String,
    pub connections: String,
    pub queued: String,
}

impl ChannelPaths {
    /// Paths for `channel_id`. Fails if the id is not a valid node name.
    pub fn new(channel_id: &str) -> CoordinationResult<Self> {
        let node = join(CHANNELS_ROOT, validate_name(channel_id)?);
        Ok(Self {
            connections: join(&node, CHANNEL_CONNECTIONS),
            queued: join(&node, CHANNEL_QUEUED),
            node,
        })
    }

    /// Path of the given counter.
    pub fn counter(&self, counter: Counter) -> &str {
        match counter {
            Counter::Connections => &self.connections,
            Counter::Queued => &self.queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_paths() {
        let paths = ServerPaths::new("10.0.0.1:9000").unwrap();
        assert_eq!(paths.node, "/AvailableServers/10.0.0.1:9000");
        assert_eq!(
            paths.connections,
            "/AvailableServers/10.0.0.1:9000/CurrentTotalConnections"
        );
        assert_eq!(
            paths.counter(Counter::Queued),
            "/AvailableServers/10.0.0.1:9000/CurrentTotalQueuedConnections"
        );
    }

    #[test]
    fn test_channel_paths() {
        let paths = ChannelPaths::new("room-42").unwrap();
        assert_eq!(paths.node, "/Channels/room-42");
        assert_eq!(paths.connections, "/Channels/room-42/CurrentConnections");
        assert_eq!(
            paths.counter(Counter::Queued),
            "/Channels/room-42/CurrentQueuedConnections"
        );
    }

    #[test]
    fn test_paths_are_deterministic() {
        assert_eq!(ChannelPaths::new("c1").unwrap(), ChannelPaths::new("c1").unwrap());
        assert_eq!(ServerPaths::new("a").unwrap(), ServerPaths::new("a").unwrap());
    }

    #[test]
    fn test_invalid_names_rejected() {
        for bad in ["", ".", "..", "a/b", "/a", "nul\0"] {
            let err = ChannelPaths::new(bad).unwrap_err();
            assert!(matches!(err, CoordinationError::InvalidName(_)), "{bad:?}");
            assert!(ServerPaths::new(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/Channels/c1").is_ok());
        assert!(validate_path("Channels").is_err());
        assert!(validate_path("/").is_err());
        assert!(validate_path("/Channels/").is_err());
        assert!(validate_path("/Channels//c1").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/Channels/c1"), Some("/Channels"));
        assert_eq!(parent("/Channels"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/Channels/c1"), "c1");
        assert_eq!(join("/", "Channels"), "/Channels");
        assert_eq!(join("/Channels", "c1"), "/Channels/c1");
    }
}
