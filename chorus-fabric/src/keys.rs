//! Fabric keyspace.
//!
//! Every key and channel name a coordinator touches is built here, so the
//! wire layout can be audited in one place.

/// Hash holding emergence patterns, field `<nodeId>/<patternId>`.
pub const PATTERN_STORE: &str = "emergence_patterns_store";

/// Channel carrying published emergence patterns.
pub const PATTERN_CHANNEL: &str = "emergence_patterns";

/// Dashboard command channel. Consumed read-only for monitoring; the
/// core never sends commands on it.
pub const DASHBOARD_COMMANDS: &str = "selene:dashboard:commands";

/// Key/channel builder bound to one swarm prefix.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The swarm hash: field `<nodeId>` holds the latest heartbeat JSON.
    pub fn heartbeat_hash(&self) -> String {
        self.prefix.clone()
    }

    /// Expiring per-node vitals key.
    pub fn vitals(&self, node_id: &str) -> String {
        format!("{}:vitals:{}", self.prefix, node_id)
    }

    /// Channel read by every peer.
    pub fn broadcast(&self) -> String {
        format!("{}:broadcast", self.prefix)
    }

    /// A node's private message channel.
    pub fn inbox(&self, node_id: &str) -> String {
        format!("{}:inbox:{}", self.prefix, node_id)
    }

    /// Incoming identity challenges for a node.
    pub fn challenge(&self, node_id: &str) -> String {
        format!("{}:challenge:{}", self.prefix, node_id)
    }

    /// Identity challenge responses addressed to a challenger.
    pub fn response(&self, challenger_id: &str) -> String {
        format!("{}:response:{}", self.prefix, challenger_id)
    }

    /// Field name inside the pattern store hash.
    pub fn pattern_field(node_id: &str, pattern_id: &str) -> String {
        format!("{}/{}", node_id, pattern_id)
    }
}
