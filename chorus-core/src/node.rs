use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Personality traits a coordinator is born with.
///
/// The scalars weight several downstream behaviors: `creativity` seeds the
/// soul's creative drift, `wisdom` seeds its wisdom scalar, and
/// `rebelliousness` widens the drift bounds. All three live in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub name: String,
    pub traits: Vec<String>,
    pub creativity: f64,
    pub rebelliousness: f64,
    pub wisdom: f64,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            name: "unnamed".to_string(),
            traits: vec!["observant".to_string()],
            creativity: 0.5,
            rebelliousness: 0.3,
            wisdom: 0.5,
        }
    }
}

/// Identity of a coordinator on the fabric.
///
/// Constructed once at process start and immutable afterwards. Equality,
/// hashing, and ordering all go through the `id` field only: two records
/// with the same id name the same coordinator even if their snapshots of
/// personality differ in transit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeId {
    pub id: String,
    pub birth: DateTime<Utc>,
    pub personality: Personality,
    pub capabilities: Vec<String>,
}

impl NodeId {
    /// Generate a fresh identity with a random suffix.
    pub fn generate(name: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::with_id(format!("{}-{}", name, &suffix[..8]), name)
    }

    /// Build an identity with an explicit id. Used by tests and by
    /// deployments that manage node names externally.
    pub fn with_id(id: impl Into<String>, name: &str) -> Self {
        Self {
            id: id.into(),
            birth: Utc::now(),
            personality: Personality {
                name: name.to_string(),
                ..Personality::default()
            },
            capabilities: vec![
                "heartbeat".to_string(),
                "consensus".to_string(),
                "replication".to_string(),
                "emergence".to_string(),
            ],
        }
    }

    pub fn with_personality(mut self, personality: Personality) -> Self {
        self.personality = personality;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl PartialEq for NodeId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeId {}

impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_id_only() {
        let mut a = NodeId::with_id("n1", "alpha");
        let b = NodeId::with_id("n1", "beta");
        a.personality.creativity = 0.9;
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_is_lexicographic_on_id() {
        let a = NodeId::with_id("n1", "alpha");
        let b = NodeId::with_id("n2", "beta");
        assert!(a < b);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = NodeId::generate("node");
        let b = NodeId::generate("node");
        assert_ne!(a, b);
    }
}
