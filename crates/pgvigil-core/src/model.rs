//! Domain models: clusters, instances, tunnel descriptors, identifiers.
//!
//! CRUD over these records lives in the surrounding console; this crate only
//! consumes them through the [`crate::repo`] traits.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type!(
    /// Identity of a cluster (a group of related instances).
    ClusterId
);
id_type!(
    /// Identity of a single reachable database server.
    InstanceId
);
id_type!(
    /// Identity of a logical database (one dbname on one instance).
    DatabaseId
);
id_type!(
    /// Identity of a deduplicated canonical statement.
    CanonicalStatementId
);
id_type!(
    /// Identity of a user-defined statement group.
    GroupId
);
id_type!(
    /// Identity of a monitoring session.
    SessionId
);
id_type!(
    /// Identity of one health-check execution run.
    ExecutionId
);

/// A group of related database instances managed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
}

/// SSH tunnel descriptor: an indirect path to an instance through a trusted host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Path to the private key used for authentication.
    pub private_key_path: Option<String>,
}

/// A reachable database server belonging to exactly one cluster.
///
/// The writer flag is unique within a cluster; uniqueness is enforced by the
/// owning CRUD layer, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub cluster_id: ClusterId,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// The instance's configured database (used when a check is not scoped
    /// to all user databases).
    pub database: String,
    pub writer: bool,
    pub tunnel: Option<TunnelSpec>,
}

impl Instance {
    /// Human-readable label used in logs, error contexts and reports.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(DatabaseId::new(), DatabaseId::new());
    }

    #[test]
    fn instance_label_is_host_port() {
        let inst = Instance {
            id: InstanceId::new(),
            cluster_id: ClusterId::new(),
            host: "db-1.internal".to_string(),
            port: 5432,
            username: "app".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            writer: true,
            tunnel: None,
        };
        assert_eq!(inst.label(), "db-1.internal:5432");
    }
}
