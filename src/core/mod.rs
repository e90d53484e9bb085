//! Core abstractions shared by the registry, monitor, pools and router
pub mod connection;
pub mod registry;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifier of a pool (hostgroup)
pub type PoolId = u32;

/// Role a pool plays in the replication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    Writer,
    Reader,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Writer => write!(f, "writer"),
            PoolRole::Reader => write!(f, "reader"),
        }
    }
}

/// A database server known to the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    /// `host:port` of the server
    pub address: String,
    pub pool_id: PoolId,
    pub weight: u32,
    pub max_connections: usize,
    #[serde(default)]
    pub comment: String,
    /// Overrides the monitor-wide replication lag threshold for this backend
    #[serde(default)]
    pub max_replication_lag_sec: Option<u64>,
}

impl Backend {
    pub fn new<I: Into<String>, A: Into<String>>(id: I, address: A, pool_id: PoolId) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            pool_id,
            weight: 1,
            max_connections: 100,
            comment: String::new(),
            max_replication_lag_sec: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Health status of a backend as seen by routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Eligible for selection
    Online,
    /// Reachable but excluded from selection (lagging, or failing below threshold)
    Degraded,
    /// Unusable: no new connections, idle connections evicted
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Online => write!(f, "ONLINE"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Latest health observation for one backend.
///
/// Replaced as a whole on every update; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub backend_id: String,
    pub status: HealthStatus,
    pub last_check_time: Option<SystemTime>,
    /// Last reported lag; `None` until probed or when replication reports NULL
    pub replication_lag_seconds: Option<u64>,
    /// Last observed `read_only` flag
    pub read_only: Option<bool>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl HealthState {
    /// State of a freshly registered backend: ONLINE until a probe says otherwise
    pub fn initial<S: Into<String>>(backend_id: S) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: HealthStatus::Online,
            last_check_time: None,
            replication_lag_seconds: None,
            read_only: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == HealthStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_display() {
        assert_eq!(HealthStatus::Online.to_string(), "ONLINE");
        assert_eq!(HealthStatus::Degraded.to_string(), "DEGRADED");
        assert_eq!(HealthStatus::Offline.to_string(), "OFFLINE");
    }

    #[test]
    fn test_initial_health_state() {
        let state = HealthState::initial("mysql-replica-1");
        assert!(state.is_online());
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_check_time.is_none());
        assert!(!state.clone().with_status(HealthStatus::Degraded).is_online());
    }

    #[test]
    fn test_backend_builder() {
        let backend = Backend::new("mysql-primary", "10.0.0.10:3306", 10)
            .with_weight(3)
            .with_max_connections(50);
        assert_eq!(backend.weight, 3);
        assert_eq!(backend.max_connections, 50);
        assert_eq!(backend.pool_id, 10);
    }

    #[test]
    fn test_pool_role_serde() {
        let role: PoolRole = serde_json::from_str("\"reader\"").unwrap();
        assert_eq!(role, PoolRole::Reader);
        assert_eq!(serde_json::to_string(&HealthStatus::Offline).unwrap(), "\"OFFLINE\"");
    }
}
