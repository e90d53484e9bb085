/// Configuration management for ruta

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use crate::error::ConfigError;

use crate::core::registry::BackendRegistry;
use crate::core::{Backend, PoolId, PoolRole};
use crate::error::{RutaError, RutaResult};
use crate::health::MonitorSettings;
use crate::pool::PoolSettings;
use crate::proxy::server::ServerSettings;
use crate::proxy::SessionSettings;
use crate::routing::balancer::Selection;
use crate::routing::rules::{MatchKind, RoutingRule, RuleMatcher, RuleTable};
use crate::utils::parse_address;

/// Main ruta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// Credentials the proxy uses on backend connections
    #[serde(default)]
    pub backend_credentials: BackendCredentials,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Hostgroups
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    /// Routing rules, evaluated by priority then file order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Data-plane address clients connect to
    pub listen_addr: String,
    /// Admin HTTP API address
    pub admin_addr: String,
    pub max_client_connections: usize,
    pub client_idle_timeout_sec: u64,
    pub handshake_timeout_ms: u64,
    /// TCP keepalive idle time for client sockets; 0 disables keepalive
    pub tcp_keepalive_sec: u64,
    /// Version string announced in the greeting
    pub server_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ServerSettings::default();
        Self {
            listen_addr: defaults.listen_addr,
            admin_addr: "127.0.0.1:6032".to_string(),
            max_client_connections: defaults.max_client_connections,
            client_idle_timeout_sec: defaults.client_idle_timeout.as_secs(),
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            tcp_keepalive_sec: defaults.tcp_keepalive.map_or(0, |idle| idle.as_secs()),
            server_version: defaults.server_version,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for the admin API; open when unset
    pub api_key: Option<String>,
}

/// Passed through to backends unchanged
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCredentials {
    pub username: String,
    pub password: String,
    pub database: Option<String>,
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub id: PoolId,
    pub name: String,
    pub role: PoolRole,
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    /// `host:port`
    pub address: String,
    pub pool_id: PoolId,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replication_lag_sec: Option<u64>,
}

impl BackendConfig {
    pub fn to_backend(&self) -> Backend {
        Backend {
            id: self.id.clone(),
            address: self.address.clone(),
            pool_id: self.pool_id,
            weight: self.weight,
            max_connections: self.max_connections,
            comment: self.comment.clone(),
            max_replication_lag_sec: self.max_replication_lag_sec,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub rule_id: u32,
    /// Lower runs first
    #[serde(default)]
    pub priority: u32,
    pub match_kind: MatchKind,
    pub match_pattern: String,
    pub destination_pool: PoolId,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub comment: String,
}

impl RuleConfig {
    pub fn to_rule(&self) -> RutaResult<RoutingRule> {
        let matcher = RuleMatcher::new(self.match_kind, &self.match_pattern)?;
        Ok(RoutingRule::new(self.rule_id, matcher, self.destination_pool)
            .with_priority(self.priority)
            .with_active(self.active)
            .with_comment(self.comment.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub selection: Selection,
    /// Retry a failed read once on another backend of the same pool
    pub retry_reads: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            selection: Selection::default(),
            retry_reads: true,
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub ping_interval_ms: u64,
    pub read_only_interval_ms: u64,
    pub replication_lag_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Consecutive failures before a backend is marked OFFLINE
    pub failure_threshold: u32,
    pub max_replication_lag_sec: u64,
    /// Lag assumed when a replica reports NULL (replication stopped)
    pub lag_when_null_sec: u64,
    /// Monitor account; falls back to the backend credentials
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let defaults = MonitorSettings::default();
        Self {
            ping_interval_ms: defaults.ping_interval.as_millis() as u64,
            read_only_interval_ms: defaults.read_only_interval.as_millis() as u64,
            replication_lag_interval_ms: defaults.replication_lag_interval.as_millis() as u64,
            probe_timeout_ms: defaults.probe_timeout.as_millis() as u64,
            failure_threshold: defaults.failure_threshold,
            max_replication_lag_sec: defaults.max_replication_lag_sec,
            lag_when_null_sec: defaults.lag_when_null_sec,
            username: None,
            password: None,
        }
    }
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            read_only_interval: Duration::from_millis(self.read_only_interval_ms),
            replication_lag_interval: Duration::from_millis(self.replication_lag_interval_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            failure_threshold: self.failure_threshold,
            max_replication_lag_sec: self.max_replication_lag_sec,
            lag_when_null_sec: self.lag_when_null_sec,
        }
    }

    /// Credentials for probe connections
    pub fn credentials(&self, backend: &BackendCredentials) -> BackendCredentials {
        BackendCredentials {
            username: self
                .username
                .clone()
                .unwrap_or_else(|| backend.username.clone()),
            password: self
                .password
                .clone()
                .unwrap_or_else(|| backend.password.clone()),
            database: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// How long a statement waits for a backend connection
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub idle_timeout_sec: u64,
    pub max_lifetime_sec: u64,
    pub reap_interval_sec: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        let defaults = PoolSettings::default();
        Self {
            acquire_timeout_ms: 5000,
            connect_timeout_ms: 3000,
            idle_timeout_sec: defaults.idle_timeout.as_secs(),
            max_lifetime_sec: defaults.max_lifetime.as_secs(),
            reap_interval_sec: defaults.reap_interval.as_secs(),
        }
    }
}

impl ConnectionPoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout_sec),
            max_lifetime: Duration::from_secs(self.max_lifetime_sec),
            reap_interval: Duration::from_secs(self.reap_interval_sec),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            admin: AdminConfig::default(),
            backend_credentials: BackendCredentials {
                username: "root".to_string(),
                password: "mypass".to_string(),
                database: Some("testdb".to_string()),
            },
            routing: RoutingConfig::default(),
            monitor: MonitorConfig::default(),
            connection_pool: ConnectionPoolConfig::default(),
            logging: LoggingConfig::default(),
            pools: vec![
                PoolConfig {
                    id: 10,
                    name: "writer".to_string(),
                    role: PoolRole::Writer,
                },
                PoolConfig {
                    id: 20,
                    name: "readers".to_string(),
                    role: PoolRole::Reader,
                },
            ],
            backends: vec![BackendConfig {
                id: "mysql-primary".to_string(),
                address: "127.0.0.1:3306".to_string(),
                pool_id: 10,
                weight: 1,
                max_connections: 100,
                comment: String::new(),
                max_replication_lag_sec: None,
            }],
            rules: Vec::new(),
        }
    }
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Listeners
        for (name, addr) in [
            ("listen_addr", &self.server.listen_addr),
            ("admin_addr", &self.server.admin_addr),
        ] {
            addr.parse::<std::net::SocketAddr>()
                .map_err(|_| invalid(format!("Invalid server {}: {}", name, addr)))?;
        }
        if self.server.max_client_connections == 0 {
            return Err(invalid("max_client_connections must be greater than 0"));
        }
        if self.server.client_idle_timeout_sec == 0 || self.server.handshake_timeout_ms == 0 {
            return Err(invalid("client timeouts must be greater than 0"));
        }

        // Topology
        let mut pool_ids = HashSet::new();
        for pool in &self.pools {
            if !pool_ids.insert(pool.id) {
                return Err(invalid(format!("Duplicate pool id: {}", pool.id)));
            }
        }
        let writers = self
            .pools
            .iter()
            .filter(|p| p.role == PoolRole::Writer)
            .count();
        if writers != 1 {
            return Err(invalid(format!(
                "Exactly one writer pool is required, found {}",
                writers
            )));
        }

        let mut backend_ids = HashSet::new();
        for backend in &self.backends {
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(invalid(format!("Duplicate backend id: {}", backend.id)));
            }
            if !pool_ids.contains(&backend.pool_id) {
                return Err(invalid(format!(
                    "Backend {} references unknown pool {}",
                    backend.id, backend.pool_id
                )));
            }
            if backend.weight == 0 {
                return Err(invalid(format!("Backend {} weight must be at least 1", backend.id)));
            }
            if backend.max_connections == 0 {
                return Err(invalid(format!(
                    "Backend {} max_connections must be at least 1",
                    backend.id
                )));
            }
            parse_address(&backend.address).map_err(|e| invalid(validation_message(e)))?;
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.rule_id) {
                return Err(invalid(format!("Duplicate rule id: {}", rule.rule_id)));
            }
            if !pool_ids.contains(&rule.destination_pool) {
                return Err(invalid(format!(
                    "Rule {} routes to unknown pool {}",
                    rule.rule_id, rule.destination_pool
                )));
            }
            rule.to_rule().map_err(|e| invalid(validation_message(e)))?;
        }

        // Monitor
        let monitor = &self.monitor;
        if monitor.ping_interval_ms == 0
            || monitor.read_only_interval_ms == 0
            || monitor.replication_lag_interval_ms == 0
        {
            return Err(invalid("monitor intervals must be greater than 0"));
        }
        if monitor.probe_timeout_ms == 0 {
            return Err(invalid("monitor probe_timeout_ms must be greater than 0"));
        }
        if monitor.failure_threshold == 0 {
            return Err(invalid("monitor failure_threshold must be greater than 0"));
        }

        // Connection pool
        let pool = &self.connection_pool;
        if pool.acquire_timeout_ms == 0 || pool.connect_timeout_ms == 0 {
            return Err(invalid("connection pool timeouts must be greater than 0"));
        }
        if pool.idle_timeout_sec == 0 || pool.max_lifetime_sec == 0 || pool.reap_interval_sec == 0 {
            return Err(invalid("connection pool lifetimes must be greater than 0"));
        }

        // Logging
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid(format!("Invalid log level: {}", self.logging.level))),
        }
        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => return Err(invalid(format!("Invalid log format: {}", self.logging.format))),
        }

        Ok(())
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            listen_addr: self.server.listen_addr.clone(),
            max_client_connections: self.server.max_client_connections,
            client_idle_timeout: Duration::from_secs(self.server.client_idle_timeout_sec),
            handshake_timeout: Duration::from_millis(self.server.handshake_timeout_ms),
            tcp_keepalive: match self.server.tcp_keepalive_sec {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            server_version: self.server.server_version.clone(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            acquire_timeout: Duration::from_millis(self.connection_pool.acquire_timeout_ms),
            retry_reads: self.routing.retry_reads,
        }
    }

    /// Registry populated with the configured pools and backends
    pub async fn build_registry(&self) -> RutaResult<Arc<BackendRegistry>> {
        let registry = Arc::new(BackendRegistry::new());
        for pool in &self.pools {
            registry.add_pool(pool.id, pool.name.clone(), pool.role).await?;
        }
        for backend in &self.backends {
            registry.register(backend.to_backend()).await?;
        }
        Ok(registry)
    }

    pub fn build_rules(&self) -> RutaResult<RuleTable> {
        let table = RuleTable::new();
        for rule in &self.rules {
            table.add(rule.to_rule()?)?;
        }
        Ok(table)
    }

    /// Create example configuration file: one primary and two replicas
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Self::example().save_to_file(path)
    }

    pub fn example() -> Self {
        let backend = |id: &str, pool_id: PoolId, comment: &str| BackendConfig {
            id: id.to_string(),
            address: format!("{}:3306", id),
            pool_id,
            weight: 1,
            max_connections: 100,
            comment: comment.to_string(),
            max_replication_lag_sec: None,
        };
        let rule = |rule_id: u32, pattern: &str, destination_pool: PoolId, comment: &str| RuleConfig {
            rule_id,
            priority: 0,
            match_kind: MatchKind::Regex,
            match_pattern: pattern.to_string(),
            destination_pool,
            active: true,
            comment: comment.to_string(),
        };

        Config {
            admin: AdminConfig {
                api_key: Some("change-me".to_string()),
            },
            monitor: MonitorConfig {
                username: Some("monitor".to_string()),
                password: Some("monitor".to_string()),
                ..MonitorConfig::default()
            },
            backends: vec![
                backend("mysql-primary", 10, "primary"),
                backend("mysql-replica1", 20, "replica"),
                backend("mysql-replica2", 20, "replica"),
            ],
            rules: vec![
                rule(1, "^SELECT.*FOR UPDATE", 10, "locking reads stay on the writer"),
                rule(2, "^SELECT", 20, "reads go to the replicas"),
            ],
            ..Config::default()
        }
    }
}

/// Message of a validation error without the error-kind prefix
fn validation_message(error: RutaError) -> String {
    match error {
        RutaError::Config(ConfigError::ValidationError(message)) => message,
        other => other.to_string(),
    }
}
