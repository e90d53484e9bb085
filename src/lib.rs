/// Ruta - read/write-splitting proxy for MySQL replication topologies
///
/// Clients speak the MySQL protocol to ruta as if it were a single server.
/// Every statement is classified by the routing rules and sent to a healthy
/// backend of the destination hostgroup: writes to the primary, reads spread
/// over the replicas. A background monitor tracks liveness, `read_only` and
/// replication lag, and an admin HTTP API changes the topology at runtime.
pub mod admin;
pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod routing;
pub mod utils;

use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::admin::AdminState;
use crate::backend::mysql::MySqlConnector;
use crate::backend::BackendConnector;
use crate::config::Config;
use crate::core::registry::BackendRegistry;
use crate::core::session::SessionManager;
use crate::health::HealthMonitor;
use crate::pool::ConnectionPoolManager;
use crate::proxy::server::ProxyServer;
use crate::proxy::SessionContext;
use crate::routing::rules::RuleTable;
use crate::routing::Router;
use crate::utils::Shutdown;

pub use crate::error::{RutaError, RutaResult};

/// A fully wired proxy: registry, rules, pools, monitor and both listeners
pub struct Ruta {
    config: Config,
    registry: Arc<BackendRegistry>,
    rules: Arc<RuleTable>,
    router: Arc<Router>,
    pools: Arc<ConnectionPoolManager>,
    monitor: Arc<HealthMonitor>,
    sessions: Arc<SessionManager>,
    server: Arc<ProxyServer>,
    shutdown: Shutdown,
}

impl Ruta {
    /// Build the proxy with MySQL connectors for traffic and for the monitor
    pub async fn from_config(config: Config) -> RutaResult<Self> {
        let connect_timeout = config.connection_pool.connect_timeout();
        let traffic = Arc::new(MySqlConnector::new(
            config.backend_credentials.clone(),
            connect_timeout,
        ));
        let probes = Arc::new(MySqlConnector::new(
            config.monitor.credentials(&config.backend_credentials),
            connect_timeout,
        ));
        Self::with_connectors(config, traffic, probes).await
    }

    pub async fn with_connectors(
        config: Config,
        traffic: Arc<dyn BackendConnector>,
        probes: Arc<dyn BackendConnector>,
    ) -> RutaResult<Self> {
        config.validate()?;

        let shutdown = Shutdown::new();
        let registry = config.build_registry().await?;
        let rules = Arc::new(config.build_rules()?);
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            traffic,
            config.connection_pool.settings(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            probes,
            config.monitor.settings(),
            shutdown.clone(),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&rules),
            config.routing.selection,
        ));
        let ctx = Arc::new(SessionContext {
            router: Arc::clone(&router),
            pools: Arc::clone(&pools),
            registry: Arc::clone(&registry),
            settings: config.session_settings(),
        });
        let sessions = Arc::new(SessionManager::new());
        let server = Arc::new(ProxyServer::new(
            ctx,
            Arc::clone(&sessions),
            config.server_settings(),
        ));

        info!(
            pools = config.pools.len(),
            backends = config.backends.len(),
            rules = config.rules.len(),
            selection = ?config.routing.selection,
            "Ruta initialized"
        );

        Ok(Self {
            config,
            registry,
            rules,
            router,
            pools,
            monitor,
            sessions,
            server,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            registry: Arc::clone(&self.registry),
            rules: Arc::clone(&self.rules),
            router: Arc::clone(&self.router),
            pools: Arc::clone(&self.pools),
            monitor: Arc::clone(&self.monitor),
            sessions: Arc::clone(&self.sessions),
            api_key: self.config.admin.api_key.clone(),
            started_at: Instant::now(),
        }
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> RutaResult<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.trigger();
        });
        self.serve().await
    }

    /// Run until the shutdown handle is triggered
    pub async fn serve(self) -> RutaResult<()> {
        let data_listener = self.server.bind().await?;
        let admin_listener = TcpListener::bind(&self.config.server.admin_addr).await?;
        info!(
            listen = %self.config.server.listen_addr,
            admin = %self.config.server.admin_addr,
            "Ruta listening"
        );

        self.monitor.spawn_all().await;
        let maintenance = tokio::spawn(Arc::clone(&self.pools).run_maintenance(self.shutdown.clone()));
        let admin = tokio::spawn(admin::serve(
            admin_listener,
            self.admin_state(),
            self.shutdown.clone(),
        ));

        let served = Arc::clone(&self.server)
            .run(data_listener, self.shutdown.clone())
            .await;

        // The data plane only returns on shutdown or a listener failure
        self.shutdown.trigger();
        match admin.await {
            Ok(Err(e)) => warn!(error = %e, "Admin API stopped with error"),
            Err(e) => warn!(error = %e, "Admin API task failed"),
            Ok(Ok(())) => {}
        }
        let _ = maintenance.await;

        let closed = self.pools.drain().await;
        let open_sessions = self.sessions.session_count().await;
        info!(
            closed_connections = closed,
            open_sessions,
            "Ruta stopped"
        );
        served
    }
}
