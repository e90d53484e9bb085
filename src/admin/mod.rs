//! Admin control plane: JSON over HTTP on a port separate from the data plane
pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{delete, get, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use self::auth::require_api_key;
use self::handlers::*;
use crate::core::registry::BackendRegistry;
use crate::core::session::SessionManager;
use crate::error::RutaResult;
use crate::health::HealthMonitor;
use crate::pool::ConnectionPoolManager;
use crate::routing::rules::RuleTable;
use crate::routing::Router as QueryRouter;
use crate::utils::Shutdown;

/// Shared handles the admin handlers operate on
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<BackendRegistry>,
    pub rules: Arc<RuleTable>,
    pub router: Arc<QueryRouter>,
    pub pools: Arc<ConnectionPoolManager>,
    pub monitor: Arc<HealthMonitor>,
    pub sessions: Arc<SessionManager>,
    /// Bearer token required on every request when set
    pub api_key: Option<String>,
    pub started_at: Instant,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/backends", get(list_backends).post(add_backend))
        .route("/admin/backends/{id}", delete(remove_backend))
        .route("/admin/backends/{id}/pool", put(move_backend))
        .route("/admin/pools", get(list_pools).post(add_pool))
        .route("/admin/pools/{id}", delete(remove_pool))
        .route("/admin/rules", get(list_rules).post(add_rule))
        .route("/admin/rules/{id}", delete(remove_rule))
        .route("/admin/rules/{id}/active", put(set_rule_active))
        .route("/admin/stats", get(get_stats))
        .route("/admin/sessions", get(list_sessions))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Serve the admin API until shutdown
pub async fn serve(listener: TcpListener, state: AdminState, shutdown: Shutdown) -> RutaResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, auth = state.api_key.is_some(), "Admin API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    info!("Admin API stopped");
    Ok(())
}
