use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

use super::AdminState;
use crate::core::registry::{BackendEntry, PoolInfo};
use crate::core::session::SessionInfo;
use crate::core::{Backend, HealthState, HealthStatus, PoolId, PoolRole};
use crate::error::{ConfigError, RutaError};
use crate::pool::PoolStats;
use crate::routing::rules::{MatchKind, RoutingRule, RuleInfo, RuleMatcher};
use crate::utils::{format_duration, parse_address, unix_seconds};

/// Maps registry and rule errors onto HTTP statuses
pub struct ApiError(RutaError);

impl From<RutaError> for ApiError {
    fn from(error: RutaError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RutaError::DuplicateBackend { .. }
            | RutaError::DuplicatePool { .. }
            | RutaError::DuplicateRule { .. } => StatusCode::CONFLICT,
            RutaError::UnknownBackend { .. }
            | RutaError::UnknownPool { .. }
            | RutaError::UnknownRule { .. } => StatusCode::NOT_FOUND,
            RutaError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self.0 {
            RutaError::Config(ConfigError::ValidationError(message)) => message.clone(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub uptime: String,
    pub uptime_sec: u64,
    pub writer_pool: Option<PoolId>,
    pub pools: usize,
    pub backends: usize,
    pub backends_online: usize,
    pub rules: usize,
    pub sessions: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let uptime = state.started_at.elapsed();
    let entries = state.registry.all().await;
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime: format_duration(uptime),
        uptime_sec: uptime.as_secs(),
        writer_pool: state.registry.writer_pool().await,
        pools: state.registry.pools().await.len(),
        backends: entries.len(),
        backends_online: entries.iter().filter(|e| e.health().is_online()).count(),
        rules: state.rules.len(),
        sessions: state.sessions.session_count().await,
    })
}

#[derive(Serialize)]
pub struct HealthView {
    pub status: HealthStatus,
    pub last_check: Option<u64>,
    pub replication_lag_seconds: Option<u64>,
    pub read_only: Option<bool>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl From<&HealthState> for HealthView {
    fn from(state: &HealthState) -> Self {
        Self {
            status: state.status,
            last_check: state.last_check_time.map(unix_seconds),
            replication_lag_seconds: state.replication_lag_seconds,
            read_only: state.read_only,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct BackendView {
    #[serde(flatten)]
    pub backend: Backend,
    pub health: HealthView,
    pub in_flight: usize,
    pub queries: u64,
    pub errors: u64,
}

impl From<&BackendEntry> for BackendView {
    fn from(entry: &BackendEntry) -> Self {
        let counters = entry.counters();
        Self {
            backend: entry.backend().clone(),
            health: HealthView::from(entry.health().as_ref()),
            in_flight: counters.in_flight.load(Ordering::Relaxed),
            queries: counters.queries.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }
}

pub async fn list_backends(State(state): State<AdminState>) -> Json<Vec<BackendView>> {
    let entries = state.registry.all().await;
    Json(entries.iter().map(|e| BackendView::from(e.as_ref())).collect())
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> usize {
    100
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct NewBackend {
    pub id: String,
    pub address: String,
    pub pool_id: PoolId,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub max_replication_lag_sec: Option<u64>,
}

/// Register a backend and start probing it
pub async fn add_backend(
    State(state): State<AdminState>,
    Json(request): Json<NewBackend>,
) -> ApiResult<(StatusCode, Json<BackendView>)> {
    parse_address(&request.address)?;
    let backend = Backend {
        id: request.id,
        address: request.address,
        pool_id: request.pool_id,
        weight: request.weight,
        max_connections: request.max_connections,
        comment: request.comment,
        max_replication_lag_sec: request.max_replication_lag_sec,
    };
    let entry = state.registry.register(backend).await?;
    state.monitor.watch(entry.id());
    Ok((StatusCode::CREATED, Json(BackendView::from(entry.as_ref()))))
}

pub async fn remove_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BackendView>> {
    let entry = state.registry.deregister(&id).await?;
    state.router.forget_backend(&id);
    state.pools.remove_backend(&id).await;
    Ok(Json(BackendView::from(entry.as_ref())))
}

#[derive(Debug, Deserialize)]
pub struct PoolAssignment {
    pub pool_id: PoolId,
}

pub async fn move_backend(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(request): Json<PoolAssignment>,
) -> ApiResult<Json<BackendView>> {
    let entry = state.registry.reassign(&id, request.pool_id).await?;
    Ok(Json(BackendView::from(entry.as_ref())))
}

pub async fn list_pools(State(state): State<AdminState>) -> Json<Vec<PoolInfo>> {
    Json(state.registry.pools().await)
}

#[derive(Debug, Deserialize)]
pub struct NewPool {
    pub id: PoolId,
    pub name: String,
    pub role: PoolRole,
}

pub async fn add_pool(
    State(state): State<AdminState>,
    Json(request): Json<NewPool>,
) -> ApiResult<(StatusCode, Json<PoolInfo>)> {
    state
        .registry
        .add_pool(request.id, request.name, request.role)
        .await?;
    let pool = state
        .registry
        .pool(request.id)
        .await
        .ok_or(RutaError::UnknownPool { id: request.id })?;
    Ok((StatusCode::CREATED, Json(pool)))
}

pub async fn remove_pool(
    State(state): State<AdminState>,
    Path(id): Path<PoolId>,
) -> ApiResult<Json<PoolInfo>> {
    Ok(Json(state.registry.remove_pool(id).await?))
}

pub async fn list_rules(State(state): State<AdminState>) -> Json<Vec<RuleInfo>> {
    Json(state.rules.list())
}

#[derive(Debug, Deserialize)]
pub struct NewRule {
    pub rule_id: u32,
    #[serde(default)]
    pub priority: u32,
    pub match_kind: MatchKind,
    pub match_pattern: String,
    pub destination_pool: PoolId,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub comment: String,
}

pub async fn add_rule(
    State(state): State<AdminState>,
    Json(request): Json<NewRule>,
) -> ApiResult<(StatusCode, Json<RuleInfo>)> {
    if state.registry.pool(request.destination_pool).await.is_none() {
        return Err(RutaError::UnknownPool {
            id: request.destination_pool,
        }
        .into());
    }
    let matcher = RuleMatcher::new(request.match_kind, &request.match_pattern)?;
    let rule = RoutingRule::new(request.rule_id, matcher, request.destination_pool)
        .with_priority(request.priority)
        .with_active(request.active)
        .with_comment(request.comment);
    let info = rule.info();
    state.rules.add(rule)?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub async fn remove_rule(
    State(state): State<AdminState>,
    Path(id): Path<u32>,
) -> ApiResult<StatusCode> {
    state.rules.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RuleActivation {
    pub active: bool,
}

pub async fn set_rule_active(
    State(state): State<AdminState>,
    Path(id): Path<u32>,
    Json(request): Json<RuleActivation>,
) -> ApiResult<Json<RuleInfo>> {
    state.rules.set_active(id, request.active)?;
    state
        .rules
        .list()
        .into_iter()
        .find(|r| r.rule_id == id)
        .map(Json)
        .ok_or_else(|| RutaError::UnknownRule { id }.into())
}

#[derive(Serialize)]
pub struct BackendStats {
    pub backend_id: String,
    pub pool_id: PoolId,
    pub status: HealthStatus,
    pub queries: u64,
    pub errors: u64,
    pub in_flight: usize,
}

#[derive(Serialize)]
pub struct Stats {
    pub backends: Vec<BackendStats>,
    pub rules: Vec<RuleInfo>,
    pub pools: Vec<PoolStats>,
    pub sessions: usize,
    pub alerts: u64,
}

pub async fn get_stats(State(state): State<AdminState>) -> Json<Stats> {
    let backends = state
        .registry
        .all()
        .await
        .iter()
        .map(|entry| {
            let counters = entry.counters();
            BackendStats {
                backend_id: entry.id().to_string(),
                pool_id: entry.backend().pool_id,
                status: entry.health().status,
                queries: counters.queries.load(Ordering::Relaxed),
                errors: counters.errors.load(Ordering::Relaxed),
                in_flight: counters.in_flight.load(Ordering::Relaxed),
            }
        })
        .collect();
    Json(Stats {
        backends,
        rules: state.rules.list(),
        pools: state.pools.stats(),
        sessions: state.sessions.session_count().await,
        alerts: state.monitor.alerts(),
    })
}

pub async fn list_sessions(State(state): State<AdminState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.sessions().await)
}

#[cfg(test)]
mod tests {
    use super::super::{router, AdminState};
    use crate::backend::mock::{demo_registry, demo_rules, MockConnector};
    use crate::core::session::SessionManager;
    use crate::health::{HealthMonitor, MonitorSettings};
    use crate::pool::{ConnectionPoolManager, PoolSettings};
    use crate::routing::balancer::Selection;
    use crate::utils::Shutdown;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;

    async fn state(api_key: Option<&str>) -> AdminState {
        let registry = demo_registry().await;
        let connector = Arc::new(MockConnector::new());
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            connector.clone(),
            PoolSettings::default(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            connector,
            MonitorSettings::default(),
            Shutdown::new(),
        ));
        let rules = Arc::new(demo_rules());
        let router = Arc::new(crate::routing::Router::new(
            Arc::clone(&registry),
            Arc::clone(&rules),
            Selection::WeightedRoundRobin,
        ));
        AdminState {
            registry,
            rules,
            router,
            pools,
            monitor,
            sessions: Arc::new(SessionManager::new()),
            api_key: api_key.map(str::to_string),
            started_at: Instant::now(),
        }
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_status_and_listing() {
        let app = router(state(None).await);
        let (status, body) = call(&app, Method::GET, "/admin/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backends"], 3);
        assert_eq!(body["writer_pool"], 10);
        assert_eq!(body["rules"], 2);

        let (_, backends) = call(&app, Method::GET, "/admin/backends", None).await;
        let ids: Vec<&str> = backends
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"reader-1"));
        assert_eq!(backends[0]["health"]["status"], "ONLINE");
    }

    #[tokio::test]
    async fn test_backend_crud() {
        let app = router(state(None).await);
        let new_backend = json!({"id": "reader-3", "address": "10.0.0.13:3306", "pool_id": 20});
        let (status, body) = call(&app, Method::POST, "/admin/backends", Some(new_backend.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["weight"], 1);

        let (status, _) = call(&app, Method::POST, "/admin/backends", Some(new_backend)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            Method::POST,
            "/admin/backends",
            Some(json!({"id": "bad", "address": "no-port", "pool_id": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/admin/backends/reader-3/pool",
            Some(json!({"pool_id": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pool_id"], 10);

        let (status, _) = call(&app, Method::DELETE, "/admin/backends/reader-3", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::DELETE, "/admin/backends/reader-3", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pool_crud() {
        let app = router(state(None).await);
        let (status, body) = call(
            &app,
            Method::POST,
            "/admin/pools",
            Some(json!({"id": 30, "name": "reporting", "role": "reader"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["members"], json!([]));

        let (status, _) = call(&app, Method::DELETE, "/admin/pools/20", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, Method::DELETE, "/admin/pools/30", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rule_crud() {
        let app = router(state(None).await);
        let (status, body) = call(
            &app,
            Method::POST,
            "/admin/rules",
            Some(json!({
                "rule_id": 3,
                "match_kind": "keyword",
                "match_pattern": "SHOW",
                "destination_pool": 20
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["active"], true);

        let (status, _) = call(
            &app,
            Method::POST,
            "/admin/rules",
            Some(json!({
                "rule_id": 4,
                "match_kind": "regex",
                "match_pattern": "^SELECT (",
                "destination_pool": 20
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            "/admin/rules",
            Some(json!({
                "rule_id": 5,
                "match_kind": "prefix",
                "match_pattern": "CALL",
                "destination_pool": 99
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::PUT,
            "/admin/rules/3/active",
            Some(json!({"active": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);

        let (status, _) = call(&app, Method::DELETE, "/admin/rules/3", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, rules) = call(&app, Method::GET, "/admin/rules", None).await;
        assert_eq!(rules.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stats_report_rule_hits() {
        let state = state(None).await;
        state.rules.classify("SELECT 1");
        state.rules.classify("SELECT 1 FOR UPDATE");
        state.rules.classify("SELECT 2");
        let app = router(state);

        let (status, stats) = call(&app, Method::GET, "/admin/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let hits: Vec<u64> = stats["rules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["hits"].as_u64().unwrap())
            .collect();
        assert_eq!(hits, vec![1, 2]);
        assert_eq!(stats["sessions"], 0);
        assert_eq!(stats["backends"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let app = router(state(Some("secret")).await);
        let (status, _) = call(&app, Method::GET, "/admin/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/admin/status")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
