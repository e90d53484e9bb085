//! Proxy Session Handler
//!
//! A [`ProxySession`] carries one client's state across statements: the
//! current schema, autocommit mode, and the backend connection it is pinned
//! to while a transaction is open. Unpinned statements are classified,
//! routed and run on a connection borrowed for that statement alone.

pub mod server;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{ColumnInfo, ColumnType, QueryOutcome};
use crate::core::registry::{BackendEntry, BackendRegistry};
use crate::core::HealthStatus;
use crate::error::RutaError;
use crate::pool::{ConnectionPoolManager, PooledConnection};
use crate::protocol::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use crate::routing::statement::{is_read_statement, statement_kind, StatementKind};
use crate::routing::Router;
use crate::utils::quote_identifier;

/// Error code returned when no backend can take the statement
pub const ER_PROXY_UNAVAILABLE: u16 = 9001;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const CR_SERVER_LOST: u16 = 2013;

/// A failed statement, classified for the client
#[derive(Debug, Error)]
pub enum StatementError {
    /// The statement did not run anywhere and may be sent again
    #[error("{0}")]
    Retryable(RutaError),
    /// Must not be retried blindly: a write, an open transaction, or a
    /// failure unrelated to backend availability
    #[error("{0}")]
    Terminal(RutaError),
}

impl StatementError {
    pub fn error(&self) -> &RutaError {
        match self {
            StatementError::Retryable(e) | StatementError::Terminal(e) => e,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StatementError::Retryable(_))
    }

    /// MySQL error code, SQLSTATE and message sent to the client
    pub fn to_mysql_error(&self) -> (u16, String, String) {
        match self.error() {
            RutaError::Query {
                code,
                sql_state,
                message,
            } => (*code, sql_state.clone(), message.clone()),
            e if self.is_retryable() => (CR_SERVER_LOST, "08S01".to_string(), e.to_string()),
            e @ (RutaError::NoBackendAvailable { .. }
            | RutaError::BackendUnavailable { .. }
            | RutaError::PoolExhausted { .. }
            | RutaError::Unreachable { .. }
            | RutaError::PoolClosed) => (ER_PROXY_UNAVAILABLE, "HY000".to_string(), e.to_string()),
            e => (ER_UNKNOWN_ERROR, "HY000".to_string(), e.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub acquire_timeout: Duration,
    /// Retry a failed idempotent read once on another backend of its pool
    pub retry_reads: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
            retry_reads: true,
        }
    }
}

/// Everything a session needs to route and run statements
pub struct SessionContext {
    pub router: Arc<Router>,
    pub pools: Arc<ConnectionPoolManager>,
    pub registry: Arc<BackendRegistry>,
    pub settings: SessionSettings,
}

pub struct ProxySession {
    ctx: Arc<SessionContext>,
    /// Connection held across statements of an open transaction
    pinned: Option<PooledConnection>,
    in_transaction: bool,
    autocommit: bool,
    schema: Option<String>,
    last_backend: Option<String>,
}

impl ProxySession {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            pinned: None,
            in_transaction: false,
            autocommit: true,
            schema: None,
            last_backend: None,
        }
    }

    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn pinned_backend(&self) -> Option<&str> {
        self.pinned.as_ref().map(|c| c.backend_id())
    }

    pub fn last_backend(&self) -> Option<&str> {
        self.last_backend.as_deref()
    }

    /// Status flags for OK and EOF packets
    pub fn status_flags(&self) -> u16 {
        let mut flags = 0;
        if self.autocommit {
            flags |= SERVER_STATUS_AUTOCOMMIT;
        }
        if self.in_transaction {
            flags |= SERVER_STATUS_IN_TRANS;
        }
        flags
    }

    /// Run one statement from the client
    pub async fn execute(&mut self, sql: &str) -> Result<QueryOutcome, StatementError> {
        let kind = statement_kind(sql);
        self.dispatch(sql, kind).await
    }

    /// Switch the default database (COM_INIT_DB)
    pub async fn init_db(&mut self, schema: &str) -> Result<QueryOutcome, StatementError> {
        let sql = format!("USE {}", quote_identifier(schema));
        self.dispatch(&sql, StatementKind::UseSchema(schema.to_string()))
            .await
    }

    async fn dispatch(&mut self, sql: &str, kind: StatementKind) -> Result<QueryOutcome, StatementError> {
        if kind == StatementKind::ShowProxyBackend {
            let serving = self.serving_backend();
            return Ok(describe_backend(&self.ctx.registry, serving, self.in_transaction).await);
        }
        if self.pinned.is_some() {
            self.execute_pinned(sql, &kind).await
        } else {
            self.execute_routed(sql, &kind).await
        }
    }

    async fn execute_routed(&mut self, sql: &str, kind: &StatementKind) -> Result<QueryOutcome, StatementError> {
        let classification = self
            .ctx
            .router
            .classify_statement(sql)
            .await
            .map_err(StatementError::Terminal)?;
        let entry = match self.ctx.router.select_backend(classification.pool_id).await {
            Ok(entry) => entry,
            // USE only changes session state; any live server can check the schema
            Err(e) => match kind {
                StatementKind::UseSchema(_) => match self.ctx.router.select_any_online().await {
                    Some(entry) => entry,
                    None => return Err(StatementError::Terminal(e)),
                },
                _ => return Err(StatementError::Terminal(e)),
            },
        };
        debug!(
            pool = classification.pool_id,
            rule = ?classification.rule_id,
            backend = %entry.id(),
            "Routing statement"
        );

        let idempotent = match kind {
            StatementKind::UseSchema(_) => true,
            StatementKind::Other => is_read_statement(sql),
            _ => false,
        };

        let error = match self.run_once(&entry, sql, kind).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if idempotent && e.is_recoverable() => e,
            Err(e) => return Err(StatementError::Terminal(e)),
        };

        if !self.ctx.settings.retry_reads {
            return Err(StatementError::Retryable(error));
        }
        let pool_id = entry.backend().pool_id;
        let other = match self.ctx.router.select_backend_excluding(pool_id, entry.id()).await {
            Ok(other) => other,
            Err(_) => return Err(StatementError::Retryable(error)),
        };
        warn!(
            backend = %entry.id(),
            retry_backend = %other.id(),
            error = %error,
            "Read failed, retrying on another backend"
        );
        match self.run_once(&other, sql, kind).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_recoverable() => Err(StatementError::Retryable(e)),
            Err(e) => Err(StatementError::Terminal(e)),
        }
    }

    /// Borrow a connection to `entry`, run the statement, then release the
    /// connection or keep it pinned when the statement opened a transaction
    async fn run_once(
        &mut self,
        entry: &Arc<BackendEntry>,
        sql: &str,
        kind: &StatementKind,
    ) -> Result<QueryOutcome, RutaError> {
        let mut conn = self
            .ctx
            .pools
            .acquire(entry.id(), self.ctx.settings.acquire_timeout)
            .await?;
        let result = run_on(&mut conn, self.schema.as_deref(), sql, kind).await;
        entry.record_query(result.is_ok());
        self.last_backend = Some(entry.id().to_string());

        match &result {
            Ok(_) => {
                self.apply_state(kind);
                if self.needs_pin() {
                    debug!(backend = %entry.id(), "Session pinned");
                    self.pinned = Some(conn);
                } else {
                    self.ctx.pools.release(conn).await;
                }
            }
            Err(_) => self.ctx.pools.release(conn).await,
        }
        result
    }

    async fn execute_pinned(&mut self, sql: &str, kind: &StatementKind) -> Result<QueryOutcome, StatementError> {
        let backend_id = match self.pinned.as_ref() {
            Some(conn) => conn.backend_id().to_string(),
            None => return Err(StatementError::Terminal(RutaError::internal("session is not pinned"))),
        };

        let entry = self.ctx.registry.get(&backend_id).await;
        let entry = match entry {
            Some(entry) if entry.health().status != HealthStatus::Offline => entry,
            Some(_) => {
                return Err(self
                    .break_affinity(format!("backend {} went OFFLINE during the transaction", backend_id))
                    .await)
            }
            None => {
                return Err(self
                    .break_affinity(format!("backend {} was removed during the transaction", backend_id))
                    .await)
            }
        };

        let result = match self.pinned.as_mut() {
            Some(conn) => run_on(conn, self.schema.as_deref(), sql, kind).await,
            None => Err(RutaError::internal("session is not pinned")),
        };
        entry.record_query(result.is_ok());
        self.last_backend = Some(backend_id);

        match result {
            Ok(outcome) => {
                self.apply_state(kind);
                if !self.needs_pin() {
                    if let Some(conn) = self.pinned.take() {
                        debug!(backend = %conn.backend_id(), "Session unpinned");
                        self.ctx.pools.release(conn).await;
                    }
                }
                Ok(outcome)
            }
            Err(e) if e.is_connection_fault() => {
                // The transaction is gone with its connection
                self.unpin().await;
                Err(StatementError::Terminal(e))
            }
            Err(e) => Err(StatementError::Terminal(e)),
        }
    }

    async fn break_affinity(&mut self, message: String) -> StatementError {
        info!(reason = %message, "Transaction affinity lost");
        self.unpin().await;
        StatementError::Terminal(RutaError::affinity(message))
    }

    fn apply_state(&mut self, kind: &StatementKind) {
        match kind {
            StatementKind::Begin => self.in_transaction = true,
            StatementKind::Commit | StatementKind::Rollback => self.in_transaction = false,
            StatementKind::SetAutocommit(enabled) => {
                self.autocommit = *enabled;
                if *enabled {
                    // Enabling autocommit commits the open transaction
                    self.in_transaction = false;
                }
            }
            StatementKind::UseSchema(schema) => self.schema = Some(schema.clone()),
            StatementKind::ShowProxyBackend | StatementKind::Other => {}
        }
    }

    fn needs_pin(&self) -> bool {
        self.in_transaction || !self.autocommit
    }

    /// Discard the pinned connection and forget transaction state
    async fn unpin(&mut self) {
        if let Some(mut conn) = self.pinned.take() {
            conn.mark_broken();
            self.ctx.pools.release(conn).await;
        }
        self.in_transaction = false;
        self.autocommit = true;
    }

    /// COM_RESET_CONNECTION: roll back by discarding, keep the schema
    pub async fn reset(&mut self) {
        self.unpin().await;
    }

    /// Client went away. A pinned connection still has an open transaction
    /// or autocommit off, so it is never pooled again.
    pub async fn close(&mut self) {
        if self.pinned.is_some() {
            debug!("Discarding pinned connection of closed session");
        }
        self.unpin().await;
    }

    /// Backend a diagnostic query reports: the pinned one, else the last used
    fn serving_backend(&self) -> Option<String> {
        self.pinned_backend()
            .or(self.last_backend.as_deref())
            .map(str::to_string)
    }
}

/// Answer `SHOW PROXY BACKEND` from the registry
async fn describe_backend(
    registry: &BackendRegistry,
    backend_id: Option<String>,
    in_transaction: bool,
) -> QueryOutcome {
    let columns = vec![
        ColumnInfo::new("backend_id", ColumnType::VarString),
        ColumnInfo::new("address", ColumnType::VarString),
        ColumnInfo::new("pool_id", ColumnType::Long),
        ColumnInfo::new("in_transaction", ColumnType::Tiny),
    ];
    let mut rows = Vec::new();
    if let Some(backend_id) = backend_id {
        let (address, pool_id) = match registry.get(&backend_id).await {
            Some(entry) => (
                Some(Bytes::from(entry.backend().address.clone())),
                Some(Bytes::from(entry.backend().pool_id.to_string())),
            ),
            None => (None, None),
        };
        rows.push(vec![
            Some(Bytes::from(backend_id)),
            address,
            pool_id,
            Some(Bytes::from_static(if in_transaction { b"1" } else { b"0" })),
        ]);
    }
    QueryOutcome::ResultSet { columns, rows }
}

/// Bring the connection to the session's schema, then run the statement
async fn run_on(
    conn: &mut PooledConnection,
    schema: Option<&str>,
    sql: &str,
    kind: &StatementKind,
) -> Result<QueryOutcome, RutaError> {
    if let StatementKind::UseSchema(target) = kind {
        conn.use_schema(target).await?;
        return Ok(QueryOutcome::ok());
    }
    if let Some(schema) = schema {
        conn.use_schema(schema).await?;
    }
    conn.execute(sql).await
}
