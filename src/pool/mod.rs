//! Connection Pool Manager
//!
//! Each backend gets its own bounded pool: a semaphore with
//! `max_connections` permits and a queue of idle connections. A permit is
//! held for exactly as long as a connection is lent out, so a backend never
//! has more than `max_connections` live connections and no connection is
//! ever held by two callers. Pools share no lock with each other.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{BackendConnector, BackendSession, QueryOutcome};
use crate::core::registry::{BackendCounters, BackendEntry, BackendRegistry};
use crate::core::HealthStatus;
use crate::error::{RutaError, RutaResult};
use crate::utils::{quote_identifier, Shutdown};

/// Pool maintenance settings
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Idle connections unused for longer than this are closed
    pub idle_timeout: Duration,
    /// Connections older than this are closed instead of reused
    pub max_lifetime: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// An open backend connection owned by the pool manager
pub struct Connection {
    id: u64,
    backend_id: String,
    session: Box<dyn BackendSession>,
    created_at: Instant,
    last_used_at: Instant,
    /// Schema selected on this connection, when known
    schema: Option<String>,
}

impl Connection {
    fn is_stale(&self, settings: &PoolSettings) -> bool {
        self.last_used_at.elapsed() > settings.idle_timeout
            || self.created_at.elapsed() > settings.max_lifetime
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

struct BackendPool {
    backend_id: String,
    max_connections: usize,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<Connection>>,
    counters: PoolCounters,
}

impl BackendPool {
    fn new(backend_id: &str, max_connections: usize) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            max_connections,
            slots: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::new()),
            counters: PoolCounters::default(),
        }
    }

    fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Connection>> {
        match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Most recently used idle connection
    fn pop_idle(&self) -> Option<Connection> {
        self.idle_queue().pop_back()
    }

    fn push_idle(&self, connection: Connection) {
        self.idle_queue().push_back(connection);
    }

    fn take_idle<F: Fn(&Connection) -> bool>(&self, predicate: F) -> Vec<Connection> {
        let mut idle = self.idle_queue();
        let (taken, kept): (Vec<Connection>, Vec<Connection>) =
            idle.drain(..).partition(|c| predicate(c));
        idle.extend(kept);
        taken
    }

    fn in_use(&self) -> usize {
        self.max_connections
            .saturating_sub(self.slots.available_permits())
    }
}

/// Occupancy and lifetime counters for one backend's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub backend_id: String,
    pub max_connections: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

/// RAII lease on a pool slot.
///
/// Releases the permit and the backend's in-flight count on drop.
struct ConnectionLease {
    _permit: OwnedSemaphorePermit,
    counters: Arc<BackendCounters>,
}

impl ConnectionLease {
    fn new(permit: OwnedSemaphorePermit, counters: Arc<BackendCounters>) -> Self {
        counters.in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            _permit: permit,
            counters,
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A connection lent to one caller.
///
/// Hand it back with [`ConnectionPoolManager::release`]. Dropping it
/// without release (for example when a client disconnects mid-statement)
/// discards the underlying connection.
pub struct PooledConnection {
    // Field order matters: the connection must be gone before the lease frees its slot
    inner: Option<Connection>,
    pool: Arc<BackendPool>,
    broken: bool,
    _lease: ConnectionLease,
}

impl PooledConnection {
    pub fn backend_id(&self) -> &str {
        &self.pool.backend_id
    }

    pub fn id(&self) -> u64 {
        self.inner.as_ref().map(|c| c.id).unwrap_or_default()
    }

    pub fn schema(&self) -> Option<&str> {
        self.inner.as_ref().and_then(|c| c.schema.as_deref())
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Never return this connection to the idle set
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn connection(&mut self) -> RutaResult<&mut Connection> {
        self.inner
            .as_mut()
            .ok_or_else(|| RutaError::internal("connection used after release"))
    }

    /// Run a statement. Any failure other than a SQL error marks the
    /// connection broken.
    pub async fn execute(&mut self, sql: &str) -> RutaResult<QueryOutcome> {
        let connection = self.connection()?;
        let result = connection.session.execute(sql).await;
        connection.last_used_at = Instant::now();
        if let Err(e) = &result {
            if e.is_connection_fault() {
                self.broken = true;
            }
        }
        result
    }

    /// Make `schema` the default database of this connection
    pub async fn use_schema(&mut self, schema: &str) -> RutaResult<()> {
        if self.schema() == Some(schema) {
            return Ok(());
        }
        self.execute(&format!("USE {}", quote_identifier(schema)))
            .await?;
        if let Some(connection) = self.inner.as_mut() {
            connection.schema = Some(schema.to_string());
        }
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(backend = %self.pool.backend_id, "Discarding connection dropped without release");
        }
    }
}

pub struct ConnectionPoolManager {
    registry: Arc<BackendRegistry>,
    connector: Arc<dyn BackendConnector>,
    pools: RwLock<HashMap<String, Arc<BackendPool>>>,
    settings: PoolSettings,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl ConnectionPoolManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        connector: Arc<dyn BackendConnector>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            registry,
            connector,
            pools: RwLock::new(HashMap::new()),
            settings,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn pool_for(&self, entry: &BackendEntry) -> Arc<BackendPool> {
        if let Ok(pools) = self.pools.read() {
            if let Some(pool) = pools.get(entry.id()) {
                return Arc::clone(pool);
            }
        }
        let mut pools = match self.pools.write() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(pools.entry(entry.id().to_string()).or_insert_with(|| {
            Arc::new(BackendPool::new(
                entry.id(),
                entry.backend().max_connections,
            ))
        }))
    }

    fn existing_pool(&self, backend_id: &str) -> Option<Arc<BackendPool>> {
        self.pools
            .read()
            .ok()
            .and_then(|pools| pools.get(backend_id).cloned())
    }

    fn all_pools(&self) -> Vec<Arc<BackendPool>> {
        self.pools
            .read()
            .map(|pools| pools.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Borrow a connection to `backend_id`, waiting at most `timeout`.
    ///
    /// Reuses the most recently used idle connection, or opens a new one
    /// while the backend is under its connection limit.
    pub async fn acquire(&self, backend_id: &str, timeout: Duration) -> RutaResult<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RutaError::PoolClosed);
        }
        let entry = self
            .registry
            .get(backend_id)
            .await
            .ok_or_else(|| RutaError::unknown_backend(backend_id))?;
        if entry.health().status == HealthStatus::Offline {
            return Err(RutaError::backend_unavailable(backend_id));
        }

        let pool = self.pool_for(&entry);
        let deadline = tokio::time::Instant::now() + timeout;
        let permit = match tokio::time::timeout_at(deadline, Arc::clone(&pool.slots).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RutaError::PoolClosed),
            Err(_) => {
                pool.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(RutaError::pool_exhausted(
                    backend_id,
                    format!("all {} connections busy after {:?}", pool.max_connections, timeout),
                ));
            }
        };
        let lease = ConnectionLease::new(permit, Arc::clone(entry.counters()));

        while let Some(connection) = pool.pop_idle() {
            if connection.is_stale(&self.settings) {
                pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
                connection.session.close().await;
                continue;
            }
            pool.counters.reused.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledConnection {
                inner: Some(connection),
                pool,
                broken: false,
                _lease: lease,
            });
        }

        let session = match tokio::time::timeout_at(deadline, self.connector.connect(entry.backend())).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(RutaError::pool_exhausted(
                    backend_id,
                    format!("could not open a connection: {}", e),
                ))
            }
            Err(_) => {
                pool.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(RutaError::pool_exhausted(
                    backend_id,
                    "timed out opening a connection",
                ));
            }
        };

        pool.counters.created.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let connection = Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            backend_id: backend_id.to_string(),
            session,
            created_at: now,
            last_used_at: now,
            schema: None,
        };
        debug!(backend = %backend_id, connection = connection.id, "Opened pooled connection");
        Ok(PooledConnection {
            inner: Some(connection),
            pool,
            broken: false,
            _lease: lease,
        })
    }

    /// Return a connection. It goes back to the idle set unless it is
    /// broken, too old, or its backend is OFFLINE or gone.
    pub async fn release(&self, mut lent: PooledConnection) {
        let mut connection = match lent.inner.take() {
            Some(connection) => connection,
            None => return,
        };

        let discard = if lent.broken {
            Some("connection error")
        } else if self.closed.load(Ordering::Acquire) {
            Some("pools closed")
        } else if connection.created_at.elapsed() > self.settings.max_lifetime {
            Some("max lifetime reached")
        } else {
            match self.registry.health(&connection.backend_id).await {
                None => Some("backend removed"),
                Some(health) if health.status == HealthStatus::Offline => Some("backend offline"),
                Some(_) => match self.existing_pool(&connection.backend_id) {
                    Some(pool) if Arc::ptr_eq(&pool, &lent.pool) => None,
                    _ => Some("pool replaced"),
                },
            }
        };

        match discard {
            Some(reason) => {
                lent.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(backend = %connection.backend_id, connection = connection.id, reason, "Discarding connection");
                connection.session.close().await;
            }
            None => {
                connection.last_used_at = Instant::now();
                lent.pool.push_idle(connection);
            }
        }
        // Dropping `lent` frees the slot after the connection is back in idle
    }

    /// Close every idle connection to a backend. Lent connections are
    /// discarded when they come back.
    pub async fn evict(&self, backend_id: &str) -> usize {
        let pool = match self.existing_pool(backend_id) {
            Some(pool) => pool,
            None => return 0,
        };
        let evicted = pool.take_idle(|_| true);
        let count = evicted.len();
        pool.counters
            .discarded
            .fetch_add(count as u64, Ordering::Relaxed);
        for connection in evicted {
            connection.session.close().await;
        }
        if count > 0 {
            info!(backend = %backend_id, count, "Evicted idle connections");
        }
        count
    }

    /// Forget a deregistered backend's pool
    pub async fn remove_backend(&self, backend_id: &str) -> usize {
        let closed = self.evict(backend_id).await;
        if let Ok(mut pools) = self.pools.write() {
            pools.remove(backend_id);
        }
        closed
    }

    /// Close idle connections past the idle timeout or max lifetime
    pub async fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for pool in self.all_pools() {
            let stale = pool.take_idle(|c| c.is_stale(&self.settings));
            pool.counters
                .discarded
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            reaped += stale.len();
            for connection in stale {
                connection.session.close().await;
            }
        }
        if reaped > 0 {
            debug!(reaped, "Reaped stale idle connections");
        }
        reaped
    }

    /// Refuse new acquisitions and close every idle connection
    pub async fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut closed = 0;
        for pool in self.all_pools() {
            pool.slots.close();
            let idle = pool.take_idle(|_| true);
            closed += idle.len();
            for connection in idle {
                connection.session.close().await;
            }
        }
        info!(closed, "Connection pools drained");
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .all_pools()
            .iter()
            .map(|pool| PoolStats {
                backend_id: pool.backend_id.clone(),
                max_connections: pool.max_connections,
                in_use: pool.in_use(),
                idle: pool.idle_queue().len(),
                created: pool.counters.created.load(Ordering::Relaxed),
                reused: pool.counters.reused.load(Ordering::Relaxed),
                discarded: pool.counters.discarded.load(Ordering::Relaxed),
                timeouts: pool.counters.timeouts.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        stats
    }

    /// Periodically reap stale idle connections until shutdown
    pub async fn run_maintenance(self: Arc<Self>, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.settings.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.reap_idle().await;
                }
                _ = shutdown.wait() => {
                    debug!("Pool maintenance stopping");
                    break;
                }
            }
        }
        if !self.is_closed() {
            warn!("Pool maintenance stopped before pools were drained");
        }
    }
}
