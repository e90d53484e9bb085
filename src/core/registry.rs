//! Backend registry: the table of known backends, their pools and health
//!
//! The registry owns every [`Backend`]. Other components hold `Arc`s to
//! [`BackendEntry`] snapshots and read health through them. Health is the
//! only field that changes after registration, and it changes only through
//! [`BackendRegistry::update_health`], which swaps the whole [`HealthState`]
//! in a single atomic store.

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::{Backend, HealthState, PoolId, PoolRole};
use crate::error::{RutaError, RutaResult};

/// Traffic counters for one backend.
///
/// Shared between successive entries for the same backend id so that
/// administrative pool moves do not reset them.
#[derive(Debug, Default)]
pub struct BackendCounters {
    /// Connections currently lent out by the pool manager
    pub in_flight: AtomicUsize,
    pub queries: AtomicU64,
    pub errors: AtomicU64,
}

/// A registered backend plus its live health cell
#[derive(Debug)]
pub struct BackendEntry {
    backend: Backend,
    health: ArcSwap<HealthState>,
    counters: Arc<BackendCounters>,
}

impl BackendEntry {
    fn new(backend: Backend) -> Self {
        let health = HealthState::initial(backend.id.clone());
        Self {
            backend,
            health: ArcSwap::from_pointee(health),
            counters: Arc::new(BackendCounters::default()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn id(&self) -> &str {
        &self.backend.id
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.load_full()
    }

    pub fn counters(&self) -> &Arc<BackendCounters> {
        &self.counters
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Relaxed)
    }

    pub fn record_query(&self, succeeded: bool) {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A named set of backends sharing a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub id: PoolId,
    pub name: String,
    pub role: PoolRole,
    /// Backend ids in registration order
    pub members: Vec<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    backends: HashMap<String, Arc<BackendEntry>>,
    pools: BTreeMap<PoolId, PoolInfo>,
}

/// Registry of backends and pools
#[derive(Debug, Default)]
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool. Only one writer pool may exist.
    pub async fn add_pool<S: Into<String>>(
        &self,
        id: PoolId,
        name: S,
        role: PoolRole,
    ) -> RutaResult<()> {
        let mut inner = self.inner.write().await;
        if inner.pools.contains_key(&id) {
            return Err(RutaError::DuplicatePool { id });
        }
        if role == PoolRole::Writer && inner.pools.values().any(|p| p.role == PoolRole::Writer) {
            return Err(RutaError::validation(format!(
                "pool {} cannot be a writer: a writer pool already exists",
                id
            )));
        }
        inner.pools.insert(
            id,
            PoolInfo {
                id,
                name: name.into(),
                role,
                members: Vec::new(),
            },
        );
        Ok(())
    }

    /// Remove an empty pool
    pub async fn remove_pool(&self, id: PoolId) -> RutaResult<PoolInfo> {
        let mut inner = self.inner.write().await;
        match inner.pools.get(&id) {
            None => return Err(RutaError::UnknownPool { id }),
            Some(pool) if !pool.members.is_empty() => {
                return Err(RutaError::validation(format!(
                    "pool {} still has {} backends",
                    id,
                    pool.members.len()
                )));
            }
            Some(_) => {}
        }
        inner
            .pools
            .remove(&id)
            .ok_or(RutaError::UnknownPool { id })
    }

    /// Register a backend into its pool
    pub async fn register(&self, backend: Backend) -> RutaResult<Arc<BackendEntry>> {
        if backend.weight == 0 {
            return Err(RutaError::validation(format!(
                "backend {} must have a weight of at least 1",
                backend.id
            )));
        }
        if backend.max_connections == 0 {
            return Err(RutaError::validation(format!(
                "backend {} must allow at least one connection",
                backend.id
            )));
        }

        let mut inner = self.inner.write().await;
        if inner.backends.contains_key(&backend.id) {
            return Err(RutaError::DuplicateBackend { id: backend.id });
        }
        let pool_id = backend.pool_id;
        let pool = inner
            .pools
            .get_mut(&pool_id)
            .ok_or(RutaError::UnknownPool { id: pool_id })?;
        pool.members.push(backend.id.clone());

        let entry = Arc::new(BackendEntry::new(backend));
        inner
            .backends
            .insert(entry.id().to_string(), Arc::clone(&entry));

        tracing::info!(backend = %entry.id(), pool = pool_id, "Registered backend");
        Ok(entry)
    }

    /// Remove a backend from the registry
    pub async fn deregister(&self, backend_id: &str) -> RutaResult<Arc<BackendEntry>> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .backends
            .remove(backend_id)
            .ok_or_else(|| RutaError::unknown_backend(backend_id))?;
        if let Some(pool) = inner.pools.get_mut(&entry.backend.pool_id) {
            pool.members.retain(|id| id != backend_id);
        }
        tracing::info!(backend = %backend_id, "Deregistered backend");
        Ok(entry)
    }

    /// Move a backend to another pool, keeping its health and counters
    pub async fn reassign(&self, backend_id: &str, pool_id: PoolId) -> RutaResult<Arc<BackendEntry>> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(&pool_id) {
            return Err(RutaError::UnknownPool { id: pool_id });
        }
        let current = inner
            .backends
            .get(backend_id)
            .cloned()
            .ok_or_else(|| RutaError::unknown_backend(backend_id))?;
        let old_pool = current.backend.pool_id;
        if old_pool == pool_id {
            return Ok(current);
        }

        let mut backend = current.backend.clone();
        backend.pool_id = pool_id;
        let entry = Arc::new(BackendEntry {
            backend,
            health: ArcSwap::new(current.health()),
            counters: Arc::clone(&current.counters),
        });

        if let Some(pool) = inner.pools.get_mut(&old_pool) {
            pool.members.retain(|id| id != backend_id);
        }
        if let Some(pool) = inner.pools.get_mut(&pool_id) {
            pool.members.push(backend_id.to_string());
        }
        inner
            .backends
            .insert(backend_id.to_string(), Arc::clone(&entry));

        tracing::info!(backend = %backend_id, from = old_pool, to = pool_id, "Moved backend");
        Ok(entry)
    }

    /// Replace a backend's health state.
    ///
    /// Unknown ids are logged and ignored: a probe may finish after its
    /// backend was deregistered.
    pub async fn update_health(&self, backend_id: &str, state: HealthState) -> bool {
        let inner = self.inner.read().await;
        match inner.backends.get(backend_id) {
            Some(entry) => {
                entry.health.store(Arc::new(state));
                true
            }
            None => {
                tracing::debug!(backend = %backend_id, "Dropping health update for unknown backend");
                false
            }
        }
    }

    pub async fn get(&self, backend_id: &str) -> Option<Arc<BackendEntry>> {
        let inner = self.inner.read().await;
        inner.backends.get(backend_id).cloned()
    }

    pub async fn health(&self, backend_id: &str) -> Option<Arc<HealthState>> {
        self.get(backend_id).await.map(|entry| entry.health())
    }

    /// Snapshot of the backends in a pool, in registration order
    pub async fn list_by_pool(&self, pool_id: PoolId) -> Vec<Backend> {
        self.entries_in_pool(pool_id)
            .await
            .iter()
            .map(|entry| entry.backend.clone())
            .collect()
    }

    pub async fn entries_in_pool(&self, pool_id: PoolId) -> Vec<Arc<BackendEntry>> {
        let inner = self.inner.read().await;
        inner
            .pools
            .get(&pool_id)
            .map(|pool| {
                pool.members
                    .iter()
                    .filter_map(|id| inner.backends.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All entries, ordered by pool then registration order
    pub async fn all(&self) -> Vec<Arc<BackendEntry>> {
        let inner = self.inner.read().await;
        inner
            .pools
            .values()
            .flat_map(|pool| pool.members.iter())
            .filter_map(|id| inner.backends.get(id).cloned())
            .collect()
    }

    pub async fn pool(&self, pool_id: PoolId) -> Option<PoolInfo> {
        let inner = self.inner.read().await;
        inner.pools.get(&pool_id).cloned()
    }

    pub async fn pools(&self) -> Vec<PoolInfo> {
        let inner = self.inner.read().await;
        inner.pools.values().cloned().collect()
    }

    pub async fn writer_pool(&self) -> Option<PoolId> {
        let inner = self.inner.read().await;
        inner
            .pools
            .values()
            .find(|pool| pool.role == PoolRole::Writer)
            .map(|pool| pool.id)
    }

    pub async fn backend_count(&self) -> usize {
        self.inner.read().await.backends.len()
    }
}
