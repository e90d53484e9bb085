//! Query classification and backend selection
//!
//! [`Router::classify`] maps a statement to a pool through the rule table,
//! defaulting to the writer pool. [`Router::select_backend`] then picks one
//! ONLINE member of that pool. Rules and health are read fresh on every
//! call, so changes apply to the next statement.

pub mod balancer;
pub mod rules;
pub mod statement;

use std::sync::Arc;
use tracing::debug;

use crate::core::registry::{BackendEntry, BackendRegistry};
use crate::core::{PoolId, PoolRole};
use crate::error::{RutaError, RutaResult};
use balancer::{Candidate, LoadBalancingAlgorithm, Selection};
use rules::RuleTable;

/// Outcome of classifying one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub pool_id: PoolId,
    /// Rule that matched; `None` when the writer default applied
    pub rule_id: Option<u32>,
}

pub struct Router {
    registry: Arc<BackendRegistry>,
    rules: Arc<RuleTable>,
    balancer: Box<dyn LoadBalancingAlgorithm>,
}

impl Router {
    pub fn new(registry: Arc<BackendRegistry>, rules: Arc<RuleTable>, selection: Selection) -> Self {
        Self {
            registry,
            rules,
            balancer: selection.build(),
        }
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    /// Discard balancer state for a deregistered backend
    pub fn forget_backend(&self, backend_id: &str) {
        self.balancer.forget(backend_id);
    }

    /// Destination pool for a statement
    pub async fn classify(&self, sql: &str) -> RutaResult<PoolId> {
        self.classify_statement(sql).await.map(|c| c.pool_id)
    }

    pub async fn classify_statement(&self, sql: &str) -> RutaResult<Classification> {
        if let Some(matched) = self.rules.classify(sql) {
            return Ok(Classification {
                pool_id: matched.destination,
                rule_id: Some(matched.rule_id),
            });
        }
        let writer = self
            .registry
            .writer_pool()
            .await
            .ok_or_else(|| RutaError::internal("no writer pool configured"))?;
        Ok(Classification {
            pool_id: writer,
            rule_id: None,
        })
    }

    /// Pick an ONLINE backend for the pool.
    ///
    /// A reader pool whose members are all unhealthy falls back to the
    /// writer pool. A pool with no members at all, or a writer pool with
    /// nothing ONLINE, fails with `NoBackendAvailable`.
    pub async fn select_backend(&self, pool_id: PoolId) -> RutaResult<Arc<BackendEntry>> {
        let pool = self
            .registry
            .pool(pool_id)
            .await
            .ok_or(RutaError::NoBackendAvailable { pool_id })?;
        if pool.members.is_empty() {
            return Err(RutaError::NoBackendAvailable { pool_id });
        }

        let entries = self.registry.entries_in_pool(pool_id).await;
        if let Some(entry) = self.pick(&entries, None) {
            return Ok(entry);
        }

        if pool.role == PoolRole::Reader {
            if let Some(writer) = self.registry.writer_pool().await {
                let writers = self.registry.entries_in_pool(writer).await;
                if let Some(entry) = self.pick(&writers, None) {
                    debug!(pool = pool_id, backend = %entry.id(), "No ONLINE reader, using writer");
                    return Ok(entry);
                }
            }
        }
        Err(RutaError::NoBackendAvailable { pool_id })
    }

    /// Another ONLINE backend of the same pool, without writer fallback
    pub async fn select_backend_excluding(
        &self,
        pool_id: PoolId,
        exclude: &str,
    ) -> RutaResult<Arc<BackendEntry>> {
        let entries = self.registry.entries_in_pool(pool_id).await;
        self.pick(&entries, Some(exclude))
            .ok_or(RutaError::NoBackendAvailable { pool_id })
    }

    /// An ONLINE backend from any pool, for statements that only touch
    /// session state
    pub async fn select_any_online(&self) -> Option<Arc<BackendEntry>> {
        let entries = self.registry.all().await;
        self.pick(&entries, None)
    }

    fn pick(&self, entries: &[Arc<BackendEntry>], exclude: Option<&str>) -> Option<Arc<BackendEntry>> {
        let eligible: Vec<&Arc<BackendEntry>> = entries
            .iter()
            .filter(|e| e.health().is_online() && Some(e.id()) != exclude)
            .collect();
        let candidates: Vec<Candidate> = eligible
            .iter()
            .map(|e| Candidate::new(e.id(), e.backend().weight, e.in_flight()))
            .collect();
        let index = self.balancer.select(&candidates)?;
        eligible.get(index).map(|e| Arc::clone(e))
    }
}
