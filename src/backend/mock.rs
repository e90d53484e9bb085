//! In-memory backend used by the pool, monitor, router and session tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{BackendConnector, BackendSession, ColumnInfo, ColumnType, QueryOutcome};
use crate::core::registry::BackendRegistry;
use crate::core::{Backend, PoolRole};
use crate::error::{RutaError, RutaResult};
use crate::routing::rules::{RoutingRule, RuleMatcher, RuleTable};
use crate::routing::statement;

/// Statements containing this marker fail with a SQL error
pub(crate) const SQL_ERROR_MARKER: &str = "trigger_sql_error";

#[derive(Debug, Default)]
pub(crate) struct MockState {
    /// (backend id, statement) in execution order
    pub executed: Vec<(String, String)>,
    pub unreachable: HashSet<String>,
    /// Backends whose sessions fail every statement with a transport error
    pub failing: HashSet<String>,
    pub read_only: HashMap<String, bool>,
    pub lag: HashMap<String, Option<u64>>,
    /// Backends that never answer a connect, ping or statement
    pub hanging: HashSet<String>,
    pub connects: usize,
    pub closes: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state<F: FnOnce(&mut MockState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }

    pub fn set_unreachable(&self, backend_id: &str, unreachable: bool) {
        self.with_state(|s| {
            if unreachable {
                s.unreachable.insert(backend_id.to_string());
            } else {
                s.unreachable.remove(backend_id);
            }
        });
    }

    pub fn set_failing(&self, backend_id: &str, failing: bool) {
        self.with_state(|s| {
            if failing {
                s.failing.insert(backend_id.to_string());
            } else {
                s.failing.remove(backend_id);
            }
        });
    }

    pub fn set_hanging(&self, backend_id: &str, hanging: bool) {
        self.with_state(|s| {
            if hanging {
                s.hanging.insert(backend_id.to_string());
            } else {
                s.hanging.remove(backend_id);
            }
        });
    }

    pub fn set_lag(&self, backend_id: &str, lag: Option<u64>) {
        self.with_state(|s| {
            s.lag.insert(backend_id.to_string(), lag);
        });
    }

    pub fn set_read_only(&self, backend_id: &str, read_only: bool) {
        self.with_state(|s| {
            s.read_only.insert(backend_id.to_string(), read_only);
        });
    }

    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().executed.clone()
    }

    /// Backends that ran the given statement, in order
    pub fn served_by(&self, sql: &str) -> Vec<String> {
        self.executed()
            .into_iter()
            .filter(|(_, s)| s == sql)
            .map(|(backend, _)| backend)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(&self, backend: &Backend) -> RutaResult<Box<dyn BackendSession>> {
        stall_if_hanging(&self.state, &backend.id).await;
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(&backend.id) {
            return Err(RutaError::backend(format!("{}: connection refused", backend.address)));
        }
        state.connects += 1;
        Ok(Box::new(MockSession {
            backend_id: backend.id.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

async fn stall_if_hanging(state: &Mutex<MockState>, backend_id: &str) {
    let hanging = state.lock().unwrap().hanging.contains(backend_id);
    if hanging {
        std::future::pending::<()>().await;
    }
}

struct MockSession {
    backend_id: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn check_alive(&self, state: &MockState) -> RutaResult<()> {
        if state.unreachable.contains(&self.backend_id) || state.failing.contains(&self.backend_id)
        {
            return Err(RutaError::backend("Lost connection to MySQL server during query"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendSession for MockSession {
    async fn execute(&mut self, sql: &str) -> RutaResult<QueryOutcome> {
        stall_if_hanging(&self.state, &self.backend_id).await;
        let mut state = self.state.lock().unwrap();
        self.check_alive(&state)?;
        state
            .executed
            .push((self.backend_id.clone(), sql.to_string()));

        if sql.contains(SQL_ERROR_MARKER) {
            return Err(RutaError::Query {
                code: 1064,
                sql_state: "42000".to_string(),
                message: "You have an error in your SQL syntax".to_string(),
            });
        }

        if statement::is_read_statement(sql) {
            Ok(QueryOutcome::ResultSet {
                columns: vec![ColumnInfo::new("served_by", ColumnType::VarString)],
                rows: vec![vec![Some(Bytes::from(self.backend_id.clone()))]],
            })
        } else {
            Ok(QueryOutcome::Modified {
                affected_rows: 1,
                last_insert_id: 0,
            })
        }
    }

    async fn ping(&mut self) -> RutaResult<()> {
        stall_if_hanging(&self.state, &self.backend_id).await;
        let state = self.state.lock().unwrap();
        if state.unreachable.contains(&self.backend_id) {
            return Err(RutaError::backend("ping failed"));
        }
        Ok(())
    }

    async fn read_only(&mut self) -> RutaResult<bool> {
        let state = self.state.lock().unwrap();
        self.check_alive(&state)?;
        Ok(state.read_only.get(&self.backend_id).copied().unwrap_or(false))
    }

    async fn replication_lag(&mut self) -> RutaResult<Option<u64>> {
        let state = self.state.lock().unwrap();
        self.check_alive(&state)?;
        Ok(state.lag.get(&self.backend_id).copied().unwrap_or(Some(0)))
    }

    async fn close(self: Box<Self>) {
        self.state.lock().unwrap().closes += 1;
    }
}

/// Writer pool 10 with `writer`, reader pool 20 with `reader-1` and `reader-2`
pub(crate) async fn demo_registry() -> Arc<BackendRegistry> {
    let registry = Arc::new(BackendRegistry::new());
    registry.add_pool(10, "writer", PoolRole::Writer).await.unwrap();
    registry.add_pool(20, "readers", PoolRole::Reader).await.unwrap();
    registry
        .register(Backend::new("writer", "10.0.0.10:3306", 10).with_max_connections(4))
        .await
        .unwrap();
    for id in ["reader-1", "reader-2"] {
        registry
            .register(Backend::new(id, format!("{}:3306", id), 20).with_max_connections(4))
            .await
            .unwrap();
    }
    registry
}

/// `SELECT ... FOR UPDATE` to the writer, other `SELECT`s to the readers
pub(crate) fn demo_rules() -> RuleTable {
    let table = RuleTable::new();
    table
        .add(RoutingRule::new(
            1,
            RuleMatcher::regex(r"^SELECT.*FOR UPDATE").unwrap(),
            10,
        ))
        .unwrap();
    table
        .add(RoutingRule::new(2, RuleMatcher::regex(r"^SELECT").unwrap(), 20))
        .unwrap();
    table
}
