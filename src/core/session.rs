/// Tracking of connected client sessions for the admin surface

use fnv::FnvHashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Session information
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub client_addr: SocketAddr,
    pub user: Option<String>,
    pub connected_at: SystemTime,
    pub last_activity: SystemTime,
    /// Backend that served the most recent statement
    pub last_backend: Option<String>,
    pub in_transaction: bool,
    pub statements: u64,
}

/// Registry of live client sessions
pub struct SessionManager {
    sessions: Arc<RwLock<FnvHashMap<u64, SessionInfo>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(FnvHashMap::default())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a session id and start tracking the client
    pub async fn open_session(&self, client_addr: SocketAddr) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now();
        let info = SessionInfo {
            session_id,
            client_addr,
            user: None,
            connected_at: now,
            last_activity: now,
            last_backend: None,
            in_transaction: false,
            statements: 0,
        };
        self.sessions.write().await.insert(session_id, info);
        session_id
    }

    pub async fn set_user(&self, session_id: u64, user: String) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.user = Some(user);
        }
    }

    /// Record a finished statement
    pub async fn touch(&self, session_id: u64, backend: Option<String>, in_transaction: bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            session.last_activity = SystemTime::now();
            session.statements += 1;
            session.in_transaction = in_transaction;
            if backend.is_some() {
                session.last_backend = backend;
            }
        }
    }

    pub async fn close_session(&self, session_id: u64) -> Option<SessionInfo> {
        self.sessions.write().await.remove(&session_id)
    }

    pub async fn get_session(&self, session_id: u64) -> Option<SessionInfo> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// All sessions, oldest first
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions.values().cloned().collect();
        list.sort_by_key(|s| s.session_id);
        list
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_session() {
        let manager = SessionManager::new();
        let first = manager.open_session(addr()).await;
        let second = manager.open_session(addr()).await;
        assert_ne!(first, second);
        assert_eq!(manager.session_count().await, 2);

        let closed = manager.close_session(first).await.unwrap();
        assert_eq!(closed.session_id, first);
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.close_session(first).await.is_none());
    }

    #[tokio::test]
    async fn test_touch_records_activity() {
        let manager = SessionManager::new();
        let id = manager.open_session(addr()).await;
        manager.set_user(id, "app".to_string()).await;
        manager.touch(id, Some("reader-1".to_string()), false).await;
        manager.touch(id, None, true).await;

        let info = manager.get_session(id).await.unwrap();
        assert_eq!(info.statements, 2);
        assert_eq!(info.last_backend.as_deref(), Some("reader-1"));
        assert!(info.in_transaction);
        assert_eq!(info.user.as_deref(), Some("app"));
    }
}
