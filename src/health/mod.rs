/// Health monitoring for pooled MySQL backends
///
/// One task per backend probes liveness on `ping_interval`, plus the
/// `read_only` flag for writers or replication lag for readers on their own
/// intervals. Results feed [`evaluate`], and the resulting state replaces
/// the backend's health in the registry. Probe failures never leave this
/// module.
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;

use crate::backend::{BackendConnector, BackendSession};
use crate::core::registry::{BackendEntry, BackendRegistry};
use crate::core::{HealthState, HealthStatus, PoolRole};
use crate::error::RutaError;
use crate::pool::ConnectionPoolManager;
use crate::utils::Shutdown;

/// Probe scheduling and health thresholds
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub ping_interval: Duration,
    pub read_only_interval: Duration,
    pub replication_lag_interval: Duration,
    /// Connect plus response deadline for a single probe
    pub probe_timeout: Duration,
    /// Consecutive failures before a backend goes OFFLINE
    pub failure_threshold: u32,
    pub max_replication_lag_sec: u64,
    /// Lag assumed when replication reports NULL
    pub lag_when_null_sec: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            read_only_interval: Duration::from_millis(1500),
            replication_lag_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(1),
            failure_threshold: 3,
            max_replication_lag_sec: 5,
            lag_when_null_sec: 60,
        }
    }
}

/// What a probe checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Ping,
    ReadOnly,
    ReplicationLag,
}

impl ProbeKind {
    /// Whether this probe is meaningful for a member of a pool with `role`
    pub fn applies_to(self, role: PoolRole) -> bool {
        match self {
            ProbeKind::Ping => true,
            ProbeKind::ReadOnly => role == PoolRole::Writer,
            ProbeKind::ReplicationLag => role == PoolRole::Reader,
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    ReadOnly(bool),
    /// `None` when the server reports NULL lag
    Lag(Option<u64>),
    Unreachable(String),
}

/// Compute the next health state from the previous one and a probe result.
///
/// A failure increments `consecutive_failures` and degrades the backend,
/// escalating to OFFLINE at the threshold. Any success resets the counter;
/// the status is then derived from the last known `read_only` flag (writers)
/// or replication lag (readers).
pub fn evaluate(
    prev: &HealthState,
    outcome: &ProbeOutcome,
    role: PoolRole,
    lag_threshold: u64,
    settings: &MonitorSettings,
) -> HealthState {
    let mut next = prev.clone();
    next.last_check_time = Some(SystemTime::now());

    match outcome {
        ProbeOutcome::Unreachable(reason) => {
            next.consecutive_failures = prev.consecutive_failures.saturating_add(1);
            next.last_error = Some(reason.clone());
            next.status = if prev.status == HealthStatus::Offline
                || next.consecutive_failures >= settings.failure_threshold
            {
                HealthStatus::Offline
            } else {
                HealthStatus::Degraded
            };
            return next;
        }
        ProbeOutcome::Alive => {}
        ProbeOutcome::ReadOnly(read_only) => next.read_only = Some(*read_only),
        ProbeOutcome::Lag(lag) => {
            next.replication_lag_seconds = Some(lag.unwrap_or(settings.lag_when_null_sec))
        }
    }

    next.consecutive_failures = 0;
    next.last_error = None;
    next.status = match role {
        PoolRole::Writer if next.read_only == Some(true) => HealthStatus::Offline,
        PoolRole::Reader
            if next
                .replication_lag_seconds
                .map_or(false, |lag| lag > lag_threshold) =>
        {
            HealthStatus::Degraded
        }
        _ => HealthStatus::Online,
    };
    next
}

/// Background prober for every registered backend
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    pools: Arc<ConnectionPoolManager>,
    connector: Arc<dyn BackendConnector>,
    settings: MonitorSettings,
    shutdown: Shutdown,
    watched: Mutex<HashSet<String>>,
    alerts: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<BackendRegistry>,
        pools: Arc<ConnectionPoolManager>,
        connector: Arc<dyn BackendConnector>,
        settings: MonitorSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            registry,
            pools,
            connector,
            settings,
            shutdown,
            watched: Mutex::new(HashSet::new()),
            alerts: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Writer read-only alerts raised since startup
    pub fn alerts(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }

    /// Start a probe task for every registered backend
    pub async fn spawn_all(self: &Arc<Self>) -> usize {
        let entries = self.registry.all().await;
        let started = entries
            .iter()
            .filter(|entry| self.watch(entry.id()))
            .count();
        tracing::info!(backends = started, "Health monitor started");
        started
    }

    /// Start a probe task for one backend unless it already has one
    pub fn watch(self: &Arc<Self>, backend_id: &str) -> bool {
        {
            let mut watched = match self.watched.lock() {
                Ok(watched) => watched,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !watched.insert(backend_id.to_string()) {
                return false;
            }
        }
        let monitor = Arc::clone(self);
        let backend_id = backend_id.to_string();
        tokio::spawn(async move { monitor.run_backend(backend_id).await });
        true
    }

    async fn run_backend(self: Arc<Self>, backend_id: String) {
        let mut ping = ticker(self.settings.ping_interval);
        let mut read_only = ticker(self.settings.read_only_interval);
        let mut lag = ticker(self.settings.replication_lag_interval);
        let mut session: Option<Box<dyn BackendSession>> = None;

        tracing::debug!(backend = %backend_id, "Starting health probes");
        loop {
            let kind = tokio::select! {
                _ = ping.tick() => ProbeKind::Ping,
                _ = read_only.tick() => ProbeKind::ReadOnly,
                _ = lag.tick() => ProbeKind::ReplicationLag,
                _ = self.shutdown.wait() => break,
            };

            let entry = match self.registry.get(&backend_id).await {
                Some(entry) => entry,
                None => {
                    tracing::debug!(backend = %backend_id, "Backend removed, stopping health probes");
                    break;
                }
            };
            let role = match self.registry.pool(entry.backend().pool_id).await {
                Some(pool) => pool.role,
                None => continue,
            };
            if !kind.applies_to(role) {
                continue;
            }

            let outcome = self.probe(&entry, &mut session, kind).await;
            self.apply(&entry, role, outcome).await;
        }

        if let Some(session) = session.take() {
            session.close().await;
        }
        self.release_watch(&backend_id).await;
    }

    /// Forget a finished probe task. A backend re-added while the task was
    /// winding down gets a new one.
    async fn release_watch(self: &Arc<Self>, backend_id: &str) {
        if let Ok(mut watched) = self.watched.lock() {
            watched.remove(backend_id);
        }
        if !self.shutdown.is_triggered() && self.registry.get(backend_id).await.is_some() {
            tracing::debug!(backend = %backend_id, "Backend re-added, restarting health probes");
            self.watch(backend_id);
        }
    }

    /// Run one probe on a fresh monitor connection and apply its result
    pub async fn probe_once(&self, backend_id: &str, kind: ProbeKind) -> Option<HealthState> {
        let entry = self.registry.get(backend_id).await?;
        let role = self.registry.pool(entry.backend().pool_id).await?.role;
        let mut session = None;
        let outcome = self.probe(&entry, &mut session, kind).await;
        if let Some(session) = session {
            session.close().await;
        }
        self.apply(&entry, role, outcome).await;
        self.registry.health(backend_id).await.map(|h| (*h).clone())
    }

    async fn probe(
        &self,
        entry: &BackendEntry,
        session: &mut Option<Box<dyn BackendSession>>,
        kind: ProbeKind,
    ) -> ProbeOutcome {
        let deadline = self.settings.probe_timeout;
        let result = tokio::time::timeout(deadline, async {
            if session.is_none() {
                *session = Some(self.connector.connect(entry.backend()).await?);
            }
            let active = session
                .as_mut()
                .ok_or_else(|| RutaError::internal("monitor session missing"))?;
            match kind {
                ProbeKind::Ping => active.ping().await.map(|_| ProbeOutcome::Alive),
                ProbeKind::ReadOnly => active.read_only().await.map(ProbeOutcome::ReadOnly),
                ProbeKind::ReplicationLag => {
                    active.replication_lag().await.map(ProbeOutcome::Lag)
                }
            }
        })
        .await;

        let failure = match result {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => {
                if e.is_connection_fault() {
                    if let Some(broken) = session.take() {
                        broken.close().await;
                    }
                }
                RutaError::unreachable(entry.id(), e.to_string())
            }
            Err(_) => {
                // The session may be mid-response; never reuse it
                *session = None;
                RutaError::unreachable(entry.id(), format!("probe timed out after {:?}", deadline))
            }
        };
        tracing::debug!(probe = ?kind, error = %failure, "Health probe failed");
        ProbeOutcome::Unreachable(failure.to_string())
    }

    async fn apply(&self, entry: &BackendEntry, role: PoolRole, outcome: ProbeOutcome) {
        let backend_id = entry.id();
        let prev = entry.health();
        let threshold = entry
            .backend()
            .max_replication_lag_sec
            .unwrap_or(self.settings.max_replication_lag_sec);
        let next = evaluate(&prev, &outcome, role, threshold, &self.settings);

        let flipped_read_only = role == PoolRole::Writer
            && next.read_only == Some(true)
            && prev.read_only != Some(true);
        let went_offline = next.status == HealthStatus::Offline && prev.status != HealthStatus::Offline;
        let changed = next.status != prev.status;

        if changed {
            tracing::warn!(
                backend = %backend_id,
                from = %prev.status,
                to = %next.status,
                failures = next.consecutive_failures,
                lag = ?next.replication_lag_seconds,
                error = ?next.last_error,
                "Backend health changed"
            );
        }
        if flipped_read_only {
            self.alerts.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                backend = %backend_id,
                alert = true,
                "Writer reports read_only=ON, taking it OFFLINE"
            );
        }

        self.registry.update_health(backend_id, next).await;

        if went_offline {
            self.pools.evict(backend_id).await;
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{demo_registry, MockConnector};
    use crate::core::Backend;
    use crate::pool::PoolSettings;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            ping_interval: Duration::from_millis(10),
            read_only_interval: Duration::from_millis(10),
            replication_lag_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(200),
            ..MonitorSettings::default()
        }
    }

    async fn monitor() -> (Arc<HealthMonitor>, MockConnector, Arc<BackendRegistry>, Arc<ConnectionPoolManager>, Shutdown) {
        let registry = demo_registry().await;
        let connector = MockConnector::new();
        let pools = Arc::new(ConnectionPoolManager::new(
            Arc::clone(&registry),
            Arc::new(connector.clone()),
            PoolSettings::default(),
        ));
        let shutdown = Shutdown::new();
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&pools),
            Arc::new(connector.clone()),
            settings(),
            shutdown.clone(),
        ));
        (monitor, connector, registry, pools, shutdown)
    }

    #[test]
    fn test_failures_escalate_to_offline() {
        let settings = MonitorSettings::default();
        let down = ProbeOutcome::Unreachable("connection refused".to_string());
        let first = evaluate(&HealthState::initial("r1"), &down, PoolRole::Reader, 5, &settings);
        assert_eq!(first.status, HealthStatus::Degraded);
        assert_eq!(first.consecutive_failures, 1);
        assert_eq!(first.last_error.as_deref(), Some("connection refused"));

        let second = evaluate(&first, &down, PoolRole::Reader, 5, &settings);
        assert_eq!(second.status, HealthStatus::Degraded);
        let third = evaluate(&second, &down, PoolRole::Reader, 5, &settings);
        assert_eq!(third.status, HealthStatus::Offline);

        let recovered = evaluate(&third, &ProbeOutcome::Alive, PoolRole::Reader, 5, &settings);
        assert_eq!(recovered.status, HealthStatus::Online);
        assert_eq!(recovered.consecutive_failures, 0);
        assert!(recovered.last_error.is_none());
    }

    #[test]
    fn test_offline_stays_offline_until_success() {
        let settings = MonitorSettings::default();
        let offline = HealthState::initial("w").with_status(HealthStatus::Offline);
        let next = evaluate(
            &offline,
            &ProbeOutcome::Unreachable("timeout".to_string()),
            PoolRole::Writer,
            5,
            &settings,
        );
        assert_eq!(next.status, HealthStatus::Offline);
    }

    #[test]
    fn test_replication_lag_thresholds() {
        let settings = MonitorSettings::default();
        let state = HealthState::initial("r1");
        let lagging = evaluate(&state, &ProbeOutcome::Lag(Some(10)), PoolRole::Reader, 5, &settings);
        assert_eq!(lagging.status, HealthStatus::Degraded);
        assert_eq!(lagging.replication_lag_seconds, Some(10));

        let caught_up = evaluate(&lagging, &ProbeOutcome::Lag(Some(5)), PoolRole::Reader, 5, &settings);
        assert_eq!(caught_up.status, HealthStatus::Online);

        // A successful ping keeps the last observed lag in force
        let pinged = evaluate(&lagging, &ProbeOutcome::Alive, PoolRole::Reader, 5, &settings);
        assert_eq!(pinged.status, HealthStatus::Degraded);

        let stopped = evaluate(&state, &ProbeOutcome::Lag(None), PoolRole::Reader, 5, &settings);
        assert_eq!(stopped.replication_lag_seconds, Some(60));
        assert_eq!(stopped.status, HealthStatus::Degraded);

        let relaxed = evaluate(&state, &ProbeOutcome::Lag(Some(10)), PoolRole::Reader, 30, &settings);
        assert_eq!(relaxed.status, HealthStatus::Online);
    }

    #[test]
    fn test_writer_read_only_flip() {
        let settings = MonitorSettings::default();
        let state = HealthState::initial("w");
        let flipped = evaluate(&state, &ProbeOutcome::ReadOnly(true), PoolRole::Writer, 5, &settings);
        assert_eq!(flipped.status, HealthStatus::Offline);
        assert_eq!(flipped.read_only, Some(true));

        let still = evaluate(&flipped, &ProbeOutcome::Alive, PoolRole::Writer, 5, &settings);
        assert_eq!(still.status, HealthStatus::Offline);

        let restored = evaluate(&still, &ProbeOutcome::ReadOnly(false), PoolRole::Writer, 5, &settings);
        assert_eq!(restored.status, HealthStatus::Online);

        // Readers are expected to be read-only
        let reader = evaluate(&state, &ProbeOutcome::ReadOnly(true), PoolRole::Reader, 5, &settings);
        assert_eq!(reader.status, HealthStatus::Online);
    }

    #[test]
    fn test_probe_kinds_per_role() {
        assert!(ProbeKind::Ping.applies_to(PoolRole::Writer));
        assert!(ProbeKind::ReadOnly.applies_to(PoolRole::Writer));
        assert!(!ProbeKind::ReadOnly.applies_to(PoolRole::Reader));
        assert!(ProbeKind::ReplicationLag.applies_to(PoolRole::Reader));
        assert!(!ProbeKind::ReplicationLag.applies_to(PoolRole::Writer));
    }

    #[tokio::test]
    async fn test_probe_once_marks_lagging_reader() {
        let (monitor, connector, registry, _, _) = monitor().await;
        connector.set_lag("reader-1", Some(10));
        let state = monitor
            .probe_once("reader-1", ProbeKind::ReplicationLag)
            .await
            .unwrap();
        assert_eq!(state.status, HealthStatus::Degraded);

        connector.set_lag("reader-1", Some(2));
        monitor
            .probe_once("reader-1", ProbeKind::ReplicationLag)
            .await
            .unwrap();
        assert!(registry.health("reader-1").await.unwrap().is_online());
    }

    #[tokio::test]
    async fn test_per_backend_lag_override() {
        let (monitor, connector, registry, _, _) = monitor().await;
        let mut relaxed = Backend::new("reader-3", "reader-3:3306", 20);
        relaxed.max_replication_lag_sec = Some(30);
        registry.register(relaxed).await.unwrap();
        connector.set_lag("reader-3", Some(10));

        let state = monitor
            .probe_once("reader-3", ProbeKind::ReplicationLag)
            .await
            .unwrap();
        assert_eq!(state.status, HealthStatus::Online);
    }

    #[tokio::test]
    async fn test_offline_evicts_idle_connections() {
        let (monitor, connector, _, pools, _) = monitor().await;
        let conn = pools.acquire("reader-2", Duration::from_secs(1)).await.unwrap();
        pools.release(conn).await;
        assert_eq!(pools.stats()[0].idle, 1);

        connector.set_unreachable("reader-2", true);
        for _ in 0..3 {
            monitor.probe_once("reader-2", ProbeKind::Ping).await.unwrap();
        }
        let state = monitor.probe_once("reader-2", ProbeKind::Ping).await.unwrap();
        assert_eq!(state.status, HealthStatus::Offline);
        assert_eq!(pools.stats()[0].idle, 0);
    }

    #[tokio::test]
    async fn test_degraded_keeps_idle_connections() {
        let (monitor, connector, _, pools, _) = monitor().await;
        let conn = pools.acquire("reader-1", Duration::from_secs(1)).await.unwrap();
        pools.release(conn).await;

        connector.set_lag("reader-1", Some(30));
        monitor.probe_once("reader-1", ProbeKind::ReplicationLag).await.unwrap();
        assert_eq!(pools.stats()[0].idle, 1);
    }

    #[tokio::test]
    async fn test_writer_read_only_raises_alert() {
        let (monitor, connector, _, _, _) = monitor().await;
        connector.set_read_only("writer", true);
        let state = monitor.probe_once("writer", ProbeKind::ReadOnly).await.unwrap();
        assert_eq!(state.status, HealthStatus::Offline);
        assert_eq!(monitor.alerts(), 1);

        // No second alert while the flag stays on
        monitor.probe_once("writer", ProbeKind::ReadOnly).await.unwrap();
        assert_eq!(monitor.alerts(), 1);
    }

    #[tokio::test]
    async fn test_hung_backend_check_times_out() {
        let (monitor, connector, _, _, _) = monitor().await;
        connector.set_hanging("reader-1", true);
        let state = monitor.probe_once("reader-1", ProbeKind::Ping).await.unwrap();
        assert_eq!(state.status, HealthStatus::Degraded);
        assert_eq!(state.consecutive_failures, 1);
        let error = state.last_error.unwrap();
        assert!(error.contains("reader-1 unreachable"), "{}", error);
        assert!(error.contains("timed out"), "{}", error);

        connector.set_hanging("reader-1", false);
        let state = monitor.probe_once("reader-1", ProbeKind::Ping).await.unwrap();
        assert_eq!(state.status, HealthStatus::Online);
    }

    #[tokio::test]
    async fn test_readded_backend_is_watched_again() {
        let (monitor, connector, registry, _, shutdown) = monitor().await;
        // A finished task for reader-1 has not released its slot yet
        monitor.watched.lock().unwrap().insert("reader-1".to_string());
        assert!(!monitor.watch("reader-1"));

        connector.set_lag("reader-1", Some(10));
        monitor.release_watch("reader-1").await;
        assert!(monitor.watched.lock().unwrap().contains("reader-1"));

        let mut degraded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.health("reader-1").await.unwrap().status == HealthStatus::Degraded {
                degraded = true;
                break;
            }
        }
        assert!(degraded);

        // Removed backends are not restarted
        registry.deregister("reader-2").await.unwrap();
        monitor.watched.lock().unwrap().insert("reader-2".to_string());
        monitor.release_watch("reader-2").await;
        assert!(!monitor.watched.lock().unwrap().contains("reader-2"));

        shutdown.trigger();
    }

    #[tokio::test]
    async fn test_background_tasks_track_lag_and_stop() {
        let (monitor, connector, registry, _, shutdown) = monitor().await;
        connector.set_lag("reader-1", Some(10));
        assert_eq!(monitor.spawn_all().await, 3);
        assert!(!monitor.watch("reader-1"));

        let mut degraded = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.health("reader-1").await.unwrap().status == HealthStatus::Degraded {
                degraded = true;
                break;
            }
        }
        assert!(degraded);
        assert!(registry.health("reader-2").await.unwrap().is_online());

        shutdown.trigger();
        for _ in 0..50 {
            if monitor.watched.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.watched.lock().unwrap().is_empty());
    }
}
