//! Serialises refresh/reconcile cycles between the control API and the
//! background loops, and remembers how the last ones went.

use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;

use veil_core::{PeerId, RecordError};

use crate::reconciler::{ReconcileError, ReconcileReport, TunnelReconciler};
use crate::registry::{PeerRegistry, RegistryError};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("refresh failed: {0}")]
    Refresh(#[from] RegistryError),
    #[error("reconcile failed: {0}")]
    Reconcile(#[from] ReconcileError),
}

/// Result of a manual reload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    /// Whether the refresh published a new snapshot.
    pub changed: bool,
    pub revision: u64,
    pub installed: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub ok: bool,
    /// Unix seconds.
    pub at: u64,
    pub revision: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub revision: u64,
    pub local: Option<PeerId>,
    pub peers: usize,
    pub remotes: usize,
    pub warnings: Vec<RecordError>,
    pub tunnels: Vec<PeerId>,
    pub daemon_healthy: bool,
    pub daemon_generation: u64,
    pub last_reconcile: Option<ReconcileOutcome>,
    pub last_refresh_error: Option<String>,
    pub uptime_secs: u64,
}

#[derive(Default)]
struct History {
    last_reconcile: Option<ReconcileOutcome>,
    last_refresh_error: Option<String>,
}

pub struct Coordinator {
    registry: PeerRegistry,
    reconciler: TunnelReconciler,
    cycle: Mutex<()>,
    history: StdMutex<History>,
    reconcile_interval: Duration,
    refresh_interval: Option<Duration>,
    started: Instant,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Coordinator {
    pub fn new(registry: PeerRegistry, reconciler: TunnelReconciler) -> Self {
        Self {
            registry,
            reconciler,
            cycle: Mutex::new(()),
            history: StdMutex::new(History::default()),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            refresh_interval: None,
            started: Instant::now(),
        }
    }

    /// Idle timeout after which the reconcile loop runs without a registry change.
    pub fn reconcile_every(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Periodic host file re-read; `None` leaves refreshes to the API.
    pub fn refresh_every(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh_recorded(&self) -> Result<bool, RegistryError> {
        let result = self.registry.refresh().await;
        self.history().last_refresh_error = result.as_ref().err().map(|e| e.to_string());
        result
    }

    async fn reconcile_recorded(&self) -> Result<ReconcileReport, ReconcileError> {
        let result = self.reconciler.reconcile().await;
        let outcome = match &result {
            Ok(report) => ReconcileOutcome {
                ok: true,
                at: unix_now(),
                revision: Some(report.revision),
                error: None,
            },
            Err(e) => ReconcileOutcome {
                ok: false,
                at: unix_now(),
                revision: match e {
                    ReconcileError::Apply { revision, .. } => Some(*revision),
                    ReconcileError::DaemonUnhealthy => None,
                },
                error: Some(e.to_string()),
            },
        };
        self.history().last_reconcile = Some(outcome);
        result
    }

    /// Refresh the registry, then reconcile, as one serialised cycle.
    pub async fn reload(&self) -> Result<ReloadReport, CoordinatorError> {
        let _cycle = self.cycle.lock().await;

        let changed = self.refresh_recorded().await?;
        let report = self.reconcile_recorded().await?;

        tracing::info!(
            changed,
            revision = report.revision,
            installed = report.installed.len(),
            removed = report.removed.len(),
            "reload complete"
        );
        Ok(ReloadReport {
            changed,
            revision: report.revision,
            installed: report.installed,
            removed: report.removed,
        })
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let _cycle = self.cycle.lock().await;
        self.reconcile_recorded().await
    }

    /// Reconcile on every registry change and every daemon restart, and after
    /// `reconcile_every` of silence so failed passes are retried. Returns only
    /// if the registry is gone.
    pub async fn run_reconcile_loop(&self) {
        let mut changes = self.registry.subscribe();
        let mut restarts = self.reconciler.daemon().generations();
        loop {
            tokio::select! {
                changed = changes.changed() => match changed {
                    Some(revision) => tracing::debug!(revision, "registry changed"),
                    None => {
                        tracing::warn!("registry closed, reconcile loop exiting");
                        return;
                    }
                },
                Ok(()) = restarts.changed() => {
                    let generation = *restarts.borrow_and_update();
                    tracing::info!(generation, "tunnel daemon restarted, reconciling");
                }
                _ = tokio::time::sleep(self.reconcile_interval) => tracing::trace!("periodic reconcile"),
            }
            if let Err(e) = self.reconcile().await {
                tracing::warn!(error = %e, "reconcile failed, will retry");
            }
        }
    }

    /// Re-read the host file on a fixed interval. Never returns when disabled.
    pub async fn run_refresh_loop(&self) {
        let Some(interval) = self.refresh_interval else {
            return std::future::pending().await;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.refresh_recorded().await {
                Ok(true) => tracing::debug!(revision = self.registry.revision(), "host file changed"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "host file refresh failed, keeping previous snapshot"),
            }
        }
    }

    /// Never waits for a cycle in progress.
    pub fn status(&self) -> Status {
        let snapshot = self.registry.current();
        let tunnels = self.reconciler.applied_peers();
        let daemon = self.reconciler.daemon();
        let history = self.history();
        Status {
            revision: snapshot.revision,
            local: snapshot.local().map(|p| p.id.clone()),
            peers: snapshot.peers.len(),
            remotes: snapshot.remotes().count(),
            warnings: snapshot.warnings.clone(),
            tunnels,
            daemon_healthy: daemon.healthy(),
            daemon_generation: daemon.generation(),
            last_reconcile: history.last_reconcile.clone(),
            last_refresh_error: history.last_refresh_error.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
