//! Keeps the tunnel daemon's loaded tunnels equal to what the latest registry
//! snapshot calls for.
//!
//! Each [`TunnelReconciler::reconcile`] call diffs the desired descriptors
//! against the set applied by the last successful call and pushes only the
//! delta. Teardowns always run before installs so a replaced peer never has
//! old and new tunnels up together. A failed pass leaves the applied set as it
//! was; every daemon operation is idempotent, so the next pass simply repeats
//! the outstanding work. Retrying is the caller's business.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use serde::Serialize;
use tokio::sync::Mutex;

use veil_core::PeerId;

use crate::daemon::TunnelDaemon;
use crate::registry::PeerRegistry;
use crate::tunnel::{desired_tunnels, diff, TunnelSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Registry revision the pass worked from.
    pub revision: u64,
    pub installed: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelOp {
    Install,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelFailure {
    pub peer_id: PeerId,
    pub op: TunnelOp,
    pub error: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    #[error("tunnel daemon is not running")]
    DaemonUnhealthy,
    #[error("{} tunnel operation(s) failed at revision {revision}: {}", .failures.len(), summarize(.failures))]
    Apply {
        revision: u64,
        failures: Vec<TunnelFailure>,
    },
}

fn summarize(failures: &[TunnelFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{:?} {}: {}", f.op, f.peer_id, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

struct Applied {
    /// Daemon generation the set was applied to.
    generation: u64,
    tunnels: TunnelSet,
}

pub struct TunnelReconciler {
    registry: PeerRegistry,
    daemon: Arc<dyn TunnelDaemon>,
    applied: Mutex<Applied>,
    /// Peer ids of `applied`, readable while a pass holds the lock.
    applied_ids: StdMutex<Vec<PeerId>>,
}

impl TunnelReconciler {
    pub fn new(registry: PeerRegistry, daemon: Arc<dyn TunnelDaemon>) -> Self {
        Self {
            registry,
            daemon,
            applied: Mutex::new(Applied {
                generation: 0,
                tunnels: TunnelSet::new(),
            }),
            applied_ids: StdMutex::new(Vec::new()),
        }
    }

    pub fn daemon(&self) -> &Arc<dyn TunnelDaemon> {
        &self.daemon
    }

    /// Peers with a tunnel recorded as applied. Does not wait for a running pass.
    pub fn applied_peers(&self) -> Vec<PeerId> {
        self.applied_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_applied(&self, applied: &Applied) {
        *self.applied_ids.lock().unwrap_or_else(PoisonError::into_inner) =
            applied.tunnels.keys().cloned().collect();
    }

    /// Bring the daemon in line with the current snapshot.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let mut applied = self.applied.lock().await;

        if !self.daemon.healthy() {
            return Err(ReconcileError::DaemonUnhealthy);
        }

        let generation = self.daemon.generation();
        if generation != applied.generation {
            if !applied.tunnels.is_empty() {
                tracing::info!(
                    previous = applied.generation,
                    generation,
                    tunnels = applied.tunnels.len(),
                    "tunnel daemon restarted, reinstalling every tunnel"
                );
            }
            applied.tunnels.clear();
            applied.generation = generation;
            self.record_applied(&applied);
        }

        let snapshot = self.registry.current();
        let desired = desired_tunnels(&snapshot);
        let plan = diff(&applied.tunnels, &desired);

        let mut report = ReconcileReport {
            revision: snapshot.revision,
            ..ReconcileReport::default()
        };
        if plan.is_empty() {
            tracing::debug!(revision = snapshot.revision, "tunnels up to date");
            return Ok(report);
        }

        let mut failures = Vec::new();
        let mut blocked = HashSet::new();

        for tunnel in &plan.teardown {
            match self.daemon.teardown(tunnel).await {
                Ok(()) => {
                    tracing::info!(peer = %tunnel.peer_id, remote = %tunnel.remote_endpoint, "tunnel removed");
                    report.removed.push(tunnel.peer_id.clone());
                }
                Err(e) => {
                    tracing::warn!(peer = %tunnel.peer_id, error = %e, "tunnel teardown failed");
                    blocked.insert(tunnel.peer_id.clone());
                    failures.push(TunnelFailure {
                        peer_id: tunnel.peer_id.clone(),
                        op: TunnelOp::Teardown,
                        error: e.to_string(),
                    });
                }
            }
        }

        for tunnel in &plan.install {
            // Installing next to a tunnel we failed to remove would leave both up.
            if blocked.contains(&tunnel.peer_id) {
                continue;
            }
            match self.daemon.install(tunnel).await {
                Ok(()) => {
                    tracing::info!(
                        peer = %tunnel.peer_id,
                        remote = %tunnel.remote_endpoint,
                        subnets = tunnel.remote_subnets.len(),
                        "tunnel installed"
                    );
                    report.installed.push(tunnel.peer_id.clone());
                }
                Err(e) => {
                    tracing::warn!(peer = %tunnel.peer_id, error = %e, "tunnel install failed");
                    failures.push(TunnelFailure {
                        peer_id: tunnel.peer_id.clone(),
                        op: TunnelOp::Install,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !failures.is_empty() {
            return Err(ReconcileError::Apply {
                revision: snapshot.revision,
                failures,
            });
        }

        applied.tunnels = desired;
        self.record_applied(&applied);
        tracing::info!(
            revision = snapshot.revision,
            installed = report.installed.len(),
            removed = report.removed.len(),
            "reconcile complete"
        );
        Ok(report)
    }
}
