//! In-memory stand-ins for the host file and the tunnel daemon.
//!
//! Compiled for this crate's unit tests and, behind the `test-util` feature,
//! for downstream crates that exercise the registry and reconciler without a
//! real charon.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use veil_core::peer::parse_overlay_address;
use veil_core::{HostRecord, Peer, PeerId, RecordError};

use crate::daemon::{DaemonError, TunnelDaemon};
use crate::registry::{PeerSource, RegistryError, Snapshot};
use crate::tunnel::TunnelDescriptor;

pub fn host(id: &str, endpoint: &str, is_self: bool, overlay: &[&str]) -> HostRecord {
    HostRecord {
        id: id.to_string(),
        endpoint: endpoint.parse().expect("test endpoint"),
        is_self,
        overlay_addresses: overlay.iter().map(|s| s.to_string()).collect(),
    }
}

/// A snapshot at revision 1 built straight from `(id, endpoint, is_self, overlay)`.
pub fn snapshot(peers: &[(&str, &str, bool, &[&str])]) -> Snapshot {
    let peers = peers
        .iter()
        .map(|(id, endpoint, is_self, overlay)| {
            let peer = Peer {
                id: id.to_string(),
                endpoint: endpoint.parse().expect("test endpoint"),
                is_self: *is_self,
                overlay_addresses: overlay
                    .iter()
                    .map(|s| parse_overlay_address(s).expect("test overlay address"))
                    .collect(),
                revision: 1,
            };
            (peer.id.clone(), peer)
        })
        .collect();
    Snapshot {
        revision: 1,
        peers,
        warnings: Vec::new(),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Source ────────────────────────────────────────────────────────────────────

/// Host records held in memory. Clones share the same records.
#[derive(Clone, Default)]
pub struct StaticSource {
    records: Arc<Mutex<Vec<HostRecord>>>,
    broken: Arc<Mutex<bool>>,
}

impl StaticSource {
    pub fn new(records: Vec<HostRecord>) -> Self {
        Self {
            records: Arc::new(Mutex::new(records)),
            broken: Arc::default(),
        }
    }

    pub fn set(&self, records: Vec<HostRecord>) {
        *lock(&self.records) = records;
    }

    /// While broken, every fetch fails as an unreadable file would.
    pub fn set_broken(&self, broken: bool) {
        *lock(&self.broken) = broken;
    }
}

#[async_trait]
impl PeerSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<Result<HostRecord, RecordError>>, RegistryError> {
        if *lock(&self.broken) {
            return Err(RegistryError::Unreadable(
                self.describe(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "source unavailable"),
            ));
        }
        Ok(lock(&self.records).iter().cloned().map(Ok).collect())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonOp {
    Install(PeerId),
    Teardown(PeerId),
}

struct FakeState {
    ops: Vec<DaemonOp>,
    active: BTreeMap<PeerId, TunnelDescriptor>,
    fail_install: BTreeSet<PeerId>,
    fail_teardown: BTreeSet<PeerId>,
    healthy: bool,
    stopped: bool,
}

/// A tunnel daemon that records every operation and keeps the set of tunnels
/// it would have loaded. Starts healthy at generation 1.
pub struct FakeDaemon {
    state: Mutex<FakeState>,
    generation: watch::Sender<u64>,
    fatal: watch::Sender<Option<String>>,
    paused: watch::Sender<bool>,
}

impl Default for FakeDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDaemon {
    pub fn new() -> Self {
        let (fatal, _) = watch::channel(None);
        let (generation, _) = watch::channel(1);
        let (paused, _) = watch::channel(false);
        Self {
            generation,
            paused,
            state: Mutex::new(FakeState {
                ops: Vec::new(),
                active: BTreeMap::new(),
                fail_install: BTreeSet::new(),
                fail_teardown: BTreeSet::new(),
                healthy: true,
                stopped: false,
            }),
            fatal,
        }
    }

    /// Operations since the last call.
    pub fn take_ops(&self) -> Vec<DaemonOp> {
        std::mem::take(&mut lock(&self.state).ops)
    }

    /// Tunnels currently loaded, keyed by peer.
    pub fn active(&self) -> BTreeMap<PeerId, TunnelDescriptor> {
        lock(&self.state).active.clone()
    }

    pub fn fail_install(&self, peer: &str, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_install.insert(peer.to_string());
        } else {
            state.fail_install.remove(peer);
        }
    }

    pub fn fail_teardown(&self, peer: &str, fail: bool) {
        let mut state = lock(&self.state);
        if fail {
            state.fail_teardown.insert(peer.to_string());
        } else {
            state.fail_teardown.remove(peer);
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        lock(&self.state).healthy = healthy;
    }

    /// Simulate a crash and restart: nothing stays loaded.
    pub fn restart(&self) {
        {
            let mut state = lock(&self.state);
            state.active.clear();
            state.healthy = true;
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Hold every install until [`resume`](Self::resume), like a slow swanctl.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Make [`TunnelDaemon::exited`] resolve.
    pub fn die(&self, reason: &str) {
        lock(&self.state).healthy = false;
        self.fatal.send_replace(Some(reason.to_string()));
    }

    pub fn stopped(&self) -> bool {
        lock(&self.state).stopped
    }
}

#[async_trait]
impl TunnelDaemon for FakeDaemon {
    async fn start(&self, _log_target: Option<&Path>) -> Result<(), DaemonError> {
        lock(&self.state).healthy = true;
        Ok(())
    }

    async fn install(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError> {
        let _ = self.paused.subscribe().wait_for(|paused| !paused).await;
        let mut state = lock(&self.state);
        state.ops.push(DaemonOp::Install(tunnel.peer_id.clone()));
        if state.fail_install.contains(&tunnel.peer_id) {
            state.active.remove(&tunnel.peer_id);
            return Err(DaemonError::Command {
                command: format!("install {}", tunnel.peer_id),
                reason: "rejected by fake daemon".to_string(),
            });
        }
        state.active.insert(tunnel.peer_id.clone(), tunnel.clone());
        Ok(())
    }

    async fn teardown(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError> {
        let mut state = lock(&self.state);
        state.ops.push(DaemonOp::Teardown(tunnel.peer_id.clone()));
        if state.fail_teardown.contains(&tunnel.peer_id) {
            return Err(DaemonError::Command {
                command: format!("teardown {}", tunnel.peer_id),
                reason: "rejected by fake daemon".to_string(),
            });
        }
        state.active.remove(&tunnel.peer_id);
        Ok(())
    }

    fn healthy(&self) -> bool {
        lock(&self.state).healthy
    }

    fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn generations(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    async fn exited(&self) -> DaemonError {
        let mut rx = self.fatal.subscribe();
        loop {
            let reason = rx.borrow_and_update().clone();
            if let Some(reason) = reason {
                return DaemonError::Exited(reason);
            }
            if rx.changed().await.is_err() {
                return DaemonError::Exited("fake daemon dropped".to_string());
            }
        }
    }

    async fn stop(&self) {
        let mut state = lock(&self.state);
        state.stopped = true;
        state.healthy = false;
    }
}
