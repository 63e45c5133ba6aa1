//! Peer registry: the single source of truth for which hosts exist and which
//! overlay addresses each one owns.
//!
//! State is published as immutable [`Snapshot`]s through a `watch` channel.
//! Readers grab the current `Arc<Snapshot>` without waiting on a refresh;
//! a refresh builds a complete new snapshot and swaps it in, so nobody ever
//! sees a half-applied update. Subscribers are told the newest revision and
//! may skip intermediate ones.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::{watch, Mutex};

use veil_core::peer::{parse_host_file, HostFileError};
use veil_core::{HostRecord, Peer, PeerId, RecordError};

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Immutable point-in-time view of the registry.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// 0 until the first successful refresh, then +1 per published change.
    pub revision: u64,
    pub peers: BTreeMap<PeerId, Peer>,
    /// Records dropped by the refresh that produced this snapshot.
    pub warnings: Vec<RecordError>,
}

impl Snapshot {
    /// The local host, if known.
    pub fn local(&self) -> Option<&Peer> {
        self.peers.values().find(|p| p.is_self)
    }

    /// Every peer except the local host.
    pub fn remotes(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| !p.is_self)
    }

    /// The peer owning `addr`. Overlay addresses are disjoint, so at most one matches.
    pub fn owner_of(&self, addr: IpAddr) -> Option<&Peer> {
        self.peers.values().find(|p| p.owns(addr))
    }
}

// ── Source of truth ───────────────────────────────────────────────────────────

/// Where host records come from.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Fetch every record. The outer error means nothing usable was read.
    async fn fetch(&self) -> Result<Vec<Result<HostRecord, RecordError>>, RegistryError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// The JSON host file, re-read on every refresh.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PeerSource for FileSource {
    async fn fetch(&self) -> Result<Vec<Result<HostRecord, RecordError>>, RegistryError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| RegistryError::Unreadable(self.path.display().to_string(), e))?;
        parse_host_file(&text)
            .map_err(|e| RegistryError::Malformed(self.path.display().to_string(), e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read {0}: {1}")]
    Unreadable(String, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Malformed(String, HostFileError),
    #[error("no record describes the local host ({0} host(s) listed)")]
    NoLocalHost(usize),
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Shared handle to the registry. Cheap to clone; every clone sees the same state.
#[derive(Clone)]
pub struct PeerRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    source: Box<dyn PeerSource>,
    local_ip: Option<IpAddr>,
    tx: watch::Sender<Arc<Snapshot>>,
    refresh_lock: Mutex<()>,
}

impl PeerRegistry {
    /// Create an empty registry (revision 0) backed by `source`.
    ///
    /// `local_ip`, when set, identifies the local host by endpoint and overrides
    /// the records' `self` flags.
    pub fn new(source: impl PeerSource + 'static, local_ip: Option<IpAddr>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self {
            inner: Arc::new(Inner {
                source: Box::new(source),
                local_ip,
                tx,
                refresh_lock: Mutex::new(()),
            }),
        }
    }

    /// The latest published snapshot. Never waits for a refresh in progress.
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.tx.borrow().clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner.tx.borrow().revision
    }

    /// Change notifications carrying the newest revision.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Pull fresh records, validate them and publish a new snapshot if anything
    /// changed. Returns whether a new snapshot was published.
    ///
    /// On error the previous snapshot stays current.
    pub async fn refresh(&self) -> Result<bool, RegistryError> {
        let _guard = self.inner.refresh_lock.lock().await;

        let records = self.inner.source.fetch().await?;
        let listed = records.len();
        let validated = validate(records, self.inner.local_ip);

        if !validated.accepted.is_empty() && !validated.accepted.iter().any(|r| r.is_self) {
            return Err(RegistryError::NoLocalHost(listed));
        }

        let current = self.current();
        let revision = current.revision + 1;

        let peers: BTreeMap<PeerId, Peer> = validated
            .accepted
            .into_iter()
            .map(|candidate| {
                let mut peer = Peer {
                    id: candidate.id,
                    endpoint: candidate.endpoint,
                    is_self: candidate.is_self,
                    overlay_addresses: candidate.nets,
                    revision,
                };
                if let Some(prev) = current.peers.get(&peer.id) {
                    if prev.same_facts(&peer) {
                        peer.revision = prev.revision;
                    }
                }
                (peer.id.clone(), peer)
            })
            .collect();

        // A new rejection is published too, so it reaches status readers.
        let unchanged = current.revision > 0
            && validated.warnings == current.warnings
            && peers.len() == current.peers.len()
            && peers
                .iter()
                .all(|(id, p)| current.peers.get(id).is_some_and(|prev| prev.same_facts(p)));

        if unchanged {
            for w in &validated.warnings {
                tracing::debug!(source = %self.inner.source.describe(), warning = %w, "host record still rejected");
            }
            return Ok(false);
        }

        for w in &validated.warnings {
            tracing::warn!(source = %self.inner.source.describe(), warning = %w, "host record rejected");
        }

        let snapshot = Snapshot {
            revision,
            peers,
            warnings: validated.warnings,
        };
        tracing::info!(
            revision,
            peers = snapshot.peers.len(),
            rejected = snapshot.warnings.len(),
            "registry snapshot published"
        );
        self.inner.tx.send_replace(Arc::new(snapshot));
        Ok(true)
    }
}

/// Receiver side of the registry's change notifications.
pub struct Subscription {
    rx: watch::Receiver<Arc<Snapshot>>,
}

impl Subscription {
    /// Wait for a snapshot newer than the last one seen and return its revision.
    /// Returns `None` once the registry is gone.
    pub async fn changed(&mut self) -> Option<u64> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().revision)
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

struct Candidate {
    index: usize,
    id: PeerId,
    endpoint: IpAddr,
    is_self: bool,
    nets: Vec<IpNet>,
}

struct Validated {
    accepted: Vec<Candidate>,
    warnings: Vec<RecordError>,
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Apply the registry invariants to raw records.
///
/// Rules, in order:
/// 1. undecodable records and records with bad overlay addresses are dropped;
/// 2. duplicate ids: the first occurrence in file order wins;
/// 3. the local host is the record whose endpoint equals `local_ip` when set,
///    otherwise the record flagged `self`; with several candidates the lowest id
///    wins and the others are dropped;
/// 4. records are then taken local host first, the rest by ascending id, and a
///    record claiming any address overlapping an earlier record's is dropped whole.
fn validate(records: Vec<Result<HostRecord, RecordError>>, local_ip: Option<IpAddr>) -> Validated {
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warnings.push(e);
                continue;
            }
        };
        let nets = match record.overlay_nets() {
            Ok(mut nets) => {
                nets.sort();
                nets.dedup();
                nets
            }
            Err(reason) => {
                warnings.push(RecordError {
                    index,
                    id: Some(record.id),
                    reason,
                });
                continue;
            }
        };
        if !seen.insert(record.id.clone()) {
            warnings.push(RecordError {
                index,
                id: Some(record.id),
                reason: "duplicate host id".to_string(),
            });
            continue;
        }
        let is_self = match local_ip {
            Some(ip) => record.endpoint == ip,
            None => record.is_self,
        };
        candidates.push(Candidate {
            index,
            id: record.id,
            endpoint: record.endpoint,
            is_self,
            nets,
        });
    }

    // Local host first, then by id.
    candidates.sort_by(|a, b| b.is_self.cmp(&a.is_self).then_with(|| a.id.cmp(&b.id)));

    let mut accepted: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.is_self && accepted.iter().any(|c| c.is_self) {
            warnings.push(RecordError {
                index: candidate.index,
                id: Some(candidate.id),
                reason: "another record already describes the local host".to_string(),
            });
            continue;
        }

        let conflict = accepted.iter().find_map(|owner| {
            candidate.nets.iter().find_map(|net| {
                owner
                    .nets
                    .iter()
                    .find(|taken| overlaps(net, taken))
                    .map(|taken| (owner.id.clone(), *net, *taken))
            })
        });
        if let Some((owner, net, taken)) = conflict {
            warnings.push(RecordError {
                index: candidate.index,
                id: Some(candidate.id),
                reason: format!("overlay address {net} overlaps {taken} owned by {owner}"),
            });
            continue;
        }

        accepted.push(candidate);
    }

    warnings.sort_by_key(|w| w.index);
    Validated { accepted, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{host, StaticSource};

    fn registry(records: Vec<HostRecord>) -> (PeerRegistry, StaticSource) {
        let source = StaticSource::new(records);
        (PeerRegistry::new(source.clone(), None), source)
    }

    #[tokio::test]
    async fn empty_before_first_refresh() {
        let (reg, _) = registry(vec![]);
        let snap = reg.current();
        assert_eq!(snap.revision, 0);
        assert!(snap.peers.is_empty());
        assert!(snap.local().is_none());
    }

    #[tokio::test]
    async fn refresh_publishes_then_is_a_noop() {
        let (reg, _) = registry(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);

        assert!(reg.refresh().await.unwrap());
        let first = reg.current();
        assert_eq!(first.revision, 1);
        assert_eq!(first.local().unwrap().id, "self");
        assert_eq!(first.remotes().count(), 1);

        assert!(!reg.refresh().await.unwrap());
        assert!(Arc::ptr_eq(&first, &reg.current()));
    }

    #[tokio::test]
    async fn untouched_peers_keep_their_revision() {
        let (reg, source) = registry(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        source.set(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
            host("b", "172.16.0.3", false, &["10.0.3.0/24"]),
        ]);
        assert!(reg.refresh().await.unwrap());

        let snap = reg.current();
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.peers["a"].revision, 1);
        assert_eq!(snap.peers["b"].revision, 2);
    }

    #[tokio::test]
    async fn late_conflicting_record_is_published_as_a_warning() {
        let (reg, source) = registry(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        source.set(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
            host("z", "172.16.0.26", false, &["10.0.1.0/25"]),
        ]);
        assert!(reg.refresh().await.unwrap());

        let snap = reg.current();
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.warnings.len(), 1);
        assert!(!snap.peers.contains_key("z"));
        assert_eq!(snap.peers["a"].revision, 1);

        // Same rejection again: nothing new to publish.
        assert!(!reg.refresh().await.unwrap());
        assert_eq!(reg.current().revision, 2);

        // Conflict resolved: the warning clears.
        source.set(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        assert!(reg.refresh().await.unwrap());
        assert!(reg.current().warnings.is_empty());
    }

    #[tokio::test]
    async fn overlapping_claim_keeps_lowest_id() {
        let (reg, _) = registry(vec![
            host("self", "172.16.0.9", true, &["10.0.9.0/24"]),
            host("zeta", "172.16.0.2", false, &["10.0.1.5"]),
            host("alpha", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        let snap = reg.current();
        assert!(snap.peers.contains_key("alpha"));
        assert!(!snap.peers.contains_key("zeta"));
        assert_eq!(snap.warnings.len(), 1);
        assert_eq!(snap.warnings[0].id.as_deref(), Some("zeta"));
        assert!(snap.warnings[0].reason.contains("alpha"));
    }

    #[tokio::test]
    async fn local_host_wins_overlap_against_lower_id() {
        let (reg, _) = registry(vec![
            host("zz-self", "172.16.0.9", true, &["10.0.1.0/24"]),
            host("aa", "172.16.0.1", false, &["10.0.1.0/25"]),
        ]);
        reg.refresh().await.unwrap();

        let snap = reg.current();
        assert_eq!(snap.local().unwrap().id, "zz-self");
        assert!(!snap.peers.contains_key("aa"));
    }

    #[tokio::test]
    async fn duplicate_id_first_occurrence_wins() {
        let (reg, _) = registry(vec![
            host("self", "172.16.0.9", true, &[]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
            host("a", "172.16.0.2", false, &["10.0.5.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        let snap = reg.current();
        assert_eq!(snap.peers["a"].endpoint, "172.16.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(snap.warnings.len(), 1);
        assert_eq!(snap.warnings[0].index, 2);
    }

    #[tokio::test]
    async fn second_self_record_is_dropped() {
        let (reg, _) = registry(vec![
            host("b-self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a-self", "172.16.0.1", true, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        let snap = reg.current();
        assert_eq!(snap.peers.len(), 1);
        assert_eq!(snap.local().unwrap().id, "a-self");
    }

    #[tokio::test]
    async fn local_ip_overrides_self_flags() {
        let source = StaticSource::new(vec![
            host("a", "172.16.0.1", true, &["10.0.1.0/24"]),
            host("b", "172.16.0.2", false, &["10.0.2.0/24"]),
        ]);
        let reg = PeerRegistry::new(source, Some("172.16.0.2".parse().unwrap()));
        reg.refresh().await.unwrap();

        let snap = reg.current();
        assert_eq!(snap.local().unwrap().id, "b");
        assert!(!snap.peers["a"].is_self);
    }

    #[tokio::test]
    async fn missing_local_host_keeps_previous_snapshot() {
        let (reg, source) = registry(vec![
            host("self", "172.16.0.2", true, &["10.0.2.0/24"]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        source.set(vec![host("a", "172.16.0.1", false, &["10.0.1.0/24"])]);
        let err = reg.refresh().await.unwrap_err();
        assert!(matches!(err, RegistryError::NoLocalHost(1)));
        assert_eq!(reg.current().revision, 1);
        assert_eq!(reg.current().peers.len(), 2);
    }

    #[tokio::test]
    async fn unreadable_file_keeps_previous_snapshot() {
        let dir = std::env::temp_dir().join(format!("veil-registry-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts.json");
        std::fs::write(
            &path,
            r#"{"hosts": [{"id": "self", "endpoint": "172.16.0.2", "self": true, "overlay_addresses": ["10.0.2.0/24"]}]}"#,
        )
        .unwrap();

        let reg = PeerRegistry::new(FileSource::new(&path), None);
        assert!(reg.refresh().await.unwrap());

        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(reg.refresh().await, Err(RegistryError::Malformed(_, _))));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(reg.refresh().await, Err(RegistryError::Unreadable(_, _))));

        assert_eq!(reg.current().revision, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn subscriber_sees_latest_revision() {
        let (reg, source) = registry(vec![host("self", "172.16.0.2", true, &[])]);
        let mut sub = reg.subscribe();

        reg.refresh().await.unwrap();
        source.set(vec![
            host("self", "172.16.0.2", true, &[]),
            host("a", "172.16.0.1", false, &["10.0.1.0/24"]),
        ]);
        reg.refresh().await.unwrap();

        // Two publications, one wake-up carrying the newest revision.
        assert_eq!(sub.changed().await, Some(2));
    }

    #[test]
    fn owner_lookup_respects_subnets() {
        let mut peers = BTreeMap::new();
        for (id, is_self, net) in [("self", true, "10.0.2.0/24"), ("a", false, "10.0.1.0/24")] {
            peers.insert(
                id.to_string(),
                Peer {
                    id: id.to_string(),
                    endpoint: "172.16.0.1".parse().unwrap(),
                    is_self,
                    overlay_addresses: vec![net.parse().unwrap()],
                    revision: 1,
                },
            );
        }
        let snap = Snapshot {
            revision: 1,
            peers,
            warnings: vec![],
        };
        assert_eq!(snap.owner_of("10.0.1.5".parse().unwrap()).unwrap().id, "a");
        assert_eq!(snap.owner_of("10.0.2.9".parse().unwrap()).unwrap().id, "self");
        assert!(snap.owner_of("10.0.3.1".parse().unwrap()).is_none());
    }
}
