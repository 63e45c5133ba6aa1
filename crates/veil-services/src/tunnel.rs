//! Tunnel descriptors derived from a registry snapshot, and the diff between
//! two descriptor sets.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Serialize;

use veil_core::PeerId;

use crate::registry::Snapshot;

/// "These remote subnets are reachable through this remote endpoint."
///
/// One per remote peer owning at least one overlay address. Never persisted;
/// recomputed from every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDescriptor {
    pub peer_id: PeerId,
    pub local_endpoint: IpAddr,
    pub remote_endpoint: IpAddr,
    pub local_subnets: Vec<IpNet>,
    pub remote_subnets: Vec<IpNet>,
}

/// Descriptor set keyed by peer id.
pub type TunnelSet = BTreeMap<PeerId, TunnelDescriptor>;

/// The descriptors a snapshot calls for. Empty when the local host is unknown.
pub fn desired_tunnels(snapshot: &Snapshot) -> TunnelSet {
    let Some(local) = snapshot.local() else {
        return TunnelSet::new();
    };

    snapshot
        .remotes()
        .filter(|peer| !peer.overlay_addresses.is_empty())
        .map(|peer| {
            (
                peer.id.clone(),
                TunnelDescriptor {
                    peer_id: peer.id.clone(),
                    local_endpoint: local.endpoint,
                    remote_endpoint: peer.endpoint,
                    local_subnets: local.overlay_addresses.clone(),
                    remote_subnets: peer.overlay_addresses.clone(),
                },
            )
        })
        .collect()
}

/// What has to change to get from the applied set to the desired set.
///
/// A peer whose descriptor changed appears in both lists; teardowns are
/// always carried out before installs.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TunnelDiff {
    pub teardown: Vec<TunnelDescriptor>,
    pub install: Vec<TunnelDescriptor>,
}

impl TunnelDiff {
    pub fn is_empty(&self) -> bool {
        self.teardown.is_empty() && self.install.is_empty()
    }
}

pub fn diff(applied: &TunnelSet, desired: &TunnelSet) -> TunnelDiff {
    let teardown = applied
        .iter()
        .filter(|(id, old)| desired.get(*id) != Some(*old))
        .map(|(_, old)| old.clone())
        .collect();

    let install = desired
        .iter()
        .filter(|(id, new)| applied.get(*id) != Some(*new))
        .map(|(_, new)| new.clone())
        .collect();

    TunnelDiff { teardown, install }
}
