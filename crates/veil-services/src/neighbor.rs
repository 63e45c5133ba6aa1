//! ARP decisions for the physical segment.
//!
//! Requests for an overlay address owned by a remote peer are answered with
//! our own link address, which pulls that traffic into the local host and so
//! into the tunnel. Everything else is left alone. The socket loop lives in
//! `veild`; this module only turns frames into optional replies.

use std::net::Ipv4Addr;

use ipnet::{IpNet, Ipv4Net};

use veil_core::wire::{ArpFrame, FrameError, MacAddr, ARP_OP_REQUEST};

use crate::registry::{PeerRegistry, Snapshot};

/// Overlay IPv4 nets and whether each belongs to a remote peer.
#[derive(Debug, Default)]
pub struct NeighborTable {
    revision: u64,
    /// Longest prefix first.
    entries: Vec<(Ipv4Net, bool)>,
}

impl NeighborTable {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        let mut entries: Vec<(Ipv4Net, bool)> = snapshot
            .peers
            .values()
            .flat_map(|peer| {
                peer.overlay_addresses.iter().filter_map(move |net| match net {
                    IpNet::V4(v4) => Some((*v4, !peer.is_self)),
                    IpNet::V6(_) => None,
                })
            })
            .collect();
        entries.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self {
            revision: snapshot.revision,
            entries,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// `Some(true)` for a remote peer's address, `Some(false)` for ours, `None` if unknown.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<bool> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, remote)| *remote)
    }
}

pub struct NeighborResponder {
    registry: PeerRegistry,
    local_mac: MacAddr,
    table: NeighborTable,
}

impl NeighborResponder {
    pub fn new(registry: PeerRegistry, local_mac: MacAddr) -> Self {
        let table = NeighborTable::from_snapshot(&registry.current());
        Self {
            registry,
            local_mac,
            table,
        }
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    fn sync_table(&mut self) {
        let snapshot = self.registry.current();
        if snapshot.revision != self.table.revision() {
            self.table = NeighborTable::from_snapshot(&snapshot);
            tracing::debug!(
                revision = snapshot.revision,
                entries = self.table.entries.len(),
                "neighbor table rebuilt"
            );
        }
    }

    /// Decide what to do with one received frame.
    ///
    /// `Ok(Some(bytes))` is a reply to transmit. Malformed frames are an `Err`
    /// for the caller to log and drop.
    pub fn handle_frame(&mut self, buf: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        let frame = ArpFrame::parse(buf)?;

        if frame.operation() != ARP_OP_REQUEST {
            return Ok(None);
        }
        if frame.source_mac() == self.local_mac || frame.sender_mac() == self.local_mac {
            return Ok(None);
        }
        let target = frame.target_ip();
        // Gratuitous ARP announces the sender's own address; nothing to answer.
        if frame.sender_ip() == target {
            return Ok(None);
        }

        self.sync_table();
        match self.table.lookup(target) {
            Some(true) => {
                tracing::trace!(
                    target = %target,
                    requester = %frame.sender_ip(),
                    requester_mac = %frame.sender_mac(),
                    "answering for remote overlay address"
                );
                Ok(Some(frame.reply_from(self.local_mac).to_padded_bytes()))
            }
            Some(false) | None => Ok(None),
        }
    }
}
