//! Peer data model and the host-file schema it is loaded from.
//!
//! The host file is the external source of truth: one record per member host,
//! including the local one. Records are decoded independently so a single
//! malformed entry never hides the rest of the file.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Stable host identifier.
pub type PeerId = String;

/// A member host of the overlay as published in a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: PeerId,
    /// Routable physical address, the tunnel's remote gateway.
    pub endpoint: IpAddr,
    /// True for the local host. Never gets a tunnel or an ARP reply.
    pub is_self: bool,
    /// Overlay addresses and subnets reachable through this host.
    pub overlay_addresses: Vec<IpNet>,
    /// Registry revision at which this peer's facts last changed.
    pub revision: u64,
}

impl Peer {
    /// Same host facts, ignoring the bookkeeping revision.
    pub fn same_facts(&self, other: &Peer) -> bool {
        self.id == other.id
            && self.endpoint == other.endpoint
            && self.is_self == other.is_self
            && self.overlay_addresses == other.overlay_addresses
    }

    /// Does any of this peer's overlay addresses contain `addr`?
    pub fn owns(&self, addr: IpAddr) -> bool {
        self.overlay_addresses.iter().any(|net| net.contains(&addr))
    }
}

// ── Host file ─────────────────────────────────────────────────────────────────

/// One host entry as written in the host file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub endpoint: IpAddr,
    #[serde(rename = "self", default)]
    pub is_self: bool,
    /// Either CIDR subnets (`10.42.1.0/24`) or bare addresses (`10.42.1.7`).
    #[serde(default)]
    pub overlay_addresses: Vec<String>,
}

impl HostRecord {
    /// Parse the overlay address strings. Bare addresses become host routes.
    pub fn overlay_nets(&self) -> Result<Vec<IpNet>, String> {
        self.overlay_addresses
            .iter()
            .map(|s| parse_overlay_address(s))
            .collect()
    }
}

/// Parse `10.42.1.0/24` or `10.42.1.7` (→ `10.42.1.7/32`). Host bits are cleared.
pub fn parse_overlay_address(s: &str) -> Result<IpNet, String> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| format!("invalid overlay address {s:?}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HostFileShape {
    Wrapped { hosts: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

/// A record that could not be used, with the reason. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    /// Position in the host file.
    pub index: usize,
    /// The record's id, when it could be read.
    pub id: Option<String>,
    pub reason: String,
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "record {} ({}): {}", self.index, id, self.reason),
            None => write!(f, "record {}: {}", self.index, self.reason),
        }
    }
}

/// Errors that reject the whole host file.
#[derive(Debug, thiserror::Error)]
pub enum HostFileError {
    #[error("host file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a host file. The outer `Err` means the file as a whole is unusable;
/// inner errors are per-record rejections.
pub fn parse_host_file(text: &str) -> Result<Vec<Result<HostRecord, RecordError>>, HostFileError> {
    let values = match serde_json::from_str::<HostFileShape>(text)? {
        HostFileShape::Wrapped { hosts } => hosts,
        HostFileShape::Bare(hosts) => hosts,
    };

    Ok(values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let id = value.get("id").and_then(|v| v.as_str()).map(str::to_string);
            serde_json::from_value::<HostRecord>(value).map_err(|e| RecordError {
                index,
                id,
                reason: e.to_string(),
            })
        })
        .collect())
}
