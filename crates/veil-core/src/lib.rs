//! veil-core: shared types, host-file schema, agent configuration and the
//! ARP wire format. All other veil crates depend on this one.

pub mod config;
pub mod peer;
pub mod wire;

pub use peer::{HostRecord, Peer, PeerId, RecordError};
pub use wire::{ArpFrame, MacAddr};
