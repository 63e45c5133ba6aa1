//! veil-services: the peer registry, tunnel reconciliation against the IPsec
//! daemon, ARP decisions and the reload coordinator tying them together.

pub mod charon;
pub mod coordinator;
pub mod daemon;
pub mod neighbor;
pub mod reconciler;
pub mod registry;
pub mod tunnel;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

pub use charon::{CharonDaemon, CharonSettings};
pub use coordinator::{Coordinator, CoordinatorError, ReloadReport, Status};
pub use daemon::{DaemonError, TunnelDaemon};
pub use neighbor::NeighborResponder;
pub use reconciler::{ReconcileError, ReconcileReport, TunnelReconciler};
pub use registry::{FileSource, PeerRegistry, PeerSource, RegistryError, Snapshot};
pub use tunnel::TunnelDescriptor;
