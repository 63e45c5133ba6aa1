//! Tunnel daemon abstraction.
//!
//! The reconciler never talks to the IPsec daemon directly; it goes through
//! this trait so the diff/ordering logic can be exercised against a fake.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::tunnel::TunnelDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to start {binary} after {attempts} attempt(s): {reason}")]
    StartFailed {
        binary: String,
        attempts: u32,
        reason: String,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("daemon supervision ended: {0}")]
    Exited(String),
}

/// An external, supervised process holding the active security associations.
#[async_trait]
pub trait TunnelDaemon: Send + Sync {
    /// Launch the daemon and return once it accepts configuration.
    /// Daemon output goes to `log_target` when given.
    async fn start(&self, log_target: Option<&Path>) -> Result<(), DaemonError>;

    /// Make `tunnel` active. On error nothing of `tunnel` may remain configured.
    async fn install(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError>;

    /// Remove `tunnel`. Removing a tunnel that is not configured succeeds.
    async fn teardown(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError>;

    /// Whether the daemon process is currently up.
    fn healthy(&self) -> bool;

    /// Bumped on every (re)start. A new generation has no tunnels loaded.
    fn generation(&self) -> u64;

    /// Follows [`generation`](Self::generation), so a restart can trigger a
    /// reconcile right away.
    fn generations(&self) -> watch::Receiver<u64>;

    /// Resolves once supervision has given up on the daemon.
    async fn exited(&self) -> DaemonError;

    /// Stop the daemon for a clean shutdown.
    async fn stop(&self);
}
