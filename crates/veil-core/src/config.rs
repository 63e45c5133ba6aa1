//! Configuration system for veil.
//!
//! Resolution order: command-line flags → environment variables → config file → defaults.
//! Flags are applied by `veild` after [`VeilConfig::load`] returns.
//!
//! Config file location:
//!   1. explicit `--config` path
//!   2. $VEIL_CONFIG
//!   3. /etc/veil/veil.toml (optional, defaults are used when absent)

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub registry: RegistryConfig,
    pub network: NetworkConfig,
    pub ipsec: IpsecConfig,
    pub reconcile: ReconcileConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON host file listing every member host and its overlay addresses.
    pub file: PathBuf,
    /// When set, the host whose endpoint equals this address is the local host,
    /// regardless of the `self` flags in the host file.
    pub local_ip: Option<IpAddr>,
    /// How long bootstrap waits for the host file to appear.
    pub wait_for_file_secs: u64,
    /// Re-read the host file on this interval. 0 = only on `/v1/reload`.
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Physical interface the ARP responder binds to.
    pub interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpsecConfig {
    /// Directory holding the generated swanctl configuration.
    pub config_dir: PathBuf,
    /// The IKE daemon binary.
    pub charon_binary: PathBuf,
    /// File the daemon's stdout/stderr is appended to. None = discarded.
    pub charon_log: Option<PathBuf>,
    /// VICI control socket; its appearance means the daemon is ready.
    pub vici_socket: PathBuf,
    /// Command that makes the daemon re-read `config_dir/swanctl.conf`.
    pub swanctl_binary: PathBuf,
    /// Pre-shared key used for every tunnel.
    pub psk: Option<String>,
    /// File containing the pre-shared key. Takes precedence over `psk`.
    pub psk_file: Option<PathBuf>,
    pub ike_proposals: String,
    pub esp_proposals: String,
    /// Launch attempts before startup is declared failed.
    pub start_attempts: u32,
    /// Per-attempt wait for the VICI socket.
    pub start_timeout_secs: u64,
    /// Unexpected exits tolerated before supervision gives up.
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Idle timeout after which the reconcile loop runs even without a change.
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Control API listen address.
    pub listen: SocketAddr,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("config.json"),
            local_ip: None,
            wait_for_file_secs: 60,
            refresh_interval_secs: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
        }
    }
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("."),
            charon_binary: PathBuf::from("/usr/lib/ipsec/charon"),
            charon_log: None,
            vici_socket: PathBuf::from("/var/run/charon.vici"),
            swanctl_binary: PathBuf::from("swanctl"),
            psk: None,
            psk_file: None,
            ike_proposals: "aes128gcm16-sha256-modp2048".to_string(),
            esp_proposals: "aes128gcm16-modp2048".to_string(),
            start_attempts: 5,
            start_timeout_secs: 10,
            max_restarts: 5,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8111)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidEnv(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VeilConfig {
    /// Load config: env vars → file → defaults.
    ///
    /// An explicitly named file must exist; the default location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var("VEIL_CONFIG") {
                Ok(p) => (PathBuf::from(p), true),
                Err(_) => (Self::default_path(), false),
            },
        };

        let mut config = if required || path.exists() {
            Self::from_file(&path)?
        } else {
            VeilConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse a single TOML file, no env overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/veil/veil.toml")
    }

    /// Apply VEIL_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overrides read through `lookup` so tests do not have to touch the process env.
    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("VEIL_REGISTRY__FILE") {
            self.registry.file = PathBuf::from(v);
        }
        if let Some(v) = lookup("VEIL_REGISTRY__LOCAL_IP") {
            let ip = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VEIL_REGISTRY__LOCAL_IP", v))?;
            self.registry.local_ip = Some(ip);
        }
        if let Some(v) = lookup("VEIL_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Some(v) = lookup("VEIL_IPSEC__CONFIG_DIR") {
            self.ipsec.config_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("VEIL_IPSEC__PSK_FILE") {
            self.ipsec.psk_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("VEIL_API__LISTEN") {
            self.api.listen = v
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("VEIL_API__LISTEN", v))?;
        }
        Ok(())
    }
}
