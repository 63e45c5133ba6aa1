//! Command-line flags. Anything given here wins over the config file and `VEIL_*`.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use veil_core::config::VeilConfig;

#[derive(Debug, Parser)]
#[command(name = "veild", version, about = "veil overlay agent: IPsec mesh and ARP responder")]
pub struct Cli {
    /// Agent configuration file (TOML)
    #[arg(long, env = "VEIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Host file listing every member of the overlay (JSON)
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,

    /// Directory swanctl configuration is rendered into
    #[arg(long)]
    pub ipsec_config: Option<PathBuf>,

    /// File charon's output is appended to
    #[arg(long)]
    pub charon_log: Option<PathBuf>,

    /// Control API listen address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Endpoint identifying the local host in the host file
    #[arg(long)]
    pub local_ip: Option<IpAddr>,

    /// Physical interface to answer ARP on
    #[arg(long, short = 'i')]
    pub interface: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Write the process id to this file
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short = 'd')]
    pub debug: bool,
}

impl Cli {
    pub fn apply(&self, config: &mut VeilConfig) {
        if let Some(file) = &self.file {
            config.registry.file = file.clone();
        }
        if let Some(ip) = self.local_ip {
            config.registry.local_ip = Some(ip);
        }
        if let Some(dir) = &self.ipsec_config {
            config.ipsec.config_dir = dir.clone();
        }
        if let Some(log) = &self.charon_log {
            config.ipsec.charon_log = Some(log.clone());
        }
        if let Some(listen) = self.listen {
            config.api.listen = listen;
        }
        if let Some(interface) = &self.interface {
            config.network.interface = interface.clone();
        }
    }
}
