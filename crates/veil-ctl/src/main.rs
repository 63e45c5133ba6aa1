//! veil-ctl: command-line interface for the veil agent.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

const DEFAULT_ADDR: &str = "127.0.0.1:8111";

#[derive(Parser)]
#[command(name = "veil-ctl", version, about = "Inspect and drive a running veild")]
struct Cli {
    /// Control API address of veild
    #[arg(long, default_value = DEFAULT_ADDR, env = "VEIL_API")]
    addr: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Registry revision, tunnels, last reconcile outcome
    Status,
    /// List known peers
    Peers,
    /// Re-read the host file and reconcile tunnels now
    Reload,
    /// Check that veild answers
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Status) {
        Command::Status => cmd::status::cmd_status(&cli.addr).await,
        Command::Peers => cmd::status::cmd_peers(&cli.addr).await,
        Command::Reload => cmd::reload::cmd_reload(&cli.addr).await,
        Command::Ping => cmd::status::cmd_ping(&cli.addr).await,
    }
}
