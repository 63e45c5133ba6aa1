//! veild: veil overlay agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use veil_core::config::VeilConfig;
use veil_services::{
    CharonDaemon, CharonSettings, Coordinator, FileSource, NeighborResponder, PeerRegistry,
    TunnelDaemon, TunnelReconciler,
};

mod bootstrap;
mod cli;
mod neighbor;

use bootstrap::PidFile;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    bootstrap::init_logging(cli.debug, cli.log.as_deref())?;

    let mut config = VeilConfig::load(cli.config.as_deref()).context("failed to load config")?;
    cli.apply(&mut config);

    let _pid_file = cli.pid_file.as_deref().map(PidFile::write).transpose()?;

    tracing::info!(
        file = %config.registry.file.display(),
        interface = %config.network.interface,
        listen = %config.api.listen,
        "veild starting"
    );

    // ── Registry ─────────────────────────────────────────────────────────────

    bootstrap::wait_for_file(
        &config.registry.file,
        Duration::from_secs(config.registry.wait_for_file_secs),
    )
    .await?;

    let registry = PeerRegistry::new(
        FileSource::new(&config.registry.file),
        config.registry.local_ip,
    );
    registry
        .refresh()
        .await
        .context("failed to load host file")?;

    // ── Interfaces ───────────────────────────────────────────────────────────

    let local_mac = neighbor::interface_mac(&config.network.interface)?;
    let arp_socket = neighbor::ArpSocket::bind(&config.network.interface)?;
    let listener = TcpListener::bind(config.api.listen)
        .await
        .with_context(|| format!("failed to bind control API on {}", config.api.listen))?;

    // ── Tunnel daemon ────────────────────────────────────────────────────────

    let settings = CharonSettings::from_config(&config.ipsec).context("invalid ipsec config")?;
    let daemon: Arc<dyn TunnelDaemon> = Arc::new(CharonDaemon::new(settings));
    daemon
        .start(config.ipsec.charon_log.as_deref())
        .await
        .context("failed to start charon")?;

    let reconciler = TunnelReconciler::new(registry.clone(), daemon.clone());
    let coordinator = Arc::new(
        Coordinator::new(registry.clone(), reconciler)
            .reconcile_every(Duration::from_secs(config.reconcile.interval_secs))
            .refresh_every(Some(Duration::from_secs(config.registry.refresh_interval_secs))),
    );
    if let Err(e) = coordinator.reconcile().await {
        tracing::warn!(error = %e, "initial reconcile failed, will retry");
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    let neighbor_task = tokio::spawn(neighbor::responder_loop(
        arp_socket,
        NeighborResponder::new(registry.clone(), local_mac),
    ));

    let reconcile_task: JoinHandle<Result<()>> = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.run_reconcile_loop().await;
            Ok(())
        })
    };

    let refresh_task: JoinHandle<Result<()>> = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.run_refresh_loop().await;
            Ok(())
        })
    };

    let api_task = tokio::spawn(veil_api::serve(
        listener,
        veil_api::ApiState {
            coordinator: coordinator.clone(),
        },
    ));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let outcome = tokio::select! {
        r = neighbor_task  => Err(task_ended("neighbor responder", r)),
        r = reconcile_task => Err(task_ended("reconcile loop", r)),
        r = refresh_task   => Err(task_ended("refresh loop", r)),
        r = api_task       => Err(task_ended("control API", r)),
        e = daemon.exited() => Err(anyhow!(e).context("tunnel daemon lost")),
        r = shutdown_signal() => r.map(|sig| tracing::info!(signal = sig, "shutting down")),
    };

    if let Err(e) = &outcome {
        tracing::error!("fatal, exiting: {e:#}");
    }
    daemon.stop().await;
    outcome
}

fn task_ended(name: &str, joined: Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match joined {
        Ok(Ok(())) => anyhow!("{name} exited"),
        Ok(Err(e)) => e.context(format!("{name} failed")),
        Err(e) => anyhow!("{name} panicked: {e}"),
    }
}

async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r.context("failed to listen for ctrl-c")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
