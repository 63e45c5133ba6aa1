//! Agent status, peers and liveness commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, get_text};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    revision: u64,
    local: Option<String>,
    peers: usize,
    remotes: usize,
    warnings: Vec<RecordWarning>,
    tunnels: Vec<String>,
    daemon_healthy: bool,
    daemon_generation: u64,
    last_reconcile: Option<ReconcileOutcome>,
    last_refresh_error: Option<String>,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct RecordWarning {
    index: usize,
    id: Option<String>,
    reason: String,
}

#[derive(Deserialize)]
struct ReconcileOutcome {
    ok: bool,
    at: u64,
    revision: Option<u64>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct PeersResponse {
    revision: u64,
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    id: String,
    endpoint: String,
    #[serde(rename = "self")]
    is_self: bool,
    overlay_addresses: Vec<String>,
    revision: u64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(addr: &str) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(addr))).await?;

    println!("═══════════════════════════════════════");
    println!("  veil Agent Status");
    println!("═══════════════════════════════════════");
    println!("  Registry revision : {}", resp.revision);
    println!("  Local host        : {}", resp.local.as_deref().unwrap_or("(unknown)"));
    println!("  Peers             : {} ({} remote)", resp.peers, resp.remotes);
    println!("  Tunnels applied   : {}", resp.tunnels.len());
    println!(
        "  charon            : {} (generation {})",
        if resp.daemon_healthy { "running" } else { "DOWN" },
        resp.daemon_generation
    );
    println!("  Uptime            : {}s", resp.uptime_secs);

    match &resp.last_reconcile {
        None => println!("\n  No reconcile yet."),
        Some(r) if r.ok => println!(
            "\n  Last reconcile OK at {} (revision {})",
            r.at,
            r.revision.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
        ),
        Some(r) => println!(
            "\n  Last reconcile FAILED at {}: {}",
            r.at,
            r.error.as_deref().unwrap_or("unknown error")
        ),
    }
    if let Some(err) = &resp.last_refresh_error {
        println!("  Last refresh FAILED: {}", err);
    }

    if !resp.warnings.is_empty() {
        println!("\n  Rejected host records:");
        for w in &resp.warnings {
            println!(
                "  • #{} {}: {}",
                w.index,
                w.id.as_deref().unwrap_or("?"),
                w.reason
            );
        }
    }

    Ok(())
}

pub async fn cmd_peers(addr: &str) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(addr))).await?;

    if resp.peers.is_empty() {
        println!("No peers known (revision {}).", resp.revision);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Peers ({}, revision {})", resp.peers.len(), resp.revision);
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        let marker = if p.is_self { " (self)" } else { "" };
        println!("  ┌─ {}{}", p.id, marker);
        println!("  │  endpoint : {}", p.endpoint);
        println!("  │  overlay  : {}", p.overlay_addresses.join(", "));
        println!("  └─ revision : {}", p.revision);
    }

    Ok(())
}

pub async fn cmd_ping(addr: &str) -> Result<()> {
    let body = get_text(&format!("http://{}/ping", addr)).await?;
    println!("{}", body.trim());
    Ok(())
}
