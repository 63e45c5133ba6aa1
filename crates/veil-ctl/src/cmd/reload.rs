//! Force a host file refresh and reconcile.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, post_json};

#[derive(Deserialize)]
struct ReloadResponse {
    changed: bool,
    revision: u64,
    installed: Vec<String>,
    removed: Vec<String>,
}

pub async fn cmd_reload(addr: &str) -> Result<()> {
    let resp: ReloadResponse = post_json(&format!("{}/reload", base_url(addr))).await?;

    if resp.changed {
        println!("Host file changed, now at revision {}.", resp.revision);
    } else {
        println!("Host file unchanged (revision {}).", resp.revision);
    }
    for id in &resp.removed {
        println!("  - {}", id);
    }
    for id in &resp.installed {
        println!("  + {}", id);
    }
    if resp.installed.is_empty() && resp.removed.is_empty() {
        println!("Tunnels already up to date.");
    }
    Ok(())
}
