//! veil integration test harness.
//!
//! Tests here run `veild` inside real network namespaces.
//! Requires root, the netns environment, and a built workspace:
//!
//!   sudo ./scripts/netns-up.sh
//!   cargo build --workspace
//!   sudo cargo test --test integration
//!
//! charon is replaced by a shell script that only creates the VICI socket,
//! and `swanctl` by `true`, so no strongSwan install is needed.
//! Every test that spawns `veild` holds `DAEMON_LOCK`; the namespaces are shared.

mod api;
mod arp;
mod infra;

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const NS_A: &str = "veil-a";
pub const NS_B: &str = "veil-b";
pub const VETH_A: &str = "veth-a";
pub const VETH_B: &str = "veth-b";
pub const ENDPOINT_A: &str = "172.16.0.1";
pub const ENDPOINT_B: &str = "172.16.0.2";
pub const API_ADDR: &str = "127.0.0.1:8111";

pub static DAEMON_LOCK: Mutex<()> = Mutex::new(());

/// Run a command inside a network namespace.
/// Returns stdout as a String on success, error on non-zero exit.
pub fn netns_exec(ns: &str, args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(["netns", "exec", ns])
        .args(args)
        .output()
        .with_context(|| format!("failed to run: ip netns exec {ns} {args:?}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        bail!(
            "command failed in {ns}: {args:?}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

/// Check whether the netns environment is up.
pub fn netns_available() -> bool {
    Command::new("ip")
        .args(["netns", "exec", NS_A, "ip", "link", "show", VETH_A])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Workspace binaries live next to the test executable's `deps/` directory.
pub fn bin_path(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.parent()?;
    let path = dir.join(name);
    path.exists().then_some(path)
}

/// True when netns and the built binaries are both present. Prints why not.
pub fn ready() -> bool {
    if !netns_available() {
        eprintln!("SKIP: netns not available, run sudo ./scripts/netns-up.sh first");
        return false;
    }
    if bin_path("veild").is_none() {
        eprintln!("SKIP: veild not built, run cargo build --workspace first");
        return false;
    }
    true
}

/// The MAC address of `iface` inside `ns`.
pub fn link_mac(ns: &str, iface: &str) -> Result<veil_core::MacAddr> {
    let text = netns_exec(ns, &["cat", &format!("/sys/class/net/{iface}/address")])?;
    text.trim()
        .parse()
        .with_context(|| format!("bad MAC for {iface} in {ns}: {text:?}"))
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// A scratch directory with a host file, agent config and fake charon.
pub struct NodeDir {
    pub root: PathBuf,
}

impl NodeDir {
    pub fn new(tag: &str) -> Result<Self> {
        let root = std::env::temp_dir().join(format!("veil-it-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root)?;

        let charon = root.join("fake-charon.sh");
        std::fs::write(
            &charon,
            format!(
                "#!/bin/sh\ntouch {}\nexec sleep 3600\n",
                root.join("charon.vici").display()
            ),
        )?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&charon, std::fs::Permissions::from_mode(0o755))?;
        }

        let config = format!(
            r#"[registry]
file = "{root}/hosts.json"
wait_for_file_secs = 5

[network]
interface = "{iface}"

[ipsec]
config_dir = "{root}/ipsec"
charon_binary = "{charon}"
vici_socket = "{root}/charon.vici"
swanctl_binary = "true"
psk = "integration"
start_timeout_secs = 5

[api]
listen = "{api}"
"#,
            root = root.display(),
            iface = VETH_A,
            charon = charon.display(),
            api = API_ADDR,
        );
        std::fs::write(root.join("veil.toml"), config)?;
        Ok(Self { root })
    }

    pub fn write_hosts(&self, hosts: &serde_json::Value) -> Result<()> {
        let tmp = self.root.join("hosts.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&serde_json::json!({ "hosts": hosts }))?)?;
        std::fs::rename(&tmp, self.root.join("hosts.json"))?;
        Ok(())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for NodeDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Start `veild` in `ns` with the node's config.
pub fn spawn_veild(ns: &str, dir: &NodeDir, extra: &[&str]) -> Result<Child> {
    let bin = bin_path("veild").context("veild binary not found")?;
    let log = std::fs::File::create(dir.path("veild.log"))?;
    Command::new("ip")
        .args(["netns", "exec", ns])
        .arg(&bin)
        .arg("--config")
        .arg(dir.path("veil.toml"))
        .arg("--debug")
        .args(extra)
        .stdout(Stdio::null())
        .stderr(log)
        .spawn()
        .context("failed to spawn veild")
}

pub fn api_get(ns: &str, path: &str) -> Result<serde_json::Value> {
    let body = netns_exec(ns, &["curl", "-sf", &format!("http://{API_ADDR}{path}")])?;
    serde_json::from_str(&body).with_context(|| format!("bad JSON from {path}: {body}"))
}

pub fn api_post(ns: &str, path: &str) -> Result<serde_json::Value> {
    let body = netns_exec(ns, &["curl", "-s", "-X", "POST", &format!("http://{API_ADDR}{path}")])?;
    serde_json::from_str(&body).with_context(|| format!("bad JSON from {path}: {body}"))
}

/// Poll `/ping` until veild answers.
pub fn wait_for_api(ns: &str, timeout_secs: u64) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while Instant::now() < deadline {
        if let Ok(out) = netns_exec(ns, &["curl", "-sf", &format!("http://{API_ADDR}/ping")]) {
            if out.trim() == "pong" {
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    bail!("veild API in {ns} did not come up within {timeout_secs}s")
}

pub fn ctl(ns: &str, args: &[&str]) -> Result<String> {
    let bin = bin_path("veil-ctl").context("veil-ctl binary not found")?;
    let bin = bin.to_string_lossy().into_owned();
    let mut full = vec![bin.as_str(), "--addr", API_ADDR];
    full.extend_from_slice(args);
    netns_exec(ns, &full)
}

/// SIGTERM so veild stops its charon child, then SIGKILL if it lingers.
pub fn stop(mut child: Child) {
    let _ = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
    let _ = child.wait();
}

pub fn dump_log(dir: &NodeDir) {
    if let Ok(log) = std::fs::read_to_string(dir.path("veild.log")) {
        eprintln!("── veild.log ──\n{log}");
    }
}

/// Host file with A as the local host and B plus a phantom peer C as remotes.
pub fn three_hosts() -> serde_json::Value {
    serde_json::json!([
        { "id": "a", "endpoint": ENDPOINT_A, "self": true,  "overlay_addresses": ["10.0.1.0/24"] },
        { "id": "b", "endpoint": ENDPOINT_B,                "overlay_addresses": ["10.0.2.0/24"] },
        { "id": "c", "endpoint": "172.16.0.3",              "overlay_addresses": ["10.0.3.0/24"] }
    ])
}
