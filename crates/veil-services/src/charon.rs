//! strongSwan `charon` as the tunnel daemon.
//!
//! Layout under `config_dir`:
//!
//! ```text
//! swanctl.conf          include conf.d/*.conf
//! conf.d/veil-<id>.conf one connection + its PSK per remote peer
//! conf.d/veilx-<hex>.conf same, for ids that are not safe as section names
//! ```
//!
//! Installing or removing a tunnel rewrites its file and runs
//! `swanctl --load-all`, which loads new connections and unloads the ones
//! whose file is gone. The charon process itself is supervised here: it is
//! restarted on unexpected exit until `max_restarts` is exceeded, after which
//! [`TunnelDaemon::exited`] resolves and the agent is expected to terminate.
//! A restarted charon starts from an empty `conf.d`; the reconciler sees the
//! new generation and installs every wanted tunnel again.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use veil_core::config::IpsecConfig;

use crate::daemon::{DaemonError, TunnelDaemon};
use crate::tunnel::TunnelDescriptor;

const CONN_PREFIX: &str = "veil-";
const HEX_CONN_PREFIX: &str = "veilx-";
const RETRY_DELAY: Duration = Duration::from_secs(1);
const READY_POLL: Duration = Duration::from_millis(100);
const SWANCTL_TIMEOUT: Duration = Duration::from_secs(30);
/// A child that ran this long before dying resets the restart budget.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Resolved settings; the PSK has already been read.
#[derive(Debug, Clone)]
pub struct CharonSettings {
    pub config_dir: PathBuf,
    pub charon_binary: PathBuf,
    pub vici_socket: PathBuf,
    pub swanctl_binary: PathBuf,
    pub psk: String,
    pub ike_proposals: String,
    pub esp_proposals: String,
    pub start_attempts: u32,
    pub start_timeout: Duration,
    pub max_restarts: u32,
}

impl CharonSettings {
    pub fn from_config(cfg: &IpsecConfig) -> Result<Self, DaemonError> {
        let psk = match (&cfg.psk_file, &cfg.psk) {
            (Some(path), _) => std::fs::read_to_string(path)
                .map_err(|e| {
                    DaemonError::Config(format!("failed to read PSK file {}: {e}", path.display()))
                })?
                .trim()
                .to_string(),
            (None, Some(psk)) => psk.clone(),
            (None, None) => {
                return Err(DaemonError::Config(
                    "no pre-shared key configured (ipsec.psk or ipsec.psk_file)".to_string(),
                ))
            }
        };
        if psk.is_empty() {
            return Err(DaemonError::Config("pre-shared key is empty".to_string()));
        }

        Ok(Self {
            config_dir: cfg.config_dir.clone(),
            charon_binary: cfg.charon_binary.clone(),
            vici_socket: cfg.vici_socket.clone(),
            swanctl_binary: cfg.swanctl_binary.clone(),
            psk,
            ike_proposals: cfg.ike_proposals.clone(),
            esp_proposals: cfg.esp_proposals.clone(),
            start_attempts: cfg.start_attempts.max(1),
            start_timeout: Duration::from_secs(cfg.start_timeout_secs.max(1)),
            max_restarts: cfg.max_restarts,
        })
    }

    fn root_conf(&self) -> PathBuf {
        self.config_dir.join("swanctl.conf")
    }

    fn conf_d(&self) -> PathBuf {
        self.config_dir.join("conf.d")
    }
}

struct State {
    healthy: AtomicBool,
    generation: watch::Sender<u64>,
    pid: AtomicU32,
    stopping: AtomicBool,
    log_target: Mutex<Option<PathBuf>>,
    fatal: watch::Sender<Option<String>>,
}

impl State {
    /// Announce a freshly started charon. Callers mark it healthy first, so a
    /// woken reconciler finds it usable.
    fn next_generation(&self) -> u64 {
        self.generation.send_modify(|g| *g += 1);
        *self.generation.borrow()
    }
}

pub struct CharonDaemon {
    settings: Arc<CharonSettings>,
    state: Arc<State>,
}

impl CharonDaemon {
    pub fn new(settings: CharonSettings) -> Self {
        let (fatal, _) = watch::channel(None);
        let (generation, _) = watch::channel(0);
        Self {
            settings: Arc::new(settings),
            state: Arc::new(State {
                healthy: AtomicBool::new(false),
                generation,
                pid: AtomicU32::new(0),
                stopping: AtomicBool::new(false),
                log_target: Mutex::new(None),
                fatal,
            }),
        }
    }

    fn conn_path(&self, name: &str) -> PathBuf {
        self.settings.conf_d().join(format!("{name}.conf"))
    }

    /// Write the root include file and clear connection files left by a previous run.
    async fn prepare_config_dir(&self) -> Result<(), DaemonError> {
        let conf_d = self.settings.conf_d();
        tokio::fs::create_dir_all(&conf_d)
            .await
            .map_err(|e| write_error(&conf_d, e))?;
        clear_connections(&self.settings).await?;

        let root = self.settings.root_conf();
        write_atomic(&root, "# generated by veil, do not edit\ninclude conf.d/*.conf\n").await
    }

    async fn load_all(&self) -> Result<(), DaemonError> {
        let root = self.settings.root_conf();
        let root = root.to_string_lossy();
        swanctl(&self.settings, &["--load-all", "--noprompt", "--file", &root]).await
    }
}

#[async_trait]
impl TunnelDaemon for CharonDaemon {
    async fn start(&self, log_target: Option<&Path>) -> Result<(), DaemonError> {
        if let Ok(mut target) = self.state.log_target.lock() {
            *target = log_target.map(Path::to_path_buf);
        }
        self.prepare_config_dir().await?;

        let mut last_error = String::new();
        for attempt in 1..=self.settings.start_attempts {
            match launch(&self.settings, &self.state).await {
                Ok(child) => {
                    self.state.healthy.store(true, Ordering::SeqCst);
                    let generation = self.state.next_generation();
                    tracing::info!(
                        binary = %self.settings.charon_binary.display(),
                        pid = child.id().unwrap_or_default(),
                        generation,
                        "charon ready"
                    );
                    tokio::spawn(supervise(self.settings.clone(), self.state.clone(), child));
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "charon failed to start");
                    last_error = e;
                    if attempt < self.settings.start_attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(DaemonError::StartFailed {
            binary: self.settings.charon_binary.display().to_string(),
            attempts: self.settings.start_attempts,
            reason: last_error,
        })
    }

    async fn install(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError> {
        let name = conn_name(&tunnel.peer_id);
        let path = self.conn_path(&name);
        write_atomic(&path, &render_tunnel(&name, tunnel, &self.settings)).await?;

        if let Err(e) = self.load_all().await {
            // Fail closed: the connection must not linger half-configured.
            let _ = tokio::fs::remove_file(&path).await;
            if let Err(unload) = self.load_all().await {
                tracing::warn!(peer = %tunnel.peer_id, error = %unload, "unload after failed install also failed");
            }
            return Err(e);
        }

        tracing::debug!(peer = %tunnel.peer_id, conn = %name, "tunnel loaded");
        Ok(())
    }

    async fn teardown(&self, tunnel: &TunnelDescriptor) -> Result<(), DaemonError> {
        let name = conn_name(&tunnel.peer_id);
        let path = self.conn_path(&name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_error(&path, e)),
        }

        self.load_all().await?;

        // Unloading the config leaves an established IKE_SA up; kill it too.
        if let Err(e) = swanctl(&self.settings, &["--terminate", "--ike", &name, "--force"]).await {
            tracing::debug!(peer = %tunnel.peer_id, error = %e, "terminate found nothing to close");
        }

        tracing::debug!(peer = %tunnel.peer_id, conn = %name, "tunnel removed");
        Ok(())
    }

    fn healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    fn generation(&self) -> u64 {
        *self.state.generation.borrow()
    }

    fn generations(&self) -> watch::Receiver<u64> {
        self.state.generation.subscribe()
    }

    async fn exited(&self) -> DaemonError {
        let mut rx = self.state.fatal.subscribe();
        loop {
            let reason = rx.borrow_and_update().clone();
            if let Some(reason) = reason {
                return DaemonError::Exited(reason);
            }
            if rx.changed().await.is_err() {
                return DaemonError::Exited("supervisor dropped".to_string());
            }
        }
    }

    async fn stop(&self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        self.state.healthy.store(false, Ordering::SeqCst);
        let pid = self.state.pid.swap(0, Ordering::SeqCst);
        if pid != 0 {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => tracing::info!(pid, "charon stopped"),
                Err(e) => tracing::warn!(pid, error = %e, "failed to signal charon"),
            }
        }
    }
}

// ── Process lifecycle ─────────────────────────────────────────────────────────

/// Spawn charon and wait until its VICI socket appears.
async fn launch(settings: &CharonSettings, state: &State) -> Result<Child, String> {
    match std::fs::remove_file(&settings.vici_socket) {
        Ok(()) => tracing::debug!(socket = %settings.vici_socket.display(), "removed stale VICI socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("cannot remove stale VICI socket: {e}")),
    }

    let log_target = state.log_target.lock().ok().and_then(|t| t.clone());
    let (stdout, stderr) = match log_target {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("cannot open log {}: {e}", path.display()))?;
            let dup = file
                .try_clone()
                .map_err(|e| format!("cannot open log {}: {e}", path.display()))?;
            (Stdio::from(file), Stdio::from(dup))
        }
        None => (Stdio::null(), Stdio::null()),
    };

    let mut child = Command::new(&settings.charon_binary)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn: {e}"))?;
    state.pid.store(child.id().unwrap_or_default(), Ordering::SeqCst);

    let deadline = Instant::now() + settings.start_timeout;
    loop {
        if settings.vici_socket.exists() {
            return Ok(child);
        }
        if let Ok(Some(status)) = child.try_wait() {
            state.pid.store(0, Ordering::SeqCst);
            return Err(format!("exited with {status} before becoming ready"));
        }
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            state.pid.store(0, Ordering::SeqCst);
            return Err(format!(
                "VICI socket {} did not appear within {}s",
                settings.vici_socket.display(),
                settings.start_timeout.as_secs()
            ));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// Watch the running child and relaunch it on unexpected exit.
async fn supervise(settings: Arc<CharonSettings>, state: Arc<State>, mut child: Child) {
    let mut restarts = 0u32;
    loop {
        let started = Instant::now();
        let status = child.wait().await;
        state.healthy.store(false, Ordering::SeqCst);
        state.pid.store(0, Ordering::SeqCst);

        if state.stopping.load(Ordering::SeqCst) {
            return;
        }
        if started.elapsed() >= STABLE_RUN {
            restarts = 0;
        }
        tracing::warn!(status = ?status, "charon exited unexpectedly");

        // The next charon must not pick up tunnels the reconciler no longer
        // tracks; it reinstalls what is still wanted after the restart.
        if let Err(e) = clear_connections(&settings).await {
            tracing::warn!(error = %e, "failed to clear connection files before restart");
        }

        loop {
            restarts += 1;
            if restarts > settings.max_restarts {
                let reason = format!("charon exited {} time(s) in a row", restarts);
                tracing::error!(reason = %reason, "giving up on charon");
                state.fatal.send_replace(Some(reason));
                return;
            }
            tokio::time::sleep(RETRY_DELAY).await;
            if state.stopping.load(Ordering::SeqCst) {
                return;
            }
            match launch(&settings, &state).await {
                Ok(next) => {
                    child = next;
                    break;
                }
                Err(e) => tracing::warn!(restart = restarts, error = %e, "charon restart failed"),
            }
        }

        state.healthy.store(true, Ordering::SeqCst);
        let generation = state.next_generation();
        tracing::info!(generation, restarts, "charon restarted");
    }
}

/// Remove every connection file this agent wrote.
async fn clear_connections(settings: &CharonSettings) -> Result<(), DaemonError> {
    let conf_d = settings.conf_d();
    let mut entries = match tokio::fs::read_dir(&conf_d).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(write_error(&conf_d, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| write_error(&conf_d, e))?
    {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_connection_file(&name) {
            tracing::debug!(file = %name, "removing connection file");
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(write_error(&entry.path(), e)),
            }
        }
    }
    Ok(())
}

fn is_connection_file(name: &str) -> bool {
    (name.starts_with(CONN_PREFIX) || name.starts_with(HEX_CONN_PREFIX)) && name.ends_with(".conf")
}

async fn swanctl(settings: &CharonSettings, args: &[&str]) -> Result<(), DaemonError> {
    let uri = format!("unix://{}", settings.vici_socket.display());
    let command = format!("{} {}", settings.swanctl_binary.display(), args.join(" "));

    let output = tokio::time::timeout(
        SWANCTL_TIMEOUT,
        Command::new(&settings.swanctl_binary)
            .args(args)
            .args(["--uri", &uri])
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| DaemonError::Command {
        command: command.clone(),
        reason: format!("timed out after {}s", SWANCTL_TIMEOUT.as_secs()),
    })?
    .map_err(|e| DaemonError::Command {
        command: command.clone(),
        reason: e.to_string(),
    })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(DaemonError::Command {
            command,
            reason: format!("{}: {}", output.status, detail.trim()),
        })
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// swanctl section name for a peer. Ids outside `[A-Za-z0-9_-]` are hex-encoded
/// under their own prefix, so the two forms never meet.
pub fn conn_name(peer_id: &str) -> String {
    let plain = !peer_id.is_empty()
        && peer_id.len() <= 48
        && peer_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        format!("{CONN_PREFIX}{peer_id}")
    } else {
        format!("{HEX_CONN_PREFIX}{}", hex::encode(peer_id))
    }
}

/// Render one tunnel as a swanctl connection plus its shared secret.
pub fn render_tunnel(name: &str, tunnel: &TunnelDescriptor, settings: &CharonSettings) -> String {
    let join = |nets: &[ipnet::IpNet]| {
        nets.iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    let local_ts = if tunnel.local_subnets.is_empty() {
        "dynamic".to_string()
    } else {
        join(&tunnel.local_subnets)
    };

    let mut out = String::new();
    let _ = writeln!(out, "# generated by veil for peer {:?}, do not edit", tunnel.peer_id);
    let _ = writeln!(out, "connections {{");
    let _ = writeln!(out, "    {name} {{");
    let _ = writeln!(out, "        version = 2");
    let _ = writeln!(out, "        local_addrs = {}", tunnel.local_endpoint);
    let _ = writeln!(out, "        remote_addrs = {}", tunnel.remote_endpoint);
    let _ = writeln!(out, "        proposals = {}", settings.ike_proposals);
    let _ = writeln!(out, "        dpd_delay = 30s");
    let _ = writeln!(out, "        local {{");
    let _ = writeln!(out, "            auth = psk");
    let _ = writeln!(out, "            id = {}", tunnel.local_endpoint);
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "        remote {{");
    let _ = writeln!(out, "            auth = psk");
    let _ = writeln!(out, "            id = {}", tunnel.remote_endpoint);
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "        children {{");
    let _ = writeln!(out, "            {name} {{");
    let _ = writeln!(out, "                local_ts = {local_ts}");
    let _ = writeln!(out, "                remote_ts = {}", join(&tunnel.remote_subnets));
    let _ = writeln!(out, "                esp_proposals = {}", settings.esp_proposals);
    let _ = writeln!(out, "                mode = tunnel");
    let _ = writeln!(out, "                start_action = start");
    let _ = writeln!(out, "                dpd_action = restart");
    let _ = writeln!(out, "            }}");
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out, "secrets {{");
    let _ = writeln!(out, "    ike-{name} {{");
    let _ = writeln!(out, "        id-local = {}", tunnel.local_endpoint);
    let _ = writeln!(out, "        id-remote = {}", tunnel.remote_endpoint);
    let _ = writeln!(out, "        secret = 0x{}", hex::encode(&settings.psk));
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

async fn write_atomic(path: &Path, contents: &str) -> Result<(), DaemonError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| write_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| write_error(path, e))
}

fn write_error(path: &Path, source: std::io::Error) -> DaemonError {
    DaemonError::Write {
        path: path.display().to_string(),
        source,
    }
}
