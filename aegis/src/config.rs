//! Daemon configuration and state-directory layout.
//!
//! One [`AegisConfig`] value is built at startup and threaded explicitly to
//! every component — no ambient singletons. Sources, highest precedence
//! first: command-line flags, environment, `$AEGIS_HOME/config.json`,
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aegis_shared::errors::{AegisError, AegisResult};

use crate::vmm::VmmKind;

/// Environment variables the daemon itself consumes. The agent-facing
/// `AEGIS_MODEL` / `AEGIS_MAX_TOKENS` / `AEGIS_CONTEXT_*` /
/// `AEGIS_SYSTEM_PROMPT` variables are forwarded opaquely into guest env
/// maps and never interpreted here.
pub mod envs {
    pub const AEGIS_HOME: &str = "AEGIS_HOME";
    pub const AEGIS_SOCKET: &str = "AEGIS_SOCKET";
    pub const AEGIS_PAUSE_AFTER_IDLE_SECS: &str = "AEGIS_PAUSE_AFTER_IDLE_SECS";
    pub const AEGIS_STOP_AFTER_IDLE_SECS: &str = "AEGIS_STOP_AFTER_IDLE_SECS";

    /// Variables passed through to the in-guest agent untouched.
    pub const FORWARDED: &[&str] = &[
        "AEGIS_MODEL",
        "AEGIS_MAX_TOKENS",
        "AEGIS_CONTEXT_CHARS",
        "AEGIS_CONTEXT_TURNS",
        "AEGIS_SYSTEM_PROMPT",
    ];
}

/// Resource defaults applied when a spec leaves them unset.
pub mod vm_defaults {
    pub const DEFAULT_VCPUS: u8 = 1;
    pub const DEFAULT_MEMORY_MB: u32 = 2048;
}

/// Complete, resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct AegisConfig {
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    /// running → paused after this much inactivity.
    pub pause_after_idle: Duration,
    /// paused → stopped after this much further inactivity (skipped for
    /// backends with persistent pause).
    pub stop_after_idle: Duration,
    /// Deadline for the first harness `ready` after hypervisor spawn.
    pub handshake_timeout: Duration,
    /// End-to-end budget for `start`; rollback on expiry.
    pub start_timeout: Duration,
    /// SIGTERM → SIGKILL escalation window.
    pub stop_grace: Duration,
    pub default_memory_mb: u32,
    pub default_vcpus: u8,
    /// First two octets of the /16 pool carved into per-VM /30s.
    pub subnet_pool: [u8; 2],
    /// Default hypervisor backend for new instances.
    pub vmm: VmmKind,
    /// Auxiliary worker binary for the userspace backend.
    pub worker_binary: PathBuf,
    /// Hypervisor binary (REST control socket) for the tap backend.
    pub hypervisor_binary: PathBuf,
    pub virtiofsd_binary: PathBuf,
    /// External rootfs materializer (image ref → directory or block image).
    pub rootfs_provider_binary: PathBuf,
    /// Frames retained per instance in the tether ring.
    pub tether_ring_capacity: usize,
}

impl AegisConfig {
    /// Resolve configuration from defaults, the optional config file and the
    /// environment. Flags are applied by the caller on top (highest
    /// precedence).
    pub fn load(data_dir_override: Option<PathBuf>) -> AegisResult<Self> {
        let data_dir = match data_dir_override {
            Some(dir) => dir,
            None => match std::env::var_os(envs::AEGIS_HOME) {
                Some(dir) => PathBuf::from(dir),
                None => dirs::home_dir()
                    .ok_or_else(|| {
                        AegisError::Fatal("cannot determine home directory".to_string())
                    })?
                    .join(".aegis"),
            },
        };

        let mut config = Self::defaults_for(data_dir);

        let file = config.data_dir.join("config.json");
        if file.exists() {
            let raw = std::fs::read_to_string(&file)
                .map_err(|e| AegisError::Fatal(format!("read {}: {e}", file.display())))?;
            let overrides: ConfigFile = serde_json::from_str(&raw)
                .map_err(|e| AegisError::Fatal(format!("parse {}: {e}", file.display())))?;
            config.apply_file(overrides);
        }

        config.apply_env();
        Ok(config)
    }

    /// Built-in defaults rooted at `data_dir`.
    pub fn defaults_for(data_dir: PathBuf) -> Self {
        let socket_path = data_dir.join("aegisd.sock");
        Self {
            data_dir,
            socket_path,
            pause_after_idle: Duration::from_secs(60),
            stop_after_idle: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(90),
            start_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            default_memory_mb: vm_defaults::DEFAULT_MEMORY_MB,
            default_vcpus: vm_defaults::DEFAULT_VCPUS,
            subnet_pool: [10, 177],
            vmm: VmmKind::Userspace,
            worker_binary: PathBuf::from("aegis-krun-worker"),
            hypervisor_binary: PathBuf::from("aegis-hv"),
            virtiofsd_binary: PathBuf::from("virtiofsd"),
            rootfs_provider_binary: PathBuf::from("aegis-rootfs"),
            tether_ring_capacity: 1000,
        }
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(path) = file.socket_path {
            self.socket_path = path;
        }
        if let Some(secs) = file.pause_after_idle_secs {
            self.pause_after_idle = Duration::from_secs(secs);
        }
        if let Some(secs) = file.stop_after_idle_secs {
            self.stop_after_idle = Duration::from_secs(secs);
        }
        if let Some(vmm) = file.vmm {
            self.vmm = vmm;
        }
        if let Some(path) = file.worker_binary {
            self.worker_binary = path;
        }
        if let Some(path) = file.hypervisor_binary {
            self.hypervisor_binary = path;
        }
        if let Some(path) = file.virtiofsd_binary {
            self.virtiofsd_binary = path;
        }
        if let Some(path) = file.rootfs_provider_binary {
            self.rootfs_provider_binary = path;
        }
        if let Some(mb) = file.default_memory_mb {
            self.default_memory_mb = mb;
        }
        if let Some(n) = file.default_vcpus {
            self.default_vcpus = n;
        }
    }

    fn apply_env(&mut self) {
        if let Some(path) = std::env::var_os(envs::AEGIS_SOCKET) {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(secs) = env_secs(envs::AEGIS_PAUSE_AFTER_IDLE_SECS) {
            self.pause_after_idle = secs;
        }
        if let Some(secs) = env_secs(envs::AEGIS_STOP_AFTER_IDLE_SECS) {
            self.stop_after_idle = secs;
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            data_dir: self.data_dir.clone(),
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Operator config file shape (`$AEGIS_HOME/config.json`); every field
/// optional and additive over the defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    socket_path: Option<PathBuf>,
    #[serde(default)]
    pause_after_idle_secs: Option<u64>,
    #[serde(default)]
    stop_after_idle_secs: Option<u64>,
    #[serde(default)]
    vmm: Option<VmmKind>,
    #[serde(default)]
    worker_binary: Option<PathBuf>,
    #[serde(default)]
    hypervisor_binary: Option<PathBuf>,
    #[serde(default)]
    virtiofsd_binary: Option<PathBuf>,
    #[serde(default)]
    rootfs_provider_binary: Option<PathBuf>,
    #[serde(default)]
    default_memory_mb: Option<u32>,
    #[serde(default)]
    default_vcpus: Option<u8>,
}

/// Path helpers for the persistent state directory.
///
/// ```text
/// ~/.aegis/
///   aegisd.sock  aegisd.pid  aegis.db  master.key
///   data/{workspaces,overlays,logs,sockets,snapshots}/
///   kernel/vmlinux
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    data_dir: PathBuf,
}

impl Layout {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("aegisd.pid")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("aegis.db")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.data_dir.join("kernel").join("vmlinux")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("workspaces")
    }

    pub fn overlays_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("overlays")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("logs")
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("sockets")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("snapshots")
    }

    /// Cache the rootfs provider materializes artifacts into.
    pub fn rootfs_cache_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("rootfs")
    }

    pub fn kits_path(&self) -> PathBuf {
        self.data_dir.join("kits.json")
    }

    /// Append-only NDJSON life-event log for one instance.
    pub fn instance_log_path(&self, id: &str) -> PathBuf {
        self.logs_dir().join(format!("{id}.ndjson"))
    }

    pub fn instance_workspace_dir(&self, id: &str) -> PathBuf {
        self.workspaces_dir().join(id)
    }

    pub fn instance_overlay_dir(&self, id: &str) -> PathBuf {
        self.overlays_dir().join(id)
    }

    pub fn instance_snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    /// Pre-bound unix socket the guest harness dials (vsock impersonation).
    pub fn control_socket_path(&self, id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{id}.control.sock"))
    }

    /// Hypervisor REST control socket (tap backend).
    pub fn hypervisor_socket_path(&self, id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{id}.hv.sock"))
    }

    /// Per-connection guest port forward socket (userspace backend).
    pub fn expose_socket_path(&self, id: &str, guest_port: u16) -> PathBuf {
        self.sockets_dir().join(format!("{id}.p{guest_port}.sock"))
    }

    pub fn virtiofsd_socket_path(&self, id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{id}.fs.sock"))
    }

    /// Create every directory the daemon writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.data_dir.clone(),
            self.workspaces_dir(),
            self.overlays_dir(),
            self.logs_dir(),
            self.sockets_dir(),
            self.snapshots_dir(),
            self.data_dir.join("kernel"),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_idle_policy() {
        let config = AegisConfig::defaults_for(PathBuf::from("/tmp/aegis-test"));
        assert_eq!(config.pause_after_idle, Duration::from_secs(60));
        assert_eq!(config.stop_after_idle, Duration::from_secs(300));
        assert_eq!(config.handshake_timeout, Duration::from_secs(90));
        assert_eq!(config.start_timeout, Duration::from_secs(120));
        assert_eq!(config.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn layout_paths() {
        let layout = Layout::new(PathBuf::from("/home/u/.aegis"));
        assert_eq!(
            layout.db_path(),
            PathBuf::from("/home/u/.aegis/aegis.db")
        );
        assert_eq!(
            layout.instance_log_path("abc"),
            PathBuf::from("/home/u/.aegis/data/logs/abc.ndjson")
        );
        assert_eq!(
            layout.control_socket_path("abc"),
            PathBuf::from("/home/u/.aegis/data/sockets/abc.control.sock")
        );
    }
}
