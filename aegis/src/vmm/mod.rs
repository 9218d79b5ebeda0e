//! Hypervisor abstraction.
//!
//! Core code talks to one [`VmmDriver`] surface; two concrete drivers exist:
//! a userspace backend that delegates to an auxiliary worker process
//! (which links the hypervisor C library and embeds the userspace network
//! stack) and a tap backend driving a hypervisor that exposes a REST
//! control socket. Optional operations live on [`SnapshotCapable`], probed
//! once at startup.

pub mod fake;
pub mod subnet;
pub mod spawn;
pub mod tap;
pub mod userspace;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::control::ControlChannel;
use crate::rootfs::{RootfsArtifact, RootfsFormat};
use crate::types::{Endpoint, PortBinding, WorkspaceRef};

/// Selector for the concrete driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmmKind {
    Userspace,
    Tap,
}

impl fmt::Display for VmmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmmKind::Userspace => f.write_str("userspace"),
            VmmKind::Tap => f.write_str("tap"),
        }
    }
}

impl FromStr for VmmKind {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "userspace" => Ok(VmmKind::Userspace),
            "tap" => Ok(VmmKind::Tap),
            other => Err(AegisError::Validation(format!(
                "unknown vmm backend '{other}' (expected 'userspace' or 'tap')"
            ))),
        }
    }
}

/// Networking style a driver provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackend {
    Tap,
    Userspace,
}

/// What a driver can and cannot do, probed once.
#[derive(Debug, Clone, Copy)]
pub struct VmmCapabilities {
    pub name: &'static str,
    /// Supports pause at all.
    pub pause: bool,
    /// Pause costs zero CPU indefinitely; the stop-after-idle timer is
    /// skipped for such backends.
    pub persistent_pause: bool,
    pub rootfs_type: RootfsFormat,
    pub network_backend: NetworkBackend,
}

/// Everything a driver needs to prepare one VM.
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    pub instance_id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub rootfs: RootfsArtifact,
    pub workspace: Option<WorkspaceRef>,
    pub memory_mb: u32,
    pub vcpus: u8,
    /// guest_port → requested binding, resolved public ports.
    pub expose_ports: BTreeMap<u16, PortBinding>,
    /// /30 slot pre-allocated at instance create time (tap backend only).
    pub subnet_slot: Option<u16>,
}

/// Driver-scoped identifier for a prepared or running VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmHandle(pub String);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful boot: the framed harness channel plus the
/// process- and endpoint-level facts the lifecycle manager persists.
pub struct StartedVm {
    pub channel: ControlChannel,
    pub hypervisor_pid: u32,
    pub sidecar_pids: Vec<u32>,
    pub endpoints: Vec<Endpoint>,
}

/// Uniform hypervisor surface. All operations are idempotent where the
/// contract says so; `stop_vm` in particular tolerates already-dead VMs.
#[async_trait]
pub trait VmmDriver: Send + Sync {
    fn capabilities(&self) -> VmmCapabilities;

    /// Prepare state, sockets and network identity. No process spawns yet.
    async fn create_vm(&self, request: CreateVmRequest) -> AegisResult<VmHandle>;

    /// Spawn the hypervisor process(es) and wait for the harness handshake
    /// on the pre-bound channel.
    async fn start_vm(
        &self,
        handle: &VmHandle,
        cancel: &CancellationToken,
    ) -> AegisResult<StartedVm>;

    /// Best-effort pause with RAM retained.
    async fn pause_vm(&self, handle: &VmHandle) -> AegisResult<()>;

    async fn resume_vm(&self, handle: &VmHandle) -> AegisResult<()>;

    /// Re-accept the harness connection after a transport reset (resume).
    async fn reconnect(&self, handle: &VmHandle) -> AegisResult<ControlChannel>;

    /// Terminate everything and release every resource. Idempotent.
    async fn stop_vm(&self, handle: &VmHandle) -> AegisResult<()>;

    /// Resolved host-side endpoint set for a live VM.
    async fn host_endpoints(&self, handle: &VmHandle) -> AegisResult<Vec<Endpoint>>;

    /// Allocate a guest-port forward at runtime; returns the backend
    /// address the router should dial.
    async fn dynamic_expose(&self, handle: &VmHandle, guest_port: u16) -> AegisResult<Endpoint>;

    /// Secondary capability surface, probed once at startup.
    fn as_snapshot(&self) -> Option<&dyn SnapshotCapable> {
        None
    }
}

/// Optional snapshot surface. Network identity is never restored across a
/// host restart — recovery re-allocates subnets and restarts VMs.
#[async_trait]
pub trait SnapshotCapable: Send + Sync {
    async fn snapshot_vm(&self, handle: &VmHandle) -> AegisResult<std::path::PathBuf>;
    async fn restore_vm(&self, handle: &VmHandle) -> AegisResult<()>;
}
