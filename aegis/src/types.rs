//! Core data model: instances, endpoints, leases, port bindings.
//!
//! Everything here is persisted verbatim in the registry; the lifecycle
//! manager owns the mutable copies and the registry holds the durable shadow.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aegis_shared::errors::{AegisError, AegisResult};

/// Unique instance identifier (ULID), assigned at create time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Instance lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Starting,
    Running,
    Paused,
    Stopped,
    Disabled,
    Failed,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Creating => "creating",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Paused => "paused",
            InstanceState::Stopped => "stopped",
            InstanceState::Disabled => "disabled",
            InstanceState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> AegisResult<Self> {
        match s {
            "creating" => Ok(InstanceState::Creating),
            "starting" => Ok(InstanceState::Starting),
            "running" => Ok(InstanceState::Running),
            "paused" => Ok(InstanceState::Paused),
            "stopped" => Ok(InstanceState::Stopped),
            "disabled" => Ok(InstanceState::Disabled),
            "failed" => Ok(InstanceState::Failed),
            other => Err(AegisError::Validation(format!(
                "unknown instance state '{other}'"
            ))),
        }
    }

    /// A VM handle exists exactly in these states.
    pub fn has_vm(self) -> bool {
        matches!(
            self,
            InstanceState::Starting | InstanceState::Running | InstanceState::Paused
        )
    }

    /// Host endpoints are resolved exactly in these states.
    pub fn has_endpoints(self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Paused)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared protocol for an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    #[default]
    Tcp,
    Http,
}

/// Persisted half of a port mapping, keyed by guest port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub public_port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
}

/// A resolved host-side binding, populated while the instance is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub guest_port: u16,
    pub public_port: u16,
    #[serde(default)]
    pub protocol: PortProtocol,
    /// Address the router dials to reach the guest port: `ip:port` for tap
    /// networking, a unix socket path for userspace networking.
    pub backend_addr: String,
}

/// Bounded-TTL hold pinning an instance to `running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Workspace attached to an instance. System-allocated workspaces are
/// removed on destroy/prune; operator-supplied paths are left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub path: PathBuf,
    pub system_owned: bool,
}

/// Declarative description accepted by `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub kit: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    /// Host path to share as the guest workspace; absent means a
    /// system-allocated workspace directory.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_refs: BTreeSet<String>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub vcpus: Option<u8>,
    /// guest_port → requested binding; `public_port == 0` asks the host to
    /// allocate one.
    #[serde(default)]
    pub expose_ports: BTreeMap<u16, PortBinding>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// The central persisted entity. Every field survives a daemon restart;
/// transient fields (`vm_handle`, pids, endpoints) are cleared when the
/// instance is not live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub handle: Option<String>,
    pub state: InstanceState,
    pub enabled: bool,
    pub command: Vec<String>,
    pub image_ref: String,
    pub kit: Option<String>,
    pub workspace: Option<WorkspaceRef>,
    pub env: BTreeMap<String, String>,
    pub secret_refs: BTreeSet<String>,
    pub memory_mb: u32,
    pub vcpus: u8,
    pub expose_ports: BTreeMap<u16, PortBinding>,
    pub endpoints: Vec<Endpoint>,
    pub vm_handle: Option<String>,
    pub hypervisor_pid: Option<u32>,
    pub sidecar_pids: Vec<u32>,
    /// Allocated /30 slot, kept across stop so recovery can sweep it.
    pub subnet_slot: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
}

impl InstanceRecord {
    /// Stamp a mutation time. Called by the manager on every committed change.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Clear everything that only makes sense while a VM exists.
    pub fn clear_transient(&mut self) {
        self.vm_handle = None;
        self.hypervisor_pid = None;
        self.sidecar_pids.clear();
        self.endpoints.clear();
    }

    /// Check the persisted-state invariants. Used by debug assertions and
    /// the registry tests; a violation is a bug, not an operator error.
    pub fn check_invariants(&self) -> AegisResult<()> {
        if !self.endpoints.is_empty() && !self.state.has_endpoints() {
            return Err(AegisError::Fatal(format!(
                "instance {}: endpoints populated in state {}",
                self.id, self.state
            )));
        }
        if self.state.has_endpoints() && !self.expose_ports.is_empty() && self.endpoints.is_empty()
        {
            return Err(AegisError::Fatal(format!(
                "instance {}: exposed ports unresolved in state {}",
                self.id, self.state
            )));
        }
        if self.state.has_vm() != self.vm_handle.is_some() {
            return Err(AegisError::Fatal(format!(
                "instance {}: vm_handle {:?} inconsistent with state {}",
                self.id, self.vm_handle, self.state
            )));
        }
        if !self.enabled
            && !matches!(
                self.state,
                InstanceState::Stopped | InstanceState::Disabled
            )
        {
            return Err(AegisError::Fatal(format!(
                "instance {}: disabled but in state {}",
                self.id, self.state
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_round_trip() {
        for state in [
            InstanceState::Creating,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Paused,
            InstanceState::Stopped,
            InstanceState::Disabled,
            InstanceState::Failed,
        ] {
            assert_eq!(InstanceState::parse(state.as_str()).unwrap(), state);
        }
        assert!(InstanceState::parse("zombie").is_err());
    }

    #[test]
    fn lease_expiry() {
        let lease = Lease {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            reason: "test".into(),
        };
        assert!(lease.is_expired(Utc::now()));
    }

    #[test]
    fn spec_defaults_enabled() {
        let spec: InstanceSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.enabled);
        assert!(spec.command.is_empty());
    }
}
