//! Userspace backend: one auxiliary worker process per VM.
//!
//! The worker binary links the hypervisor C library and embeds the
//! userspace network stack (NAT + DNS + port forwarding), so the whole VM —
//! network included — is a single supervisable process. Pause is
//! SIGSTOP/SIGCONT on the worker: zero CPU while frozen, which is why this
//! backend declares `persistent_pause`.
//!
//! Host↔guest traffic rides unix sockets: the harness control channel on a
//! pre-bound listener, and guest TCP forwards on one multiplex socket per
//! VM — the dialer writes a one-line JSON preamble naming the guest port,
//! then the stream is spliced raw.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::config::AegisConfig;
use crate::control::{ControlChannel, ControlEndpoint};
use crate::rootfs::{self, RootfsFormat};
use crate::types::Endpoint;

use super::spawn::{signal_pid, spawn_logged, stop_child};
use super::{
    CreateVmRequest, NetworkBackend, StartedVm, VmHandle, VmmCapabilities, VmmDriver,
};

/// Spec handed to the worker binary as `--config <json>`.
#[derive(Debug, Serialize)]
struct WorkerSpec<'a> {
    instance_id: &'a str,
    command: &'a [String],
    env: &'a std::collections::BTreeMap<String, String>,
    rootfs_dir: &'a std::path::Path,
    workspace_dir: Option<&'a std::path::Path>,
    memory_mb: u32,
    vcpus: u8,
    control_socket: &'a std::path::Path,
    net_socket: &'a std::path::Path,
}

struct UserspaceVm {
    request: CreateVmRequest,
    /// Shared so reconnect can accept without holding the state lock.
    endpoint: Arc<ControlEndpoint>,
    net_socket: PathBuf,
    worker: Option<Child>,
    worker_pid: Option<u32>,
}

/// Driver for the worker-process backend.
pub struct UserspaceVmm {
    config: AegisConfig,
    vms: Mutex<HashMap<String, UserspaceVm>>,
}

impl UserspaceVmm {
    pub fn new(config: AegisConfig) -> Self {
        Self {
            config,
            vms: Mutex::new(HashMap::new()),
        }
    }

    fn endpoints_for(&self, vm: &UserspaceVm) -> Vec<Endpoint> {
        let backend_addr = format!("unix:{}", vm.net_socket.display());
        vm.request
            .expose_ports
            .iter()
            .map(|(guest_port, binding)| Endpoint {
                guest_port: *guest_port,
                public_port: binding.public_port,
                protocol: binding.protocol,
                backend_addr: backend_addr.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl VmmDriver for UserspaceVmm {
    fn capabilities(&self) -> VmmCapabilities {
        VmmCapabilities {
            name: "userspace",
            pause: true,
            persistent_pause: true,
            rootfs_type: RootfsFormat::Directory,
            network_backend: NetworkBackend::Userspace,
        }
    }

    async fn create_vm(&self, request: CreateVmRequest) -> AegisResult<VmHandle> {
        rootfs::require_artifact(&request.rootfs, RootfsFormat::Directory)?;

        let layout = self.config.layout();
        let id = request.instance_id.clone();
        let control_path = layout.control_socket_path(&id);
        let net_socket = layout.sockets_dir().join(format!("{id}.net.sock"));

        // Bind the control listener now: the guest can never connect into
        // the void, and the same listener serves reconnects after resume.
        let endpoint = Arc::new(ControlEndpoint::bind(&control_path)?);

        let vm = UserspaceVm {
            request,
            endpoint,
            net_socket,
            worker: None,
            worker_pid: None,
        };
        self.vms.lock().insert(id.clone(), vm);
        Ok(VmHandle(id))
    }

    async fn start_vm(
        &self,
        handle: &VmHandle,
        cancel: &CancellationToken,
    ) -> AegisResult<StartedVm> {
        // Take the VM out of the map for the duration of the boot; the
        // lifecycle manager serializes operations per instance.
        let mut vm = self
            .vms
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;

        let _ = std::fs::remove_file(&vm.net_socket);

        let spec = WorkerSpec {
            instance_id: &vm.request.instance_id,
            command: &vm.request.command,
            env: &vm.request.env,
            rootfs_dir: &vm.request.rootfs.path,
            workspace_dir: vm.request.workspace.as_ref().map(|w| w.path.as_path()),
            memory_mb: vm.request.memory_mb,
            vcpus: vm.request.vcpus,
            control_socket: vm.endpoint.path(),
            net_socket: &vm.net_socket,
        };
        let spec_json = serde_json::to_string(&spec)?;

        let log_path = self
            .config
            .layout()
            .logs_dir()
            .join(format!("{}.worker.log", handle.0));
        let args = vec!["--config".to_string(), spec_json];
        let child = spawn_logged(&self.config.worker_binary, &args, &log_path).await;

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                self.vms.lock().insert(handle.0.clone(), vm);
                return Err(e);
            }
        };
        let pid = child.id().unwrap_or_default();
        tracing::info!(vm = %handle, pid, "worker spawned");

        let handshake = self.config.handshake_timeout;
        let accepted = tokio::select! {
            channel = vm.endpoint.accept(handshake) => channel,
            () = cancel.cancelled() => Err(AegisError::Backend("start cancelled".into())),
        };
        let channel = match accepted {
            Ok(channel) => channel,
            Err(e) => {
                // Roll back: kill the worker, keep the prepared state so a
                // later start can retry.
                let _ = stop_child(&mut child, self.config.stop_grace).await;
                let _ = std::fs::remove_file(&vm.net_socket);
                self.vms.lock().insert(handle.0.clone(), vm);
                return Err(e);
            }
        };

        match channel.wait_ready(handshake).await {
            Ok(_) => {}
            Err(e) => {
                let _ = stop_child(&mut child, self.config.stop_grace).await;
                let _ = std::fs::remove_file(&vm.net_socket);
                self.vms.lock().insert(handle.0.clone(), vm);
                return Err(e);
            }
        }

        vm.worker = Some(child);
        vm.worker_pid = Some(pid);
        let endpoints = self.endpoints_for(&vm);
        self.vms.lock().insert(handle.0.clone(), vm);

        Ok(StartedVm {
            channel,
            hypervisor_pid: pid,
            sidecar_pids: Vec::new(),
            endpoints,
        })
    }

    async fn pause_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let pid = self.worker_pid(handle)?;
        signal_pid(pid, libc::SIGSTOP);
        tracing::debug!(vm = %handle, pid, "worker frozen");
        Ok(())
    }

    async fn resume_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let pid = self.worker_pid(handle)?;
        signal_pid(pid, libc::SIGCONT);
        tracing::debug!(vm = %handle, pid, "worker thawed");
        Ok(())
    }

    async fn reconnect(&self, handle: &VmHandle) -> AegisResult<ControlChannel> {
        // SIGSTOP freezes the transport rather than resetting it, but a
        // harness that noticed the gap may redial; accept on the original
        // listener, without holding the state lock across the await.
        let endpoint = {
            let vms = self.vms.lock();
            let vm = vms
                .get(&handle.0)
                .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
            Arc::clone(&vm.endpoint)
        };
        endpoint.accept(self.config.handshake_timeout).await
    }

    async fn stop_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let Some(mut vm) = self.vms.lock().remove(&handle.0) else {
            return Ok(());
        };
        if let Some(pid) = vm.worker_pid {
            // A frozen worker cannot handle SIGTERM; thaw first.
            signal_pid(pid, libc::SIGCONT);
        }
        if let Some(mut child) = vm.worker.take() {
            stop_child(&mut child, self.config.stop_grace).await?;
        }
        let _ = std::fs::remove_file(&vm.net_socket);
        // Dropping the ControlEndpoint removes the control socket file.
        tracing::info!(vm = %handle, "worker stopped and sockets removed");
        Ok(())
    }

    async fn host_endpoints(&self, handle: &VmHandle) -> AegisResult<Vec<Endpoint>> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        Ok(self.endpoints_for(vm))
    }

    async fn dynamic_expose(&self, handle: &VmHandle, guest_port: u16) -> AegisResult<Endpoint> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        // The multiplex socket carries any guest port; no worker round-trip
        // is needed for a new forward.
        Ok(Endpoint {
            guest_port,
            public_port: 0,
            protocol: Default::default(),
            backend_addr: format!("unix:{}", vm.net_socket.display()),
        })
    }
}

impl UserspaceVmm {
    fn worker_pid(&self, handle: &VmHandle) -> AegisResult<u32> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        vm.worker_pid
            .ok_or_else(|| AegisError::Conflict(format!("vm {handle} is not running")))
    }
}
