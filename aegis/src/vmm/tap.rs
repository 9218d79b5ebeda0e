//! Tap backend: kernel networking plus a hypervisor with a REST control
//! socket.
//!
//! Each VM gets a /30 (host `.1`, guest `.2`), a tap device and MASQUERADE +
//! FORWARD rules; the router dials the guest IP directly, so there is no
//! per-connection forwarding table. Pause and resume are native hypervisor
//! operations (`vm.pause`/`vm.resume` over HTTP on the API socket), but a
//! paused VM still costs host RAM, so `persistent_pause` is false and the
//! stop-after-idle timer applies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use aegis_shared::errors::{AegisError, AegisResult};

use crate::config::AegisConfig;
use crate::control::{ControlChannel, ControlEndpoint};
use crate::net::NetPlane;
use crate::rootfs::{self, RootfsFormat};
use crate::types::Endpoint;
use crate::vmm::subnet::{SubnetAllocator, SubnetSlot};

use super::spawn::{spawn_logged, stop_child};
use super::{
    CreateVmRequest, NetworkBackend, SnapshotCapable, StartedVm, VmHandle, VmmCapabilities,
    VmmDriver,
};

struct TapVm {
    request: CreateVmRequest,
    slot: SubnetSlot,
    endpoint: Arc<ControlEndpoint>,
    api_socket: PathBuf,
    hypervisor: Option<Child>,
    hypervisor_pid: Option<u32>,
    virtiofsd: Option<Child>,
    sidecar_pids: Vec<u32>,
}

/// Driver for the tap + REST-socket backend.
pub struct TapVmm {
    config: AegisConfig,
    subnets: Arc<SubnetAllocator>,
    net: NetPlane,
    vms: Mutex<HashMap<String, TapVm>>,
}

impl TapVmm {
    pub fn new(config: AegisConfig, subnets: Arc<SubnetAllocator>, net: NetPlane) -> Self {
        Self {
            config,
            subnets,
            net,
            vms: Mutex::new(HashMap::new()),
        }
    }

    fn endpoints_for(vm: &TapVm) -> Vec<Endpoint> {
        let guest_ip = vm.slot.guest_ip();
        vm.request
            .expose_ports
            .iter()
            .map(|(guest_port, binding)| Endpoint {
                guest_port: *guest_port,
                public_port: binding.public_port,
                protocol: binding.protocol,
                backend_addr: format!("tcp:{guest_ip}:{guest_port}"),
            })
            .collect()
    }

    /// The subnet slot an instance held in a previous daemon life; recovery
    /// feeds these back so the allocator never re-issues them.
    pub fn reserve_slot(&self, index: u16) {
        self.subnets.advance_past(index);
    }

    async fn teardown_network(&self, slot: &SubnetSlot) {
        let _ = self
            .net
            .remove_nat(slot.index, &slot.tap_name(), &slot.cidr())
            .await;
        let _ = self.net.delete_tap(&slot.tap_name()).await;
    }
}

#[async_trait]
impl VmmDriver for TapVmm {
    fn capabilities(&self) -> VmmCapabilities {
        VmmCapabilities {
            name: "tap",
            pause: true,
            persistent_pause: false,
            rootfs_type: RootfsFormat::BlockImage,
            network_backend: NetworkBackend::Tap,
        }
    }

    async fn create_vm(&self, request: CreateVmRequest) -> AegisResult<VmHandle> {
        rootfs::require_artifact(&request.rootfs, RootfsFormat::BlockImage)?;

        let layout = self.config.layout();
        let id = request.instance_id.clone();
        // Prefer the slot the lifecycle manager reserved at instance create
        // time; allocate fresh only for direct driver users.
        let slot = match request.subnet_slot {
            Some(index) => SubnetSlot::new(self.config.subnet_pool, index),
            None => self.subnets.allocate()?,
        };
        let endpoint = Arc::new(ControlEndpoint::bind(&layout.control_socket_path(&id))?);
        let api_socket = layout.hypervisor_socket_path(&id);
        let _ = std::fs::remove_file(&api_socket);

        let vm = TapVm {
            request,
            slot,
            endpoint,
            api_socket,
            hypervisor: None,
            hypervisor_pid: None,
            virtiofsd: None,
            sidecar_pids: Vec::new(),
        };
        self.vms.lock().insert(id.clone(), vm);
        Ok(VmHandle(id))
    }

    async fn start_vm(
        &self,
        handle: &VmHandle,
        cancel: &CancellationToken,
    ) -> AegisResult<StartedVm> {
        let mut vm = self
            .vms
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;

        match self.boot(handle, &mut vm, cancel).await {
            Ok(started) => {
                self.vms.lock().insert(handle.0.clone(), vm);
                Ok(started)
            }
            Err(e) => {
                // Rollback in reverse allocation order, then keep the
                // prepared state for a later retry.
                if let Some(mut child) = vm.hypervisor.take() {
                    let _ = stop_child(&mut child, self.config.stop_grace).await;
                }
                if let Some(mut child) = vm.virtiofsd.take() {
                    let _ = stop_child(&mut child, self.config.stop_grace).await;
                }
                vm.hypervisor_pid = None;
                vm.sidecar_pids.clear();
                self.teardown_network(&vm.slot).await;
                let _ = std::fs::remove_file(&vm.api_socket);
                self.vms.lock().insert(handle.0.clone(), vm);
                Err(e)
            }
        }
    }

    async fn pause_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let socket = self.api_socket(handle)?;
        api_put(&socket, "/api/v1/vm.pause").await
    }

    async fn resume_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let socket = self.api_socket(handle)?;
        api_put(&socket, "/api/v1/vm.resume").await
    }

    async fn reconnect(&self, handle: &VmHandle) -> AegisResult<ControlChannel> {
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

        // Ask the hypervisor first so the guest can sync filesystems; the
        // SIGTERM path is the backstop.
        let _ = api_put(&vm.api_socket, "/api/v1/vm.shutdown").await;

        if let Some(mut child) = vm.hypervisor.take() {
            stop_child(&mut child, self.config.stop_grace).await?;
        }
        if let Some(mut child) = vm.virtiofsd.take() {
            let _ = stop_child(&mut child, self.config.stop_grace).await;
        }
        self.teardown_network(&vm.slot).await;
        let _ = std::fs::remove_file(&vm.api_socket);
        tracing::info!(vm = %handle, tap = %vm.slot.tap_name(), "hypervisor stopped, network released");
        Ok(())
    }

    async fn host_endpoints(&self, handle: &VmHandle) -> AegisResult<Vec<Endpoint>> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        Ok(Self::endpoints_for(vm))
    }

    async fn dynamic_expose(&self, handle: &VmHandle, guest_port: u16) -> AegisResult<Endpoint> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        // Direct dial: any guest port is reachable over the /30.
        Ok(Endpoint {
            guest_port,
            public_port: 0,
            protocol: Default::default(),
            backend_addr: format!("tcp:{}:{guest_port}", vm.slot.guest_ip()),
        })
    }

    fn as_snapshot(&self) -> Option<&dyn SnapshotCapable> {
        Some(self)
    }
}

impl TapVmm {
    async fn boot(
        &self,
        handle: &VmHandle,
        vm: &mut TapVm,
        cancel: &CancellationToken,
    ) -> AegisResult<StartedVm> {
        let layout = self.config.layout();

        self.net.create_tap(&vm.slot).await?;
        self.net.add_nat(&vm.slot).await?;

        // virtiofsd sidecar shares the workspace directory into the guest.
        if let Some(workspace) = &vm.request.workspace {
            let fs_socket = layout.virtiofsd_socket_path(&handle.0);
            let _ = std::fs::remove_file(&fs_socket);
            let args = vec![
                "--socket-path".to_string(),
                fs_socket.display().to_string(),
                "--shared-dir".to_string(),
                workspace.path.display().to_string(),
                "--cache".to_string(),
                "auto".to_string(),
            ];
            let log = layout.logs_dir().join(format!("{}.virtiofsd.log", handle.0));
            let child = spawn_logged(&self.config.virtiofsd_binary, &args, &log).await?;
            if let Some(pid) = child.id() {
                vm.sidecar_pids.push(pid);
            }
            vm.virtiofsd = Some(child);
        }

        let args = hypervisor_args(&self.config, vm, &layout);
        let log = layout.logs_dir().join(format!("{}.hv.log", handle.0));
        let child = spawn_logged(&self.config.hypervisor_binary, &args, &log).await?;
        let pid = child.id().unwrap_or_default();
        vm.hypervisor_pid = Some(pid);
        vm.hypervisor = Some(child);
        tracing::info!(vm = %handle, pid, tap = %vm.slot.tap_name(), "hypervisor spawned");

        let handshake = self.config.handshake_timeout;
        let channel = tokio::select! {
            channel = vm.endpoint.accept(handshake) => channel?,
            () = cancel.cancelled() => return Err(AegisError::Backend("start cancelled".into())),
        };
        channel.wait_ready(handshake).await?;

        Ok(StartedVm {
            channel,
            hypervisor_pid: pid,
            sidecar_pids: vm.sidecar_pids.clone(),
            endpoints: Self::endpoints_for(vm),
        })
    }

    fn api_socket(&self, handle: &VmHandle) -> AegisResult<PathBuf> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        if vm.hypervisor_pid.is_none() {
            return Err(AegisError::Conflict(format!("vm {handle} is not running")));
        }
        Ok(vm.api_socket.clone())
    }
}

#[async_trait]
impl SnapshotCapable for TapVmm {
    async fn snapshot_vm(&self, handle: &VmHandle) -> AegisResult<PathBuf> {
        let socket = self.api_socket(handle)?;
        let dir = self.config.layout().instance_snapshot_dir(&handle.0);
        std::fs::create_dir_all(&dir)
            .map_err(|e| AegisError::Io(format!("create {}: {e}", dir.display())))?;
        api_put_body(
            &socket,
            "/api/v1/vm.snapshot",
            &format!("{{\"destination_url\":\"file://{}\"}}", dir.display()),
        )
        .await?;
        Ok(dir)
    }

    async fn restore_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        let socket = self.api_socket(handle)?;
        let dir = self.config.layout().instance_snapshot_dir(&handle.0);
        api_put_body(
            &socket,
            "/api/v1/vm.restore",
            &format!("{{\"source_url\":\"file://{}\"}}", dir.display()),
        )
        .await
    }
}

fn hypervisor_args(config: &AegisConfig, vm: &TapVm, layout: &crate::config::Layout) -> Vec<String> {
    let mut args = vec![
        "--api-socket".to_string(),
        vm.api_socket.display().to_string(),
        "--kernel".to_string(),
        layout.kernel_path().display().to_string(),
        "--disk".to_string(),
        format!("path={}", vm.request.rootfs.path.display()),
        "--memory".to_string(),
        format!("size={}M", vm.request.memory_mb),
        "--cpus".to_string(),
        format!("boot={}", vm.request.vcpus),
        "--net".to_string(),
        format!(
            "tap={},ip={},mask=255.255.255.252",
            vm.slot.tap_name(),
            vm.slot.host_ip()
        ),
        "--vsock".to_string(),
        format!("cid=3,socket={}", vm.endpoint.path().display()),
    ];
    if vm.virtiofsd.is_some() {
        args.push("--fs".to_string());
        args.push(format!(
            "tag=workspace,socket={}",
            layout.virtiofsd_socket_path(&vm.request.instance_id).display()
        ));
    }
    args
}

/// PUT against the hypervisor's unix API socket.
async fn api_put(socket: &Path, path: &str) -> AegisResult<()> {
    api_put_body(socket, path, "").await
}

async fn api_put_body(socket: &Path, path: &str, body: &str) -> AegisResult<()> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        AegisError::Backend(format!("hypervisor api {}: {e}", socket.display()))
    })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| AegisError::Backend(format!("hypervisor api handshake: {e}")))?;
    // The connection task dies with the one-shot request.
    tokio::spawn(conn);

    let request = hyper::Request::builder()
        .method("PUT")
        .uri(format!("http://localhost{path}"))
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_owned())))
        .map_err(|e| AegisError::Backend(format!("hypervisor api request: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| AegisError::Backend(format!("hypervisor api {path}: {e}")))?;

    if !response.status().is_success() {
        return Err(AegisError::Backend(format!(
            "hypervisor api {path} returned {}",
            response.status()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::RootfsArtifact;
    use std::collections::BTreeMap;

    fn request(image: &Path) -> CreateVmRequest {
        CreateVmRequest {
            instance_id: "01hqtap".into(),
            command: vec!["true".into()],
            env: BTreeMap::new(),
            rootfs: RootfsArtifact {
                image_digest: "fixture".into(),
                path: image.to_path_buf(),
                format: RootfsFormat::BlockImage,
            },
            workspace: None,
            memory_mb: 256,
            vcpus: 1,
            expose_ports: BTreeMap::new(),
            subnet_slot: None,
        }
    }

    #[tokio::test]
    async fn create_allocates_slot_and_binds_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("rootfs.img");
        std::fs::write(&image, b"img").unwrap();

        let config = AegisConfig::defaults_for(dir.path().to_path_buf());
        config.layout().ensure().unwrap();
        let driver = TapVmm::new(
            config.clone(),
            Arc::new(SubnetAllocator::new(config.subnet_pool)),
            NetPlane::new(),
        );

        let handle = driver.create_vm(request(&image)).await.unwrap();
        assert!(config
            .layout()
            .control_socket_path(&handle.0)
            .exists());

        let ep = driver.dynamic_expose(&handle, 8080).await.unwrap();
        assert_eq!(ep.guest_port, 8080);
        assert!(ep.backend_addr.starts_with("tcp:10.177.0.2:"));

        // Snapshot capability is probed, not assumed.
        assert!(driver.as_snapshot().is_some());
    }

    #[tokio::test]
    async fn pause_before_start_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("rootfs.img");
        std::fs::write(&image, b"img").unwrap();
        let config = AegisConfig::defaults_for(dir.path().to_path_buf());
        config.layout().ensure().unwrap();
        let driver = TapVmm::new(
            config.clone(),
            Arc::new(SubnetAllocator::new(config.subnet_pool)),
            NetPlane::new(),
        );

        let handle = driver.create_vm(request(&image)).await.unwrap();
        assert!(matches!(
            driver.pause_vm(&handle).await,
            Err(AegisError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn api_put_round_trips_status() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("hv.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        // Stand-in hypervisor: 204 for vm.pause, 500 for anything else.
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = hyper::service::service_fn(
                        |req: hyper::Request<hyper::body::Incoming>| async move {
                            let status = if req.uri().path() == "/api/v1/vm.pause" {
                                hyper::StatusCode::NO_CONTENT
                            } else {
                                hyper::StatusCode::INTERNAL_SERVER_ERROR
                            };
                            hyper::Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::new()))
                        },
                    );
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        api_put(&socket, "/api/v1/vm.pause").await.unwrap();

        let err = api_put(&socket, "/api/v1/vm.bogus").await.unwrap_err();
        assert!(err.to_string().contains("500"), "{err}");
    }
}
