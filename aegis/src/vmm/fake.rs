//! In-process stand-in driver.
//!
//! Boots no hypervisor: the "guest" is a task on the host runtime speaking
//! the real control protocol over an in-memory pipe. The whole lifecycle
//! path — handshake, exec streaming, tether frames, pause bookkeeping —
//! runs against it in the test suite and in `aegisd` development mode,
//! with no kernel, rootfs or root privileges involved.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use aegis_shared::errors::{AegisError, AegisResult};
use aegis_shared::rpc::{self, notifications, Message, Notification, Response};

use crate::control::ControlChannel;
use crate::rootfs::RootfsFormat;
use crate::types::Endpoint;

use super::{
    CreateVmRequest, NetworkBackend, StartedVm, VmHandle, VmmCapabilities, VmmDriver,
};

struct FakeVm {
    request: CreateVmRequest,
    running: Arc<AtomicBool>,
    /// Loopback address of the in-process echo "guest", set while running.
    guest_addr: Option<SocketAddr>,
}

/// Driver whose guests are in-process tasks.
pub struct FakeVmm {
    persistent_pause: bool,
    /// Set to make every boot fail after "spawning" (rollback testing).
    pub fail_start: AtomicBool,
    vms: Mutex<HashMap<String, FakeVm>>,
    next_pid: AtomicU64,
}

impl FakeVmm {
    pub fn new() -> Self {
        Self {
            persistent_pause: true,
            fail_start: AtomicBool::new(false),
            vms: Mutex::new(HashMap::new()),
            next_pid: AtomicU64::new(40000),
        }
    }

    /// Variant whose capabilities mirror the tap backend (stop-after-idle
    /// applies).
    pub fn without_persistent_pause() -> Self {
        Self {
            persistent_pause: false,
            ..Self::new()
        }
    }
}

impl Default for FakeVmm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VmmDriver for FakeVmm {
    fn capabilities(&self) -> VmmCapabilities {
        VmmCapabilities {
            name: "fake",
            pause: true,
            persistent_pause: self.persistent_pause,
            rootfs_type: RootfsFormat::Directory,
            network_backend: NetworkBackend::Userspace,
        }
    }

    async fn create_vm(&self, request: CreateVmRequest) -> AegisResult<VmHandle> {
        let id = request.instance_id.clone();
        self.vms.lock().insert(
            id.clone(),
            FakeVm {
                request,
                running: Arc::new(AtomicBool::new(false)),
                guest_addr: None,
            },
        );
        Ok(VmHandle(id))
    }

    async fn start_vm(
        &self,
        handle: &VmHandle,
        _cancel: &CancellationToken,
    ) -> AegisResult<StartedVm> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(AegisError::Backend("simulated boot failure".into()));
        }

        let (running, command) = {
            let vms = self.vms.lock();
            let vm = vms
                .get(&handle.0)
                .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
            (Arc::clone(&vm.running), vm.request.command.clone())
        };

        // The "guest": one loopback echo listener standing in for whatever
        // the workload serves.
        let guest = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| AegisError::Backend(format!("bind fake guest: {e}")))?;
        let guest_addr = guest
            .local_addr()
            .map_err(|e| AegisError::Backend(format!("resolve fake guest addr: {e}")))?;

        let (host_io, guest_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (guest_read, guest_write) = tokio::io::split(guest_io);

        running.store(true, Ordering::SeqCst);
        tokio::spawn(fake_harness(guest_read, guest_write, command, running.clone()));
        tokio::spawn(echo_guest(guest, running.clone()));

        let channel = ControlChannel::from_io(host_read, host_write);
        channel
            .wait_ready(std::time::Duration::from_secs(5))
            .await?;

        let endpoints = {
            let mut vms = self.vms.lock();
            let vm = vms
                .get_mut(&handle.0)
                .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
            vm.guest_addr = Some(guest_addr);
            endpoints_of(vm)
        };

        Ok(StartedVm {
            channel,
            hypervisor_pid: self.next_pid.fetch_add(1, Ordering::SeqCst) as u32,
            sidecar_pids: Vec::new(),
            endpoints,
        })
    }

    async fn pause_vm(&self, _handle: &VmHandle) -> AegisResult<()> {
        Ok(())
    }

    async fn resume_vm(&self, _handle: &VmHandle) -> AegisResult<()> {
        Ok(())
    }

    async fn reconnect(&self, handle: &VmHandle) -> AegisResult<ControlChannel> {
        // A resumed fake guest re-dials instantly.
        self.start_vm(handle, &CancellationToken::new())
            .await
            .map(|started| started.channel)
    }

    async fn stop_vm(&self, handle: &VmHandle) -> AegisResult<()> {
        if let Some(vm) = self.vms.lock().get(&handle.0) {
            vm.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn host_endpoints(&self, handle: &VmHandle) -> AegisResult<Vec<Endpoint>> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        Ok(endpoints_of(vm))
    }

    async fn dynamic_expose(&self, handle: &VmHandle, guest_port: u16) -> AegisResult<Endpoint> {
        let vms = self.vms.lock();
        let vm = vms
            .get(&handle.0)
            .ok_or_else(|| AegisError::NotFound(format!("vm {handle} is not prepared")))?;
        Ok(Endpoint {
            guest_port,
            public_port: 0,
            protocol: Default::default(),
            backend_addr: backend_addr_of(vm),
        })
    }
}

fn backend_addr_of(vm: &FakeVm) -> String {
    match vm.guest_addr {
        Some(addr) => format!("tcp:{addr}"),
        None => "tcp:127.0.0.1:9".to_string(),
    }
}

fn endpoints_of(vm: &FakeVm) -> Vec<Endpoint> {
    let backend_addr = backend_addr_of(vm);
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

/// Accept loop of the stand-in guest: echoes every connection until the VM
/// stops.
async fn echo_guest(listener: TcpListener, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = tokio::time::sleep(std::time::Duration::from_millis(200)) => continue,
        };
        let Ok((mut stream, _)) = accepted else { return };
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while running.load(Ordering::SeqCst) {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// The in-process guest: announces ready, answers control calls, streams a
/// canned exec transcript.
async fn fake_harness(
    read: ReadHalf<DuplexStream>,
    mut write: WriteHalf<DuplexStream>,
    command: Vec<String>,
    running: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read);

    let ready = Notification::new(notifications::READY, json!({"pid": 1, "command": command}));
    if write_line(&mut write, &ready).await.is_err() {
        return;
    }

    // Ephemeral workloads: an `echo`-style main command prints its args and
    // exits, driving the clean running → stopped path in the manager. The
    // short delay models process startup and lets the host finish wiring
    // its notification subscribers.
    if command.first().map(String::as_str) == Some("echo") {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let data = format!("{}\n", command[1..].join(" "));
        let out = Notification::new(
            notifications::EXEC_OUTPUT,
            json!({"exec_id": "main", "stream": "stdout", "data": data}),
        );
        if write_line(&mut write, &out).await.is_err() {
            return;
        }
        let exit = Notification::new(
            notifications::EXEC_EXIT,
            json!({"exec_id": "main", "exit_code": 0}),
        );
        if write_line(&mut write, &exit).await.is_err() {
            return;
        }
    }

    let mut next_exec = 1u64;
    while running.load(Ordering::SeqCst) {
        let message = match rpc::read_message(&mut reader).await {
            Ok(Some(message)) => message,
            _ => return,
        };
        let Message::Request(request) = message else {
            continue;
        };

        match request.method.as_str() {
            "exec.start" => {
                let exec_id = format!("exec-{next_exec}");
                next_exec += 1;
                let argv: Vec<String> = request
                    .params
                    .get("argv")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();

                let ack = Response::result(request.id, json!({"exec_id": exec_id}));
                if write_line(&mut write, &ack).await.is_err() {
                    return;
                }

                // Echo-style transcript: one stdout line per argv word.
                for word in &argv {
                    let out = Notification::new(
                        notifications::EXEC_OUTPUT,
                        json!({"exec_id": exec_id, "stream": "stdout", "data": format!("{word}\n")}),
                    );
                    if write_line(&mut write, &out).await.is_err() {
                        return;
                    }
                }
                let exit = Notification::new(
                    notifications::EXEC_EXIT,
                    json!({"exec_id": exec_id, "exit_code": 0}),
                );
                if write_line(&mut write, &exit).await.is_err() {
                    return;
                }
            }
            "shutdown" => {
                let ack = Response::result(request.id, json!({"ok": true}));
                let _ = write_line(&mut write, &ack).await;
                return;
            }
            "guest.list_children" => {
                let ack = Response::result(request.id, json!({"children": []}));
                if write_line(&mut write, &ack).await.is_err() {
                    return;
                }
            }
            other => {
                let ack = Response::error(request.id, -32601, format!("unknown method {other}"));
                if write_line(&mut write, &ack).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_line(
    write: &mut (impl tokio::io::AsyncWrite + Unpin),
    msg: &impl serde::Serialize,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    write.write_all(&line).await?;
    write.flush().await
}
