//! Instance lifecycle manager.
//!
//! Owns every mutable instance state; the registry holds the durable
//! shadow. Operations on one instance serialize on that instance's op lock
//! (held for the whole operation — that is the contract), while different
//! instances proceed fully in parallel. State transitions are validated
//! against the pure table in [`state`] before anything is touched, and a
//! rejected transition has no side effects.

pub mod idle;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aegis_shared::errors::{AegisError, AegisResult};
use aegis_shared::rpc::{methods, notifications, Notification};
use aegis_shared::tether::{Direction, TetherFrame};

use crate::config::AegisConfig;
use crate::control::ControlChannel;
use crate::db::{Database, InstanceStore, TetherFrameStore};
use crate::kits::KitCatalog;
use crate::logs::LogHub;
use crate::net::NetPlane;
use crate::ports::{ExposeTable, ExposedPort};
use crate::rootfs::RootfsProvider;
use crate::router::{dial_backend, BackendConn, ConnGuard, Router, RouterBackend};
use crate::secrets::SecretVault;
use crate::tether::{PersistFn, TetherBus, TetherQuery};
use crate::types::{
    InstanceId, InstanceRecord, InstanceSpec, InstanceState, Lease, PortBinding, PortProtocol,
    WorkspaceRef,
};
use crate::vmm::subnet::SubnetAllocator;
use crate::vmm::{CreateVmRequest, NetworkBackend, VmHandle, VmmDriver};

use idle::ActivityTracker;
use state::Op;

/// Exec id the harness uses for the instance's main command.
const MAIN_EXEC_ID: &str = "main";

struct LiveVm {
    handle: VmHandle,
    channel: Arc<ControlChannel>,
    monitor: JoinHandle<()>,
    watchdog: Option<JoinHandle<()>>,
}

impl Drop for LiveVm {
    fn drop(&mut self) {
        self.monitor.abort();
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }
}

/// Per-instance runtime state that never touches the registry.
struct Entry {
    op_lock: tokio::sync::Mutex<()>,
    activity: Arc<ActivityTracker>,
    live: Mutex<Option<LiveVm>>,
    watchdog_gen: AtomicU64,
}

impl Entry {
    fn new() -> Self {
        Self {
            op_lock: tokio::sync::Mutex::new(()),
            activity: Arc::new(ActivityTracker::new()),
            live: Mutex::new(None),
            watchdog_gen: AtomicU64::new(0),
        }
    }
}

/// Daemon-level status summary for `GET /v1/status`.
#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub version: String,
    pub backend: String,
    pub instances: usize,
    pub by_state: std::collections::BTreeMap<String, usize>,
    pub host_memory_total_kb: u64,
    pub host_memory_available_kb: u64,
}

/// The lifecycle engine.
pub struct InstanceManager {
    config: AegisConfig,
    store: InstanceStore,
    tether_store: TetherFrameStore,
    tether: TetherBus,
    vault: SecretVault,
    logs: LogHub,
    kits: KitCatalog,
    driver: Arc<dyn VmmDriver>,
    rootfs: Arc<dyn RootfsProvider>,
    subnets: Arc<SubnetAllocator>,
    net: NetPlane,
    expose: ExposeTable,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    shutdown: CancellationToken,
}

impl InstanceManager {
    /// Wire the manager and register it as the router backend.
    pub fn new(
        config: AegisConfig,
        db: Database,
        driver: Arc<dyn VmmDriver>,
        rootfs: Arc<dyn RootfsProvider>,
        subnets: Arc<SubnetAllocator>,
        net: NetPlane,
        router: Router,
    ) -> AegisResult<Arc<Self>> {
        let layout = config.layout();
        layout.ensure().map_err(|e| {
            AegisError::Fatal(format!("create {}: {e}", layout.home_dir().display()))
        })?;

        let store = InstanceStore::new(db.clone());
        let tether_store = TetherFrameStore::new(db.clone());
        let persist: PersistFn = {
            let frames = tether_store.clone();
            Arc::new(move |instance_id, seq, frame_json| {
                frames.upsert_frame(instance_id, seq, frame_json)
            })
        };
        let vault = SecretVault::open(&layout.master_key_path(), crate::db::SecretStore::new(db))?;
        let kits = KitCatalog::load(&layout.kits_path())?;

        let manager = Arc::new(Self {
            tether: TetherBus::new(config.tether_ring_capacity, persist),
            store,
            tether_store,
            vault,
            logs: LogHub::new(layout),
            kits,
            driver,
            rootfs,
            subnets,
            net,
            expose: ExposeTable::new(router.clone()),
            entries: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            config,
        });

        router.bind_backend(Arc::new(ManagerRouterBackend(Arc::downgrade(&manager))));
        Ok(manager)
    }

    pub fn config(&self) -> &AegisConfig {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn kits(&self) -> &KitCatalog {
        &self.kits
    }

    pub fn logs(&self) -> &LogHub {
        &self.logs
    }

    // ========================================================================
    // Create / read
    // ========================================================================

    /// Validate a spec, allocate identity and network resources, persist the
    /// row in `stopped`, pre-create the log subscription.
    pub async fn create(self: &Arc<Self>, spec: InstanceSpec) -> AegisResult<InstanceRecord> {
        let (image_ref, command) = self.resolve_kit(&spec)?;
        if command.is_empty() {
            return Err(AegisError::Validation(
                "spec needs a command (directly or via kit)".into(),
            ));
        }
        if spec.memory_mb == Some(0) || spec.vcpus == Some(0) {
            return Err(AegisError::Validation(
                "memory_mb and vcpus must be positive".into(),
            ));
        }
        for (guest_port, _) in spec.expose_ports.iter() {
            if *guest_port == 0 {
                return Err(AegisError::Validation("guest port 0 is not exposable".into()));
            }
        }

        let id = InstanceId::new();
        let now = Utc::now();

        // Tap networking reserves its /30 at create time so exhaustion is a
        // create-time error, not a surprise at first boot.
        let subnet_slot =
            if self.driver.capabilities().network_backend == NetworkBackend::Tap {
                Some(self.subnets.allocate()?.index)
            } else {
                None
            };

        let workspace = match &spec.workspace {
            Some(path) => Some(WorkspaceRef {
                path: path.clone(),
                system_owned: false,
            }),
            None => {
                let path = self.config.layout().instance_workspace_dir(id.as_str());
                std::fs::create_dir_all(&path)
                    .map_err(|e| AegisError::Io(format!("create {}: {e}", path.display())))?;
                Some(WorkspaceRef {
                    path,
                    system_owned: true,
                })
            }
        };

        let record = InstanceRecord {
            id: id.clone(),
            handle: spec.handle.clone(),
            state: InstanceState::Stopped,
            enabled: spec.enabled,
            command,
            image_ref,
            kit: spec.kit.clone(),
            workspace,
            env: spec.env.clone(),
            secret_refs: spec.secret_refs.clone(),
            memory_mb: spec.memory_mb.unwrap_or(self.config.default_memory_mb),
            vcpus: spec.vcpus.unwrap_or(self.config.default_vcpus),
            expose_ports: spec.expose_ports.clone(),
            endpoints: Vec::new(),
            vm_handle: None,
            hypervisor_pid: None,
            sidecar_pids: Vec::new(),
            subnet_slot,
            created_at: now,
            updated_at: now,
            stopped_at: Some(now),
            last_active_at: None,
            lease: None,
        };

        self.store.insert(&record)?;
        self.entry(id.as_str());
        self.tether.ring(id.as_str());
        self.logs.ensure(id.as_str())?;
        self.logs
            .event(id.as_str(), "created", json!({"handle": record.handle}));
        tracing::info!(instance = %id, handle = ?record.handle, "instance created");
        Ok(record)
    }

    pub fn get(&self, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        self.store
            .resolve(id_or_handle)?
            .ok_or_else(|| AegisError::NotFound(format!("instance \"{id_or_handle}\"")))
    }

    pub fn list(&self, state: Option<InstanceState>) -> AegisResult<Vec<InstanceRecord>> {
        self.store.list(state)
    }

    fn resolve_kit(&self, spec: &InstanceSpec) -> AegisResult<(String, Vec<String>)> {
        if let Some(kit_name) = &spec.kit {
            let kit = self.kits.resolve(kit_name)?;
            let image = spec.image.clone().unwrap_or_else(|| kit.image.clone());
            let command = if spec.command.is_empty() {
                kit.command.clone()
            } else {
                spec.command.clone()
            };
            return Ok((image, command));
        }
        let image = spec
            .image
            .clone()
            .ok_or_else(|| AegisError::Validation("spec needs an image or a kit".into()))?;
        Ok((image, spec.command.clone()))
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// stopped|disabled|failed → starting → running. Rolls back every
    /// allocation in reverse order on failure and lands in `failed`.
    pub async fn start(self: &Arc<Self>, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let mut record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;

        // Re-read under the lock: a concurrent op may have moved the state.
        record = self.get(record.id.as_str())?;
        let next = state::next(record.state, record.enabled, Op::Start)?;
        record.state = next.state;
        record.enabled = next.enabled;
        record.touch();
        self.store.save(&record)?;
        self.logs.event(record.id.as_str(), "starting", json!({}));

        // End-to-end deadline as a token rather than a dropped future: the
        // drivers observe it at their own await points and roll their state
        // back cleanly instead of being cancelled mid-spawn.
        let deadline = self.shutdown.child_token();
        let timer = {
            let deadline = deadline.clone();
            let budget = self.config.start_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                deadline.cancel();
            })
        };
        let result = self.boot(&mut record, &entry, &deadline).await;
        timer.abort();
        let result = match result {
            Err(e) if deadline.is_cancelled() && !self.shutdown.is_cancelled() => {
                Err(AegisError::Backend(format!(
                    "start did not complete within {}s: {e}",
                    self.config.start_timeout.as_secs()
                )))
            }
            other => other,
        };

        match result {
            Ok(()) => {
                let next = state::next(record.state, record.enabled, Op::StartOk)?;
                record.state = next.state;
                record.last_active_at = Some(Utc::now());
                record.stopped_at = None;
                record.touch();
                self.store.save(&record)?;
                self.logs.event(
                    record.id.as_str(),
                    "started",
                    json!({"pid": record.hypervisor_pid}),
                );
                self.arm_watchdog(&entry, record.id.as_str());
                tracing::info!(instance = %record.id, pid = ?record.hypervisor_pid, "instance running");
                Ok(record)
            }
            Err(e) => {
                // Rollback whatever the boot path left behind.
                if let Some(handle) = record.vm_handle.clone() {
                    let _ = self.driver.stop_vm(&VmHandle(handle)).await;
                }
                *entry.live.lock() = None;
                let next = state::next(record.state, record.enabled, Op::StartFail)
                    .unwrap_or(state::Next {
                        state: InstanceState::Failed,
                        enabled: record.enabled,
                    });
                record.state = next.state;
                record.clear_transient();
                record.touch();
                self.store.save(&record)?;
                self.logs
                    .event(record.id.as_str(), "failed", json!({"error": e.to_string()}));
                tracing::warn!(instance = %record.id, error = %e, "start failed");
                Err(e)
            }
        }
    }

    /// The allocation-ordered boot path; mutates `record` as facts appear so
    /// the caller can roll back precisely.
    async fn boot(
        self: &Arc<Self>,
        record: &mut InstanceRecord,
        entry: &Arc<Entry>,
        deadline: &CancellationToken,
    ) -> AegisResult<()> {
        let caps = self.driver.capabilities();

        let mut env = record.env.clone();
        env.extend(self.vault.inject(&record.secret_refs)?);
        for name in crate::config::envs::FORWARDED {
            if let Ok(value) = std::env::var(name) {
                env.entry(name.to_string()).or_insert(value);
            }
        }

        let rootfs = tokio::select! {
            rootfs = self.rootfs.materialize(&record.image_ref, caps.rootfs_type) => rootfs?,
            () = deadline.cancelled() => {
                return Err(AegisError::Backend("rootfs materialization timed out".into()));
            }
        };

        let request = CreateVmRequest {
            instance_id: record.id.as_str().to_string(),
            command: record.command.clone(),
            env,
            rootfs,
            workspace: record.workspace.clone(),
            memory_mb: record.memory_mb,
            vcpus: record.vcpus,
            expose_ports: record.expose_ports.clone(),
            subnet_slot: record.subnet_slot,
        };

        let handle = self.driver.create_vm(request).await?;
        record.vm_handle = Some(handle.0.clone());

        let started = self.driver.start_vm(&handle, deadline).await?;
        record.hypervisor_pid = Some(started.hypervisor_pid);
        record.sidecar_pids = started.sidecar_pids.clone();
        record.endpoints = started.endpoints.clone();

        // Bind the public side of every exposed port and resolve the final
        // public port numbers into the record.
        let mut resolved = Vec::new();
        for (guest_port, binding) in record.expose_ports.clone() {
            let bound = self
                .expose
                .expose(record.id.as_str(), guest_port, binding)
                .await?;
            resolved.push(bound);
        }
        for bound in resolved {
            if let Some(binding) = record.expose_ports.get_mut(&bound.guest_port) {
                binding.public_port = bound.public_port;
            }
            for endpoint in &mut record.endpoints {
                if endpoint.guest_port == bound.guest_port {
                    endpoint.public_port = bound.public_port;
                }
            }
        }

        let channel = Arc::new(started.channel);
        let monitor = self.spawn_monitor(record.id.as_str(), Arc::clone(&channel), entry);
        *entry.live.lock() = Some(LiveVm {
            handle,
            channel,
            monitor,
            watchdog: None,
        });
        Ok(())
    }

    // ========================================================================
    // Stop / disable / destroy / prune
    // ========================================================================

    /// Graceful stop; idempotent.
    pub async fn stop(&self, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;
        self.stop_locked(record.id.as_str(), &entry, Op::Stop).await
    }

    /// Stop plus `enabled = false`: no auto-wake, no autostart.
    pub async fn disable(&self, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;
        let stopped = self.stop_locked(record.id.as_str(), &entry, Op::Disable).await?;
        // Disabled instances keep no public listeners.
        self.expose.unexpose_all(stopped.id.as_str()).await;
        Ok(stopped)
    }

    /// The shared teardown path. Caller holds the op lock.
    async fn stop_locked(
        &self,
        id: &str,
        entry: &Arc<Entry>,
        op: Op,
    ) -> AegisResult<InstanceRecord> {
        let mut record = self.get(id)?;
        let next = state::next(record.state, record.enabled, op)?;

        let live = entry.live.lock().take();
        if let Some(live) = &live {
            // Give the guest a chance to sync before the hypervisor dies.
            let _ = tokio::time::timeout(
                Duration::from_secs(3),
                live.channel.call(methods::SHUTDOWN, json!({})),
            )
            .await;
        }
        // The live handle is authoritative; the persisted copy covers VMs
        // recovered from a previous daemon life.
        let handle = live
            .as_ref()
            .map(|l| l.handle.clone())
            .or_else(|| record.vm_handle.clone().map(VmHandle));
        if let Some(handle) = handle {
            self.driver.stop_vm(&handle).await?;
        }
        drop(live);
        entry.watchdog_gen.fetch_add(1, Ordering::SeqCst);

        let was_live = record.state.has_vm();
        record.state = next.state;
        record.enabled = next.enabled;
        record.clear_transient();
        record.lease = None;
        entry.activity.clear_lease();
        if was_live || record.stopped_at.is_none() {
            record.stopped_at = Some(Utc::now());
        }
        record.touch();
        self.store.save(&record)?;
        if was_live {
            self.logs.event(id, "stopped", json!({"state": record.state}));
            tracing::info!(instance = %record.id, state = %record.state, "instance stopped");
        }
        Ok(record)
    }

    /// Delete the instance entirely: row, tether frames, logs, system-owned
    /// workspace.
    pub async fn destroy(&self, id_or_handle: &str) -> AegisResult<()> {
        let record = self.get(id_or_handle)?;
        let id = record.id.as_str().to_string();
        let entry = self.entry(&id);
        let _op = entry.op_lock.lock().await;

        self.stop_locked(&id, &entry, Op::Stop).await?;
        self.expose.unexpose_all(&id).await;

        let record = self.get(&id)?;
        self.store.delete(&id)?;
        self.tether.remove(&id);
        self.logs.remove(&id);
        if let Some(workspace) = &record.workspace {
            if workspace.system_owned {
                let _ = std::fs::remove_dir_all(&workspace.path);
            }
        }
        let _ = std::fs::remove_dir_all(self.config.layout().instance_overlay_dir(&id));
        self.entries.lock().remove(&id);
        tracing::info!(instance = %id, "instance destroyed");
        Ok(())
    }

    /// Destroy every stopped instance whose stop time precedes the cutoff.
    pub async fn prune(&self, older_than: Duration) -> AegisResult<Vec<InstanceId>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| AegisError::Validation(format!("bad prune duration: {e}")))?;
        let candidates = self.store.list_stopped_before(cutoff)?;
        let mut pruned = Vec::new();
        for record in candidates {
            match self.destroy(record.id.as_str()).await {
                Ok(()) => pruned.push(record.id),
                Err(e) => {
                    tracing::warn!(instance = %record.id, error = %e, "prune skipped instance")
                }
            }
        }
        Ok(pruned)
    }

    // ========================================================================
    // Pause / resume / wake
    // ========================================================================

    pub async fn pause(&self, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;
        self.pause_locked(record.id.as_str(), &entry, Op::Pause).await
    }

    async fn pause_locked(
        &self,
        id: &str,
        entry: &Arc<Entry>,
        op: Op,
    ) -> AegisResult<InstanceRecord> {
        let mut record = self.get(id)?;
        if record.state == InstanceState::Paused {
            return Ok(record);
        }
        let next = state::next(record.state, record.enabled, op)?;
        if next.state == record.state {
            return Ok(record);
        }

        let handle = record
            .vm_handle
            .clone()
            .ok_or_else(|| AegisError::Conflict(format!("instance {id} has no vm")))?;
        self.driver.pause_vm(&VmHandle(handle)).await?;

        record.state = next.state;
        record.touch();
        self.store.save(&record)?;
        self.logs.event(id, "paused", json!({}));
        entry.activity.touch();
        tracing::info!(instance = %record.id, "instance paused");
        Ok(record)
    }

    pub async fn resume(self: &Arc<Self>, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;
        self.resume_locked(record.id.as_str(), &entry).await
    }

    async fn resume_locked(
        self: &Arc<Self>,
        id: &str,
        entry: &Arc<Entry>,
    ) -> AegisResult<InstanceRecord> {
        let mut record = self.get(id)?;
        if record.state == InstanceState::Running {
            entry.activity.touch();
            return Ok(record);
        }
        let next = state::next(record.state, record.enabled, Op::Resume)?;

        let handle = record
            .vm_handle
            .clone()
            .ok_or_else(|| AegisError::Conflict(format!("instance {id} has no vm")))?;
        let handle = VmHandle(handle);
        self.driver.resume_vm(&handle).await?;

        // A transport reset across pause is expected; a clean reconnect
        // during resume is success, not failure.
        let needs_reconnect = {
            let live = entry.live.lock();
            match live.as_ref() {
                Some(live) => live.channel.is_closed(),
                None => true,
            }
        };
        if needs_reconnect {
            let channel = Arc::new(self.driver.reconnect(&handle).await?);
            channel
                .wait_ready(self.config.handshake_timeout)
                .await?;
            let monitor = self.spawn_monitor(id, Arc::clone(&channel), entry);
            *entry.live.lock() = Some(LiveVm {
                handle: handle.clone(),
                channel,
                monitor,
                watchdog: None,
            });
        }

        record.state = next.state;
        record.last_active_at = Some(Utc::now());
        record.touch();
        self.store.save(&record)?;
        self.logs.event(id, "resumed", json!({}));
        entry.activity.touch();
        self.arm_watchdog(entry, id);
        tracing::info!(instance = %record.id, "instance resumed");
        Ok(record)
    }

    /// Wake-on-connect path: resume a paused instance, start an enabled
    /// stopped one, reject the rest.
    pub async fn wake(self: &Arc<Self>, id_or_handle: &str) -> AegisResult<InstanceRecord> {
        let record = self.get(id_or_handle)?;
        match record.state {
            InstanceState::Running => Ok(record),
            InstanceState::Paused => self.resume(record.id.as_str()).await,
            InstanceState::Stopped if record.enabled => self.start(record.id.as_str()).await,
            state => Err(AegisError::Conflict(format!(
                "instance {} cannot be woken from {state}",
                record.id
            ))),
        }
    }

    // ========================================================================
    // Expose
    // ========================================================================

    /// Register (idempotently) a guest-port mapping and bind its public
    /// listener. Listeners survive idle stops so wake-on-connect works; they
    /// close on disable and destroy.
    pub async fn expose(
        &self,
        id_or_handle: &str,
        guest_port: u16,
        public_port: Option<u16>,
        protocol: Option<PortProtocol>,
    ) -> AegisResult<ExposedPort> {
        if guest_port == 0 {
            return Err(AegisError::Validation("guest port 0 is not exposable".into()));
        }
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;

        let mut record = self.get(record.id.as_str())?;
        let requested = PortBinding {
            public_port: public_port.unwrap_or(0),
            protocol: protocol.unwrap_or_default(),
        };

        let bound = self
            .expose
            .expose(record.id.as_str(), guest_port, requested)
            .await?;

        let changed = record.expose_ports.get(&guest_port) != Some(&PortBinding {
            public_port: bound.public_port,
            protocol: bound.protocol,
        });
        record.expose_ports.insert(
            guest_port,
            PortBinding {
                public_port: bound.public_port,
                protocol: bound.protocol,
            },
        );
        if record.state.has_endpoints() {
            if let Some(live_handle) = record.vm_handle.clone() {
                let endpoint = self
                    .driver
                    .dynamic_expose(&VmHandle(live_handle), guest_port)
                    .await?;
                if !record
                    .endpoints
                    .iter()
                    .any(|e| e.guest_port == guest_port)
                {
                    record.endpoints.push(crate::types::Endpoint {
                        guest_port,
                        public_port: bound.public_port,
                        protocol: bound.protocol,
                        backend_addr: endpoint.backend_addr,
                    });
                }
            }
        }
        if changed {
            record.touch();
            self.store.save(&record)?;
            self.logs.event(
                record.id.as_str(),
                "exposed",
                json!({"guest_port": guest_port, "public_port": bound.public_port}),
            );
        }
        Ok(bound)
    }

    /// Remove a mapping; absent mappings are a no-op.
    pub async fn unexpose(&self, id_or_handle: &str, guest_port: u16) -> AegisResult<()> {
        let record = self.get(id_or_handle)?;
        let entry = self.entry(record.id.as_str());
        let _op = entry.op_lock.lock().await;

        let mut record = self.get(record.id.as_str())?;
        self.expose.unexpose(record.id.as_str(), guest_port).await;
        if record.expose_ports.remove(&guest_port).is_some() {
            record.endpoints.retain(|e| e.guest_port != guest_port);
            record.touch();
            self.store.save(&record)?;
            self.logs.event(
                record.id.as_str(),
                "unexposed",
                json!({"guest_port": guest_port}),
            );
        }
        Ok(())
    }

    // ========================================================================
    // Exec
    // ========================================================================

    /// Run a command in the guest, streaming interleaved output frames. The
    /// returned channel yields `{stream, data}` objects and ends with
    /// `{done: true, exit_code}` (or a final `{error}` object).
    pub async fn exec(
        self: &Arc<Self>,
        id_or_handle: &str,
        argv: Vec<String>,
        auto_wake: bool,
    ) -> AegisResult<mpsc::Receiver<Value>> {
        if argv.is_empty() {
            return Err(AegisError::Validation("exec needs a non-empty argv".into()));
        }
        let mut record = self.get(id_or_handle)?;
        if record.state == InstanceState::Paused && auto_wake {
            record = self.wake(record.id.as_str()).await?;
        }
        if record.state != InstanceState::Running {
            return Err(AegisError::Conflict(format!(
                "not_running: instance {} is {}",
                record.id, record.state
            )));
        }

        let entry = self.entry(record.id.as_str());
        let channel = {
            let live = entry.live.lock();
            live.as_ref()
                .map(|l| Arc::clone(&l.channel))
                .ok_or_else(|| {
                    AegisError::Conflict(format!("not_running: instance {} has no channel", record.id))
                })?
        };

        // Subscribe before issuing the call so no output frame can slip by.
        let mut sub = channel.subscribe();
        let result = channel
            .call(methods::EXEC_START, json!({"argv": argv}))
            .await?;
        let exec_id = result
            .get("exec_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AegisError::Backend("guest exec ack carried no exec_id".into()))?
            .to_string();

        let (tx, rx) = mpsc::channel::<Value>(64);
        let activity = Arc::clone(&entry.activity);
        tokio::spawn(async move {
            loop {
                let note = match sub.recv().await {
                    Ok(note) => note,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(json!({"error": "control channel closed"})).await;
                        return;
                    }
                };
                let params = &note.params;
                if params.get("exec_id").and_then(|v| v.as_str()) != Some(exec_id.as_str()) {
                    continue;
                }
                match note.method.as_str() {
                    notifications::EXEC_OUTPUT => {
                        activity.touch();
                        let frame = json!({
                            "stream": params.get("stream").cloned().unwrap_or(json!("stdout")),
                            "data": params.get("data").cloned().unwrap_or(json!("")),
                        });
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    notifications::EXEC_EXIT => {
                        let exit = json!({
                            "done": true,
                            "exit_code": params.get("exit_code").cloned().unwrap_or(json!(-1)),
                        });
                        let _ = tx.send(exit).await;
                        return;
                    }
                    _ => {}
                }
            }
        });
        Ok(rx)
    }

    /// Send a signal to the guest's main command (or a named child).
    pub async fn signal(
        &self,
        id_or_handle: &str,
        signal: i32,
        child: Option<String>,
    ) -> AegisResult<()> {
        let channel = self.live_channel(id_or_handle)?;
        channel
            .call(
                methods::SIGNAL_SEND,
                json!({"signal": signal, "child": child}),
            )
            .await?;
        Ok(())
    }

    /// Processes the harness supervises inside the guest.
    pub async fn list_children(&self, id_or_handle: &str) -> AegisResult<Value> {
        let channel = self.live_channel(id_or_handle)?;
        channel.call(methods::GUEST_LIST_CHILDREN, json!({})).await
    }

    /// Read a file from the guest workspace through the harness.
    pub async fn workspace_read(&self, id_or_handle: &str, path: &str) -> AegisResult<Value> {
        let channel = self.live_channel(id_or_handle)?;
        channel
            .call(methods::WORKSPACE_READ, json!({"path": path}))
            .await
    }

    /// Write a file into the guest workspace through the harness.
    pub async fn workspace_write(
        &self,
        id_or_handle: &str,
        path: &str,
        contents: &str,
    ) -> AegisResult<()> {
        let channel = self.live_channel(id_or_handle)?;
        channel
            .call(
                methods::WORKSPACE_WRITE,
                json!({"path": path, "contents": contents}),
            )
            .await?;
        Ok(())
    }

    fn live_channel(&self, id_or_handle: &str) -> AegisResult<Arc<ControlChannel>> {
        let record = self.get(id_or_handle)?;
        if record.state != InstanceState::Running {
            return Err(AegisError::Conflict(format!(
                "not_running: instance {} is {}",
                record.id, record.state
            )));
        }
        let entry = self.entry(record.id.as_str());
        let live = entry.live.lock();
        live.as_ref()
            .map(|l| Arc::clone(&l.channel))
            .ok_or_else(|| {
                AegisError::Conflict(format!(
                    "not_running: instance {} has no channel",
                    record.id
                ))
            })
    }

    // ========================================================================
    // Tether
    // ========================================================================

    /// Accept a frame from either side: assign seq, persist, forward
    /// ingress frames to the guest if it is live.
    pub async fn tether_send(&self, id_or_handle: &str, frame: TetherFrame) -> AegisResult<u64> {
        let record = self.get(id_or_handle)?;
        let id = record.id.as_str();
        let ring = self.tether.ring(id);
        let seq = ring.append(frame.clone())?;

        let entry = self.entry(id);
        entry.activity.touch();

        if frame.direction() == Some(Direction::Ingress) {
            let channel = {
                let live = entry.live.lock();
                live.as_ref().map(|l| Arc::clone(&l.channel))
            };
            if let Some(channel) = channel {
                let mut framed = frame;
                framed.seq = Some(seq);
                let _ = channel
                    .notify(notifications::TETHER_FRAME, serde_json::to_value(&framed)?)
                    .await;
            }
        }
        Ok(seq)
    }

    /// Query, optionally long-polling until a frame matches or the deadline
    /// passes.
    pub async fn tether_poll(
        &self,
        id_or_handle: &str,
        query: TetherQuery,
        wait: Option<Duration>,
    ) -> AegisResult<Vec<TetherFrame>> {
        let record = self.get(id_or_handle)?;
        let ring = self.tether.ring(record.id.as_str());
        match wait {
            Some(timeout) => Ok(ring.wait_for_frames(&query, timeout).await),
            None => Ok(ring.query(&query)),
        }
    }

    // ========================================================================
    // Recovery & shutdown
    // ========================================================================

    /// Cold-boot: sweep kernel leftovers, settle registry rows, restore
    /// tether tails, auto-start what was live and is enabled.
    pub async fn recover(self: &Arc<Self>) -> AegisResult<()> {
        let swept = self.net.sweep_orphans().await?;
        if !swept.is_empty() {
            tracing::info!(taps = ?swept, "swept orphaned tap devices");
        }

        let mut to_start = Vec::new();
        for mut record in self.store.list(None)? {
            let id = record.id.as_str().to_string();
            self.entry(&id);
            self.logs.ensure(&id)?;

            if let Some(slot) = record.subnet_slot {
                self.subnets.advance_past(slot);
            }

            // Restore the persisted tether tail.
            let frames = self.tether_store.load(&id)?;
            if !frames.is_empty() {
                let decoded: Vec<TetherFrame> = frames
                    .iter()
                    .filter_map(|(_, json)| serde_json::from_str(json).ok())
                    .collect();
                self.tether.ring(&id).load(decoded);
            }

            // Nothing is truly running after a daemon restart.
            let was = record.state;
            let auto_start = record.enabled
                && matches!(
                    was,
                    InstanceState::Running | InstanceState::Paused | InstanceState::Starting
                );
            match was {
                InstanceState::Running | InstanceState::Paused | InstanceState::Starting => {
                    record.state = InstanceState::Stopped;
                    record.clear_transient();
                    record.touch();
                    self.store.save(&record)?;
                    self.logs
                        .event(&id, "recovered", json!({"previous_state": was}));
                }
                InstanceState::Creating => {
                    record.state = InstanceState::Stopped;
                    record.touch();
                    self.store.save(&record)?;
                }
                _ => {}
            }
            if auto_start {
                to_start.push(id);
            }
        }

        for id in to_start {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.start(&id).await {
                    tracing::warn!(instance = %id, error = %e, "auto-start after recovery failed");
                }
            });
        }
        Ok(())
    }

    /// Stop everything and cancel background tasks. Bounded by per-instance
    /// stop grace; used on daemon shutdown.
    pub async fn shutdown(&self) -> AegisResult<()> {
        self.shutdown.cancel();
        for record in self.store.list(None)? {
            if record.state.has_vm() {
                if let Err(e) = self.stop(record.id.as_str()).await {
                    tracing::warn!(instance = %record.id, error = %e, "stop during shutdown failed");
                }
            }
        }
        Ok(())
    }

    pub fn status(&self) -> AegisResult<StatusReport> {
        let records = self.store.list(None)?;
        let mut by_state = std::collections::BTreeMap::new();
        for record in &records {
            *by_state.entry(record.state.to_string()).or_insert(0) += 1;
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: self.driver.capabilities().name.to_string(),
            instances: records.len(),
            by_state,
            host_memory_total_kb: sys.total_memory() / 1024,
            host_memory_available_kb: sys.available_memory() / 1024,
        })
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn entry(&self, id: &str) -> Arc<Entry> {
        let mut entries = self.entries.lock();
        entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    /// Pump guest notifications into the tether ring, logs, leases and the
    /// lifecycle machine; watch for transport drops.
    fn spawn_monitor(
        self: &Arc<Self>,
        id: &str,
        channel: Arc<ControlChannel>,
        entry: &Arc<Entry>,
    ) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let id = id.to_string();
        let activity = Arc::clone(&entry.activity);
        let mut sub = channel.subscribe();

        tokio::spawn(async move {
            loop {
                let note = tokio::select! {
                    note = sub.recv() => note,
                    () = channel.wait_closed() => {
                        if let Some(manager) = manager.upgrade() {
                            manager.on_transport_closed(&id).await;
                        }
                        return;
                    }
                };
                let note = match note {
                    Ok(note) => note,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Some(manager) = manager.upgrade() else { return };
                manager.on_notification(&id, &activity, note).await;
            }
        })
    }

    async fn on_notification(
        self: &Arc<Self>,
        id: &str,
        activity: &Arc<ActivityTracker>,
        note: Notification,
    ) {
        match note.method.as_str() {
            notifications::TETHER_FRAME => {
                activity.touch();
                match serde_json::from_value::<TetherFrame>(note.params) {
                    Ok(frame) => {
                        if let Err(e) = self.tether.ring(id).append(frame) {
                            tracing::warn!(instance = id, error = %e, "tether append failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(instance = id, error = %e, "undecodable tether frame from guest")
                    }
                }
            }
            notifications::EXEC_OUTPUT => {
                if note.params.get("exec_id").and_then(|v| v.as_str()) == Some(MAIN_EXEC_ID) {
                    activity.touch();
                    let stream = note
                        .params
                        .get("stream")
                        .and_then(|v| v.as_str())
                        .unwrap_or("stdout");
                    let data = note
                        .params
                        .get("data")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    self.logs.output(id, stream, data);
                }
            }
            notifications::EXEC_EXIT => {
                if note.params.get("exec_id").and_then(|v| v.as_str()) == Some(MAIN_EXEC_ID) {
                    let exit_code = note
                        .params
                        .get("exit_code")
                        .and_then(|v| v.as_i64())
                        .unwrap_or(-1);
                    let manager = Arc::clone(self);
                    let id = id.to_string();
                    // Detach: the teardown below aborts this monitor task.
                    tokio::spawn(async move {
                        manager.on_main_exit(&id, exit_code).await;
                    });
                }
            }
            notifications::PORT_LISTEN => {
                if let Some(port) = note.params.get("port").and_then(|v| v.as_u64()) {
                    let manager = Arc::clone(self);
                    let id = id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = manager.expose(&id, port as u16, None, None).await {
                            tracing::warn!(instance = %id, port, error = %e, "auto-expose failed");
                        }
                    });
                }
            }
            notifications::KEEPALIVE => {
                let ttl = note
                    .params
                    .get("ttl_secs")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(300);
                let reason = note
                    .params
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("guest keepalive")
                    .to_string();
                let lease = Lease {
                    expires_at: Utc::now() + chrono::Duration::seconds(ttl as i64),
                    reason,
                };
                activity.set_lease(lease.clone());
                if let Ok(mut record) = self.get(id) {
                    record.lease = Some(lease);
                    record.touch();
                    let _ = self.store.save(&record);
                }
            }
            notifications::KEEPALIVE_RELEASE => {
                activity.clear_lease();
                if let Ok(mut record) = self.get(id) {
                    record.lease = None;
                    record.touch();
                    let _ = self.store.save(&record);
                }
            }
            notifications::READY => {
                // Re-announcements during resume are expected.
                activity.touch();
            }
            other => {
                tracing::debug!(instance = id, method = other, "unhandled guest notification");
            }
        }
    }

    /// Guest main command finished: clean transition to stopped.
    async fn on_main_exit(self: &Arc<Self>, id: &str, exit_code: i64) {
        let entry = self.entry(id);
        let _op = entry.op_lock.lock().await;
        let Ok(record) = self.get(id) else { return };
        if !record.state.has_vm() {
            return;
        }
        tracing::info!(instance = id, exit_code, "guest main command exited");
        if let Err(e) = self.stop_locked(id, &entry, Op::ProcessExit).await {
            tracing::warn!(instance = id, error = %e, "teardown after main exit failed");
        }
        self.logs
            .append_json(id, json!({"done": true, "exit_code": exit_code}));
    }

    /// Transport dropped. Fatal while the VM is supposed to be running;
    /// expected while paused (reconnect happens on resume).
    async fn on_transport_closed(self: &Arc<Self>, id: &str) {
        let entry = self.entry(id);
        let _op = entry.op_lock.lock().await;
        let Ok(mut record) = self.get(id) else { return };
        match record.state {
            InstanceState::Running | InstanceState::Starting => {
                tracing::warn!(instance = id, "harness disconnected with VM alive, failing instance");
                if let Some(handle) = record.vm_handle.clone() {
                    let _ = self.driver.stop_vm(&VmHandle(handle)).await;
                }
                *entry.live.lock() = None;
                entry.watchdog_gen.fetch_add(1, Ordering::SeqCst);
                if let Ok(next) = state::next(record.state, record.enabled, Op::BackendLost) {
                    record.state = next.state;
                }
                record.clear_transient();
                record.touch();
                let _ = self.store.save(&record);
                self.logs
                    .event(id, "failed", json!({"error": "harness disconnected"}));
            }
            _ => {
                tracing::debug!(instance = id, "transport reset while not running (expected)");
            }
        }
    }

    /// (Re-)arm the idle watchdog for a live instance.
    fn arm_watchdog(self: &Arc<Self>, entry: &Arc<Entry>, id: &str) {
        let generation = entry.watchdog_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::downgrade(self);
        let id = id.to_string();
        let entry_arc = Arc::clone(entry);

        let task = tokio::spawn(async move {
            idle_watchdog(manager, id, entry_arc, generation).await;
        });
        if let Some(live) = entry.live.lock().as_mut() {
            if let Some(old) = live.watchdog.replace(task) {
                old.abort();
            }
        }
    }

    /// Idle transition: running → paused. Re-validates under the op lock.
    async fn auto_pause(self: &Arc<Self>, id: &str, entry: &Arc<Entry>) {
        let _op = entry.op_lock.lock().await;
        let Ok(record) = self.get(id) else { return };
        if record.state != InstanceState::Running || entry.activity.pinned(Utc::now()) {
            return;
        }
        if let Err(e) = self.pause_locked(id, entry, Op::IdlePause).await {
            tracing::warn!(instance = id, error = %e, "idle pause failed");
        } else {
            self.logs.event(id, "idle-paused", json!({}));
        }
    }

    /// Idle transition: paused → stopped. Always releases resources, even
    /// when the backend stop partially fails.
    async fn auto_stop(self: &Arc<Self>, id: &str, entry: &Arc<Entry>) {
        let _op = entry.op_lock.lock().await;
        let Ok(record) = self.get(id) else { return };
        if record.state != InstanceState::Paused || entry.activity.pinned(Utc::now()) {
            return;
        }
        match self.stop_locked(id, entry, Op::IdleStop).await {
            Ok(_) => self.logs.event(id, "idle-stopped", json!({})),
            Err(e) => {
                tracing::warn!(instance = id, error = %e, "idle stop failed, forcing stopped state");
                if let Ok(mut record) = self.get(id) {
                    record.state = InstanceState::Stopped;
                    record.clear_transient();
                    record.stopped_at = Some(Utc::now());
                    record.touch();
                    let _ = self.store.save(&record);
                }
                *entry.live.lock() = None;
            }
        }
    }
}

/// Per-instance idle watchdog: selects over activity changes and the next
/// deadline; exits when the instance leaves the live states or a newer
/// watchdog generation supersedes it.
async fn idle_watchdog(
    manager: std::sync::Weak<InstanceManager>,
    id: String,
    entry: Arc<Entry>,
    generation: u64,
) {
    loop {
        let Some(manager) = manager.upgrade() else { return };
        if entry.watchdog_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        let Ok(record) = manager.get(&id) else { return };
        let caps = manager.driver.capabilities();

        match record.state {
            InstanceState::Running => {
                let deadline = entry.activity.idle_deadline(manager.config.pause_after_idle);
                match deadline {
                    None => {
                        drop(manager);
                        entry.activity.changed().await;
                    }
                    Some(deadline) => {
                        let sleep = tokio::time::sleep_until(deadline);
                        tokio::select! {
                            () = sleep => {
                                manager.auto_pause(&id, &entry).await;
                            }
                            () = entry.activity.changed() => {}
                            () = manager.shutdown.cancelled() => return,
                        }
                    }
                }
            }
            InstanceState::Paused => {
                if caps.persistent_pause {
                    // Pause is free on this backend; no stop timer. Resume
                    // re-arms a fresh watchdog.
                    return;
                }
                let deadline = entry.activity.idle_deadline(manager.config.stop_after_idle);
                match deadline {
                    None => {
                        drop(manager);
                        entry.activity.changed().await;
                    }
                    Some(deadline) => {
                        let sleep = tokio::time::sleep_until(deadline);
                        tokio::select! {
                            () = sleep => {
                                manager.auto_stop(&id, &entry).await;
                                return;
                            }
                            () = entry.activity.changed() => {}
                            () = manager.shutdown.cancelled() => return,
                        }
                    }
                }
            }
            _ => return,
        }
    }
}

impl InstanceManager {
    /// Router dispatch: wake if needed, resolve the backend address for the
    /// guest port, dial, and pin the instance for the connection's lifetime.
    async fn router_connect(
        self: &Arc<Self>,
        instance_id: &str,
        guest_port: u16,
    ) -> AegisResult<(BackendConn, ConnGuard)> {
        let record = self.get(instance_id)?;
        let record = if record.state == InstanceState::Running {
            record
        } else {
            self.wake(record.id.as_str()).await?
        };

        let endpoint = record
            .endpoints
            .iter()
            .find(|e| e.guest_port == guest_port)
            .cloned();
        let backend_addr = match endpoint {
            Some(endpoint) => endpoint.backend_addr,
            None => {
                let handle = record.vm_handle.clone().ok_or_else(|| {
                    AegisError::Conflict(format!("instance {instance_id} has no vm"))
                })?;
                self.driver
                    .dynamic_expose(&VmHandle(handle), guest_port)
                    .await?
                    .backend_addr
            }
        };

        // A freshly woken guest may need a beat before its listener accepts;
        // dial failures are retried with bounded backoff.
        let conn =
            crate::util::retry_transient(|| dial_backend(&backend_addr, guest_port)).await?;
        let entry = self.entry(record.id.as_str());
        entry.activity.conn_opened();
        let activity = Arc::clone(&entry.activity);
        let guard = ConnGuard::new(move || activity.conn_closed());
        Ok((conn, guard))
    }
}

/// Adapter the router holds; weak, so the manager's lifetime is unaffected.
struct ManagerRouterBackend(std::sync::Weak<InstanceManager>);

#[async_trait]
impl RouterBackend for ManagerRouterBackend {
    async fn connect(
        &self,
        instance_id: &str,
        guest_port: u16,
    ) -> AegisResult<(BackendConn, ConnGuard)> {
        let manager = self
            .0
            .upgrade()
            .ok_or_else(|| AegisError::Backend("daemon is shutting down".into()))?;
        manager.router_connect(instance_id, guest_port).await
    }
}
