//! Shared fixtures: a full daemon wired to the in-process fake backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use aegis::config::AegisConfig;
use aegis::db::Database;
use aegis::lifecycle::InstanceManager;
use aegis::net::NetPlane;
use aegis::rootfs::FixtureRootfsProvider;
use aegis::router::Router;
use aegis::types::InstanceSpec;
use aegis::vmm::fake::FakeVmm;
use aegis::vmm::subnet::SubnetAllocator;
use aegis::vmm::VmmDriver;

/// One daemon instance over a temp state dir and the fake backend.
pub struct TestDaemon {
    pub manager: Arc<InstanceManager>,
    pub config: AegisConfig,
    // NOTE(lifetime): removal of the state dir is tied to this guard.
    _dir: Option<TempDir>,
}

impl TestDaemon {
    pub async fn new() -> Self {
        Self::with_driver(Arc::new(FakeVmm::new())).await
    }

    pub async fn with_driver(driver: Arc<dyn VmmDriver>) -> Self {
        let dir = TempDir::new_in("/tmp").expect("create temp dir");
        let daemon = Self::build(dir.path().to_path_buf(), driver).await;
        Self {
            _dir: Some(dir),
            ..daemon
        }
    }

    /// Re-open a daemon over an existing state dir (restart simulation).
    pub async fn reopen(data_dir: PathBuf) -> Self {
        Self::build(data_dir, Arc::new(FakeVmm::new())).await
    }

    async fn build(data_dir: PathBuf, driver: Arc<dyn VmmDriver>) -> Self {
        let mut config = AegisConfig::defaults_for(data_dir);
        // Idle thresholds small enough for virtual-time tests.
        config.pause_after_idle = Duration::from_millis(500);
        config.stop_after_idle = Duration::from_millis(800);
        config.handshake_timeout = Duration::from_secs(5);
        config.start_timeout = Duration::from_secs(10);
        config.stop_grace = Duration::from_millis(500);

        let db = Database::open(&config.layout().db_path()).expect("open registry");
        let subnets = Arc::new(SubnetAllocator::new(config.subnet_pool));
        let rootfs = Arc::new(FixtureRootfsProvider::new(
            config.layout().rootfs_cache_dir(),
        ));
        let manager = InstanceManager::new(
            config.clone(),
            db,
            driver,
            rootfs,
            subnets,
            NetPlane::new(),
            Router::new(),
        )
        .expect("construct manager");

        Self {
            manager,
            config,
            _dir: None,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config.data_dir.clone()
    }

    /// Detach the temp dir guard so a restart test can reuse the path.
    pub fn leak_dir(&mut self) -> PathBuf {
        if let Some(dir) = self._dir.take() {
            #[allow(deprecated)]
            dir.into_path()
        } else {
            self.data_dir()
        }
    }
}

/// Minimal runnable spec for the fake backend.
pub fn spec(handle: Option<&str>) -> InstanceSpec {
    InstanceSpec {
        handle: handle.map(str::to_string),
        image: Some("alpine:3.20".to_string()),
        command: vec!["sleep".to_string(), "infinity".to_string()],
        ..Default::default()
    }
}
