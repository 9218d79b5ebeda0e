//! The AegisVM host daemon.
//!
//! Startup order: config → layout → pid lock → registry → drivers →
//! lifecycle manager → orphan sweep + recovery → control socket. SIGTERM
//! and SIGINT trigger a bounded stop of every live instance before the
//! socket and pid files are removed.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aegis::config::AegisConfig;
use aegis::db::Database;
use aegis::lifecycle::InstanceManager;
use aegis::net::NetPlane;
use aegis::rootfs::{CommandRootfsProvider, FixtureRootfsProvider, RootfsProvider};
use aegis::router::Router;
use aegis::vmm::fake::FakeVmm;
use aegis::vmm::subnet::SubnetAllocator;
use aegis::vmm::tap::TapVmm;
use aegis::vmm::userspace::UserspaceVmm;
use aegis::vmm::{VmmDriver, VmmKind};

/// AegisVM host daemon — launches, supervises and exposes isolated microVMs.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// State directory (default: $AEGIS_HOME or ~/.aegis)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Control socket path (default: <data-dir>/aegisd.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Hypervisor backend: userspace, tap, or fake (development)
    #[arg(long)]
    vmm: Option<String>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_filter: Option<String>,

    /// Log to stderr instead of the rotating file
    #[arg(long)]
    foreground: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AegisConfig::load(args.data_dir.clone()).context("load configuration")?;
    if let Some(socket) = args.socket.clone() {
        config.socket_path = socket;
    }

    let layout = config.layout();
    layout.ensure().context("create state directories")?;

    // Keep the appender guard alive for the life of the process.
    let _log_guard = init_logging(&args, &config)?;

    // Exclusive pid lock: a second daemon on the same data dir refuses to
    // start instead of corrupting state.
    let _pid_lock = acquire_pid_lock(&layout.pid_path())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: AegisConfig) -> Result<()> {
    let layout = config.layout();
    let db = Database::open(&layout.db_path()).context("open registry")?;

    let subnets = Arc::new(SubnetAllocator::new(config.subnet_pool));
    let net = NetPlane::new();
    let router = Router::new();

    let vmm_choice = args.vmm.as_deref().unwrap_or(match config.vmm {
        VmmKind::Userspace => "userspace",
        VmmKind::Tap => "tap",
    });
    let (driver, rootfs): (Arc<dyn VmmDriver>, Arc<dyn RootfsProvider>) = match vmm_choice {
        "fake" => {
            tracing::warn!("running with the in-process fake backend (development mode)");
            (
                Arc::new(FakeVmm::new()),
                Arc::new(FixtureRootfsProvider::new(layout.rootfs_cache_dir())),
            )
        }
        other => {
            let kind: VmmKind = other.parse().context("parse --vmm")?;
            let provider = Arc::new(CommandRootfsProvider::new(
                config.rootfs_provider_binary.clone(),
                layout.rootfs_cache_dir(),
            ));
            let driver: Arc<dyn VmmDriver> = match kind {
                VmmKind::Userspace => Arc::new(UserspaceVmm::new(config.clone())),
                VmmKind::Tap => Arc::new(TapVmm::new(
                    config.clone(),
                    Arc::clone(&subnets),
                    net.clone(),
                )),
            };
            (driver, provider)
        }
    };

    let caps = driver.capabilities();
    tracing::info!(
        backend = caps.name,
        persistent_pause = caps.persistent_pause,
        rootfs = ?caps.rootfs_type,
        snapshot = driver.as_snapshot().is_some(),
        "hypervisor backend probed"
    );

    let manager = InstanceManager::new(
        config.clone(),
        db,
        driver,
        rootfs,
        subnets,
        net,
        router,
    )
    .context("construct lifecycle manager")?;

    manager.recover().await.context("recover persisted state")?;

    let listener =
        aegis::api::bind_control_socket(&config.socket_path).context("bind control socket")?;
    tracing::info!(socket = %config.socket_path.display(), "control api listening");

    let shutdown = CancellationToken::new();
    let serve_task = {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        tokio::spawn(aegis::api::serve(manager, listener, shutdown))
    };

    wait_for_signal().await;
    tracing::info!("shutdown signal received, stopping instances");

    shutdown.cancel();
    if let Err(e) = manager.shutdown().await {
        tracing::warn!(error = %e, "instance shutdown incomplete");
    }
    let _ = serve_task.await;

    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(layout.pid_path());
    tracing::info!("daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    tokio::select! {
        _ = term.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "ctrl-c handler failed");
            }
        }
    }
}

/// File logs with daily rotation, or stderr in foreground mode.
fn init_logging(
    args: &Args,
    config: &AegisConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = match &args.log_filter {
        Some(filter) => EnvFilter::try_new(filter).context("parse --log-filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if args.foreground {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    }

    let logs_dir = config.layout().logs_dir();
    std::fs::create_dir_all(&logs_dir).context("create logs directory")?;
    let appender = tracing_appender::rolling::daily(logs_dir, "aegisd.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}

/// Take an exclusive flock on the pid file and write our pid into it.
fn acquire_pid_lock(path: &std::path::Path) -> Result<nix::fcntl::Flock<std::fs::File>> {
    use nix::fcntl::{Flock, FlockArg};

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;

    let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        anyhow::anyhow!(
            "another aegisd already holds {} ({errno}); refusing to start",
            path.display()
        )
    })?;

    lock.set_len(0).context("truncate pid file")?;
    let mut writer = &*lock;
    writeln!(writer, "{}", std::process::id()).context("write pid file")?;
    Ok(lock)
}
