//! Single-instance lifecycle controller
//!
//! Owns at most one running core instance. `start` and `stop` serialize on
//! one mutex, so the NotRunning -> Running -> NotRunning transitions are
//! atomic to callers even though building the instance can take a while.

use super::support::{VpnServiceSupport, STATUS_CLOSED, STATUS_OK, STATUS_RUNNING};
use crate::config::load_config_file;
use crate::engine::{version_line, CoreEngine, CoreInstance, StatsManager};
use crate::delay::{self, ProbeTimeouts};
use crate::env::{self, FileReader, FsReader};
use crate::protect::{ProtectPolicy, ProtectedDialer, SocketProtector};
use crate::statistic::counter_name;
use crate::{logging, Error, Phase, Result, LIB_VERSION};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Parameters of one start call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub config_path: PathBuf,
    /// Published as `xray.tun.fd` before the config loads, and restored if
    /// the start fails. Writing the process environment races with any
    /// thread reading it, so hosts running other instances should set the
    /// descriptor once through [`CoreEnv`](crate::env::CoreEnv) instead.
    pub tun_fd: Option<i32>,
}

impl StartOptions {
    pub fn new<P: Into<PathBuf>>(config_path: P) -> Self {
        StartOptions {
            config_path: config_path.into(),
            tun_fd: None,
        }
    }

    pub fn with_tun_fd(mut self, fd: i32) -> Self {
        self.tun_fd = Some(fd);
        self
    }
}

/// Engine handle guarded by the lifecycle lock
#[derive(Default)]
struct EngineHandle {
    instance: Option<Arc<dyn CoreInstance>>,
    stats: Option<Arc<dyn StatsManager>>,
}

/// The point: lifecycle control of one core instance for the host
pub struct CoreController {
    engine: Arc<dyn CoreEngine>,
    support: Arc<dyn VpnServiceSupport>,
    dialer: Arc<ProtectedDialer>,
    reader: Arc<dyn FileReader>,
    handle: Mutex<EngineHandle>,
    running: AtomicBool,
    version: String,
}

impl CoreController {
    /// Create a controller and register its protected dialer with `engine`
    pub fn new<S>(engine: Arc<dyn CoreEngine>, support: Arc<S>) -> Self
    where
        S: VpnServiceSupport + 'static,
    {
        Self::with_policy(engine, support, ProtectPolicy::default())
    }

    pub fn with_policy<S>(engine: Arc<dyn CoreEngine>, support: Arc<S>, policy: ProtectPolicy) -> Self
    where
        S: VpnServiceSupport + 'static,
    {
        logging::try_init_default();

        let protector: Arc<dyn SocketProtector> = support.clone();
        let dialer = Arc::new(ProtectedDialer::with_policy(protector, policy));
        engine.register_dialer(dialer.clone());

        let version = version_line(LIB_VERSION, engine.as_ref());
        CoreController {
            engine,
            support,
            dialer,
            reader: Arc::new(FsReader),
            handle: Mutex::new(EngineHandle::default()),
            running: AtomicBool::new(false),
            version,
        }
    }

    /// Replace the file-reader hook used to open configs
    pub fn with_file_reader(mut self, reader: Arc<dyn FileReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Start the core. Idempotent while running.
    pub fn start(&self, options: &StartOptions) -> Result<()> {
        let mut handle = self.handle.lock();

        if self.running.load(Ordering::SeqCst) {
            info!("Core already running, start ignored");
            return Ok(());
        }

        let previous_tun_fd = env::tun_fd();
        if let Some(fd) = options.tun_fd {
            env::set_tun_fd(fd);
        }

        let instance = match self.build_and_start(options) {
            Ok(instance) => instance,
            Err(e) => {
                if options.tun_fd.is_some() {
                    match previous_tun_fd {
                        Some(fd) => env::set_tun_fd(fd),
                        None => env::clear_tun_fd(),
                    }
                }
                error!("{}", e);
                return Err(e);
            }
        };
        handle.stats = instance.stats_manager();
        handle.instance = Some(instance);
        self.running.store(true, Ordering::SeqCst);

        self.check_code("prepare", self.support.prepare());
        self.check_code("setup", self.support.setup(""));
        self.support.on_emit_status(STATUS_OK, STATUS_RUNNING);
        Ok(())
    }

    /// Load, build and start an instance; a failed start releases it
    fn build_and_start(&self, options: &StartOptions) -> Result<Arc<dyn CoreInstance>> {
        info!("loading core config");
        let config = load_config_file(self.reader.as_ref(), &options.config_path)?;

        info!("new core");
        let instance = self
            .engine
            .new_instance(config)
            .map_err(|e| e.in_phase(Phase::CoreInit))?;

        info!("start core");
        if let Err(e) = instance.start() {
            if let Err(close_err) = instance.close() {
                warn!("Failed to release core after start failure: {}", close_err);
            }
            return Err(e.in_phase(Phase::Startup));
        }
        Ok(instance)
    }

    /// Stop the core. No-op when not running.
    pub fn stop(&self) {
        let mut handle = self.handle.lock();

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        handle.stats = None;
        if let Some(instance) = handle.instance.take() {
            if let Err(e) = instance.close() {
                warn!("Core close returned error: {}", e);
            }
        }
        info!("core stopped");

        self.check_code("shutdown", self.support.shutdown());
        self.support.on_emit_status(STATUS_OK, STATUS_CLOSED);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `Lib v<binding>, <engine> v<engine version>`
    pub fn check_version(&self) -> &str {
        &self.version
    }

    /// Read and reset `outbound>>>tag>>>traffic>>>direct`; 0 when unavailable
    pub fn query_stats(&self, tag: &str, direct: &str) -> i64 {
        let handle = self.handle.lock();
        handle
            .stats
            .as_ref()
            .and_then(|stats| stats.query(&counter_name("outbound", tag, direct), true))
            .unwrap_or(0)
    }

    /// Probe `url` through the running instance, in milliseconds
    pub fn measure_delay(&self, url: &str) -> Result<i64> {
        let instance = self.running_instance()?;
        delay::block_on(delay::measure_instance_delay(
            instance.as_ref(),
            url,
            ProbeTimeouts::default(),
        ))?
    }

    /// Async variant of [`measure_delay`](Self::measure_delay)
    pub async fn measure_delay_async(&self, url: &str) -> Result<i64> {
        let instance = self.running_instance()?;
        delay::measure_instance_delay(instance.as_ref(), url, ProbeTimeouts::default()).await
    }

    pub fn protect_policy(&self) -> ProtectPolicy {
        self.dialer.policy()
    }

    fn running_instance(&self) -> Result<Arc<dyn CoreInstance>> {
        self.handle.lock().instance.clone().ok_or(Error::NotRunning)
    }

    fn check_code(&self, hook: &str, code: i32) {
        if code != 0 {
            warn!("Host {} returned {}", hook, code);
        }
    }
}

impl Drop for CoreController {
    fn drop(&mut self) {
        if let Some(instance) = self.handle.get_mut().instance.take() {
            if let Err(e) = instance.close() {
                warn!("Core close on drop returned error: {}", e);
            }
        }
    }
}
