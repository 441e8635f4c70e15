//! Integration tests for the point lifecycle
//!
//! A scripted engine stands in for the core so the tests can count instances
//! and force failures; the end-to-end tests run the direct core over
//! loopback.

use async_trait::async_trait;
use libv2ray_mobile::common::net::Destination;
use libv2ray_mobile::config::CoreConfig;
use libv2ray_mobile::engine::{
    CoreEngine, CoreInstance, DirectCore, ProxyConnection, StatsManager, SystemDialer,
};
use libv2ray_mobile::env::CoreEnv;
use libv2ray_mobile::point::{STATUS_CLOSED, STATUS_RUNNING};
use libv2ray_mobile::{
    CoreController, Error, InstanceTable, Phase, ProtectPolicy, SocketProtector, StartOptions,
    VpnServiceSupport,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Barrier;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MINIMAL_CONFIG: &str = r#"{"outbounds": [{"tag": "direct", "protocol": "freedom"}]}"#;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl Counters {
    fn live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedInstance {
    counters: Arc<Counters>,
    fail_start: bool,
    start_delay: Duration,
    close_delay: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl CoreInstance for ScriptedInstance {
    fn start(&self) -> libv2ray_mobile::Result<()> {
        std::thread::sleep(self.start_delay);
        if self.fail_start {
            return Err(Error::connection("listen failed"));
        }
        Ok(())
    }

    fn close(&self) -> libv2ray_mobile::Result<()> {
        std::thread::sleep(self.close_delay);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stats_manager(&self) -> Option<Arc<dyn StatsManager>> {
        None
    }

    async fn dial(&self, dest: &Destination) -> libv2ray_mobile::Result<Box<dyn ProxyConnection>> {
        Err(Error::connection(format!("scripted instance cannot dial {}", dest)))
    }
}

#[derive(Default)]
struct ScriptedEngine {
    counters: Arc<Counters>,
    fail_start: AtomicBool,
    start_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
    dialers: AtomicUsize,
}

impl CoreEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn register_dialer(&self, _dialer: Arc<dyn SystemDialer>) {
        self.dialers.fetch_add(1, Ordering::SeqCst);
    }

    fn new_instance(&self, _config: CoreConfig) -> libv2ray_mobile::Result<Arc<dyn CoreInstance>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedInstance {
            counters: self.counters.clone(),
            fail_start: self.fail_start.load(Ordering::SeqCst),
            start_delay: Duration::from_millis(self.start_delay_ms.load(Ordering::SeqCst)),
            close_delay: Duration::from_millis(self.close_delay_ms.load(Ordering::SeqCst)),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Host stand-in recording every callback
#[derive(Default)]
struct RecordingHost {
    protected: Mutex<Vec<i32>>,
    statuses: Mutex<Vec<(i32, String)>>,
    setups: AtomicUsize,
    prepares: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingHost {
    fn statuses(&self) -> Vec<String> {
        self.statuses.lock().iter().map(|(_, s)| s.clone()).collect()
    }
}

impl SocketProtector for RecordingHost {
    fn protect(&self, fd: i32) -> bool {
        self.protected.lock().push(fd);
        true
    }
}

impl VpnServiceSupport for RecordingHost {
    fn setup(&self, _conf: &str) -> i32 {
        self.setups.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn prepare(&self) -> i32 {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn shutdown(&self) -> i32 {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn on_emit_status(&self, code: i32, message: &str) -> i32 {
        self.statuses.lock().push((code, message.to_string()));
        0
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Config file removed on drop
struct TempConfig(PathBuf);

impl TempConfig {
    fn new(content: &str) -> Self {
        let path = std::env::temp_dir().join(format!("point-test-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, content).unwrap();
        TempConfig(path)
    }

    fn options(&self) -> StartOptions {
        StartOptions::new(&self.0)
    }
}

impl Drop for TempConfig {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn scripted_point() -> (Arc<ScriptedEngine>, Arc<RecordingHost>, CoreController) {
    let engine = Arc::new(ScriptedEngine::default());
    let host = Arc::new(RecordingHost::default());
    let point = CoreController::new(engine.clone(), host.clone());
    (engine, host, point)
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Echo server answering one read per connection
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for mut s in listener.incoming().flatten() {
            let mut buf = [0u8; 64];
            if let Ok(n) = s.read(&mut buf) {
                let _ = s.write_all(&buf[..n]);
            }
        }
    });
    addr
}

fn http_204_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for mut s in listener.incoming().flatten() {
            let mut buf = [0u8; 1024];
            let _ = s.read(&mut buf);
            let _ = s.write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        }
    });
    addr
}

fn relay_config(listen_port: u16, target: SocketAddr) -> String {
    format!(
        r#"{{
            "log": {{"loglevel": "debug"}},
            "stats": {{}},
            "inbounds": [{{
                "tag": "in",
                "port": {},
                "protocol": "dokodemo-door",
                "settings": {{"address": "{}", "port": {}}}
            }}],
            "outbounds": [{{"tag": "direct", "protocol": "freedom"}}]
        }}"#,
        listen_port,
        target.ip(),
        target.port()
    )
}

// ---------------------------------------------------------------------------
// Single-instance controller
// ---------------------------------------------------------------------------

/// A started point runs one instance and notifies the host once
#[test]
fn test_start_stop_notifies() {
    let (engine, host, point) = scripted_point();
    let config = TempConfig::new(MINIMAL_CONFIG);

    point.start(&config.options()).unwrap();
    assert!(point.is_running());
    assert_eq!(engine.counters.live(), 1);
    assert_eq!(host.prepares.load(Ordering::SeqCst), 1);
    assert_eq!(host.setups.load(Ordering::SeqCst), 1);

    point.stop();
    assert!(!point.is_running());
    assert_eq!(engine.counters.live(), 0);
    assert_eq!(host.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(host.statuses(), vec![STATUS_RUNNING, STATUS_CLOSED]);
    assert!(host.statuses.lock().iter().all(|(code, _)| *code == 0));
}

/// Starting twice keeps the first instance and sends no second notification
#[test]
fn test_second_start_is_noop() {
    let (engine, host, point) = scripted_point();
    let config = TempConfig::new(MINIMAL_CONFIG);

    point.start(&config.options()).unwrap();
    point.start(&config.options()).unwrap();

    assert_eq!(engine.counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(host.statuses(), vec![STATUS_RUNNING]);
    point.stop();
}

/// Stopping a stopped point does nothing
#[test]
fn test_stop_when_not_running() {
    let (_engine, host, point) = scripted_point();
    point.stop();
    point.stop();

    assert!(!point.is_running());
    assert!(host.statuses().is_empty());
    assert_eq!(host.shutdowns.load(Ordering::SeqCst), 0);
}

/// Missing config surfaces as a config-load failure and leaves the point stopped
#[test]
fn test_missing_config() {
    let (engine, host, point) = scripted_point();
    let options = StartOptions::new(std::env::temp_dir().join("no-such-point-config.json"));

    let err = point.start(&options).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::ConfigLoad));
    assert!(err.to_string().starts_with("config-load failed:"));
    assert!(!point.is_running());
    assert_eq!(engine.counters.created.load(Ordering::SeqCst), 0);
    assert!(host.statuses().is_empty());
}

#[test]
fn test_malformed_config() {
    let (_engine, _host, point) = scripted_point();
    let config = TempConfig::new("{ not json");

    let err = point.start(&config.options()).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::ConfigLoad));
    assert!(!point.is_running());
}

/// A failed start releases the instance it built
#[test]
fn test_startup_failure_rolls_back() {
    let (engine, host, point) = scripted_point();
    engine.fail_start.store(true, Ordering::SeqCst);
    let config = TempConfig::new(MINIMAL_CONFIG);

    let err = point.start(&config.options()).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Startup));
    assert!(!point.is_running());
    assert_eq!(engine.counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(engine.counters.live(), 0);
    assert!(host.statuses().is_empty());

    engine.fail_start.store(false, Ordering::SeqCst);
    point.start(&config.options()).unwrap();
    assert!(point.is_running());
    point.stop();
}

/// A start that fails slowly is never observable as running
#[test]
fn test_failed_start_never_reads_running() {
    let (engine, host, point) = scripted_point();
    engine.fail_start.store(true, Ordering::SeqCst);
    engine.start_delay_ms.store(300, Ordering::SeqCst);
    let point = Arc::new(point);
    let config = TempConfig::new(MINIMAL_CONFIG);

    let done = Arc::new(AtomicBool::new(false));
    let watcher = {
        let point = point.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut seen_running = false;
            while !done.load(Ordering::SeqCst) {
                seen_running |= point.is_running();
                std::thread::yield_now();
            }
            seen_running
        })
    };

    assert!(point.start(&config.options()).is_err());
    done.store(true, Ordering::SeqCst);
    assert!(!watcher.join().unwrap());
    assert!(host.statuses().is_empty());
}

/// A failed start puts the previous TUN descriptor back
#[test]
fn test_failed_start_restores_tun_fd() {
    let (engine, _host, point) = scripted_point();
    engine.fail_start.store(true, Ordering::SeqCst);
    let config = TempConfig::new(MINIMAL_CONFIG);

    libv2ray_mobile::env::set_tun_fd(11);
    assert!(point.start(&config.options().with_tun_fd(99)).is_err());
    assert_eq!(libv2ray_mobile::env::tun_fd(), Some(11));

    engine.fail_start.store(false, Ordering::SeqCst);
    point.start(&config.options().with_tun_fd(99)).unwrap();
    assert_eq!(libv2ray_mobile::env::tun_fd(), Some(99));
    point.stop();
}

/// The blocking probe refuses to run on an async runtime thread
#[tokio::test]
async fn test_measure_delay_inside_runtime_is_error() {
    let (_engine, _host, point) = scripted_point();
    let config = TempConfig::new(MINIMAL_CONFIG);
    point.start(&config.options()).unwrap();

    let result = point.measure_delay("http://127.0.0.1:9/");
    assert!(matches!(result, Err(Error::Runtime(_))));
    assert_eq!(libv2ray_mobile::delay::delay_or_failed(result), -1);
    point.stop();
}

/// Racing start and stop never leaves a stray instance behind
#[test]
fn test_concurrent_start_stop() {
    let (engine, host, point) = scripted_point();
    let point = Arc::new(point);
    let config = Arc::new(TempConfig::new(MINIMAL_CONFIG));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let point = point.clone();
            let config = config.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    if i % 2 == 0 {
                        let _ = point.start(&config.options());
                    } else {
                        point.stop();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let expected_live = usize::from(point.is_running());
    assert_eq!(engine.counters.live(), expected_live);

    let statuses = host.statuses();
    for pair in statuses.windows(2) {
        assert_ne!(pair[0], pair[1], "notifications must alternate");
    }
    if let Some(first) = statuses.first() {
        assert_eq!(first, STATUS_RUNNING);
    }

    point.stop();
    assert_eq!(engine.counters.live(), 0);
}

#[test]
fn test_version_is_stable() {
    let (engine, _host, point) = scripted_point();
    assert_eq!(point.check_version(), "Lib v27, scripted v1.0.0");
    assert_eq!(point.check_version(), point.check_version());
    assert_eq!(engine.dialers.load(Ordering::SeqCst), 1);
}

#[test]
fn test_queries_when_not_running() {
    let (_engine, _host, point) = scripted_point();
    assert_eq!(point.query_stats("direct", "uplink"), 0);
    assert!(matches!(point.measure_delay(""), Err(Error::NotRunning)));
}

/// Dropping a running point closes its instance
#[test]
fn test_drop_releases_instance() {
    let (engine, _host, point) = scripted_point();
    let config = TempConfig::new(MINIMAL_CONFIG);
    point.start(&config.options()).unwrap();
    drop(point);
    assert_eq!(engine.counters.live(), 0);
}

// ---------------------------------------------------------------------------
// Keyed table
// ---------------------------------------------------------------------------

#[test]
fn test_table_duplicate_key() {
    let engine = Arc::new(ScriptedEngine::default());
    let table = InstanceTable::new(engine.clone());
    let config = TempConfig::new(MINIMAL_CONFIG);

    table.start(&config.0, 1).unwrap();
    let err = table.start(&config.0, 1).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(1)));
    assert_eq!(err.to_string(), "point already exist: 1");

    assert!(table.contains(1));
    assert_eq!(table.len(), 1);
    assert_eq!(engine.counters.created.load(Ordering::SeqCst), 2);
    assert_eq!(engine.counters.live(), 1);

    table.start(&config.0, 2).unwrap();
    assert_eq!(table.len(), 2);

    table.stop(1);
    table.stop(2);
    assert!(table.is_empty());
    assert_eq!(engine.counters.live(), 0);
}

/// Two callers racing for one key: exactly one wins, the loser is released
#[test]
fn test_table_concurrent_same_key() {
    let engine = Arc::new(ScriptedEngine::default());
    engine.start_delay_ms.store(20, Ordering::SeqCst);
    let table = Arc::new(InstanceTable::new(engine.clone()));
    let config = Arc::new(TempConfig::new(MINIMAL_CONFIG));
    let barrier = Arc::new(Barrier::new(2));

    let racers: Vec<_> = (0..2)
        .map(|_| {
            let table = table.clone();
            let config = config.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                table.start(&config.0, 5)
            })
        })
        .collect();
    let results: Vec<_> = racers.into_iter().map(|r| r.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyExists(5))))
            .count(),
        1
    );
    assert_eq!(table.len(), 1);
    assert_eq!(engine.counters.live(), 1);

    table.stop(5);
    assert_eq!(engine.counters.live(), 0);
}

/// Closing a rejected duplicate does not hold up other keys
#[test]
fn test_table_rejected_close_does_not_block_other_keys() {
    let engine = Arc::new(ScriptedEngine::default());
    let table = Arc::new(InstanceTable::new(engine.clone()));
    let config = TempConfig::new(MINIMAL_CONFIG);
    table.start(&config.0, 1).unwrap();

    engine.close_delay_ms.store(800, Ordering::SeqCst);
    let duplicate = {
        let table = table.clone();
        let path = config.0.clone();
        std::thread::spawn(move || table.start(&path, 1))
    };
    std::thread::sleep(Duration::from_millis(100));

    let mut worst = Duration::ZERO;
    for key in 2..200 {
        let begin = Instant::now();
        assert!(!table.contains(key));
        worst = worst.max(begin.elapsed());
    }
    assert!(worst < Duration::from_millis(300), "lookup stalled for {:?}", worst);

    let result = duplicate.join().unwrap();
    assert!(matches!(result, Err(Error::AlreadyExists(1))));
    assert!(table.contains(1));
}

#[test]
fn test_table_stop() {
    let engine = Arc::new(ScriptedEngine::default());
    let table = InstanceTable::new(engine.clone());
    let config = TempConfig::new(MINIMAL_CONFIG);

    table.stop(7);
    assert!(table.is_empty());

    table.start(&config.0, 7).unwrap();
    table.stop(7);
    assert!(!table.contains(7));
    assert_eq!(engine.counters.live(), 0);
}

#[test]
fn test_table_failures_leave_key_free() {
    let engine = Arc::new(ScriptedEngine::default());
    let table = InstanceTable::new(engine.clone());

    let err = table
        .start(&std::env::temp_dir().join("no-such-table-config.json"), 3)
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::ConfigLoad));

    engine.fail_start.store(true, Ordering::SeqCst);
    let config = TempConfig::new(MINIMAL_CONFIG);
    let err = table.start(&config.0, 3).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Startup));
    assert!(!table.contains(3));
    assert_eq!(engine.counters.live(), 0);
}

// ---------------------------------------------------------------------------
// Direct core end to end
// ---------------------------------------------------------------------------

/// Relayed connections are dialed through the host's protect hook and counted
#[test]
fn test_direct_core_relay_protects_and_counts() {
    let target = echo_server();
    let port = free_port();
    let config = TempConfig::new(&relay_config(port, target));

    let host = Arc::new(RecordingHost::default());
    let point = CoreController::new(Arc::new(DirectCore::new()), host.clone());
    point.start(&config.options()).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    drop(client);

    assert_eq!(host.protected.lock().len(), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut uplink = 0;
    while uplink == 0 && Instant::now() < deadline {
        uplink = point.query_stats("direct", "uplink");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(uplink, 5);
    assert_eq!(point.query_stats("direct", "uplink"), 0);

    point.stop();
    assert!(!point.is_running());
}

#[test]
fn test_direct_core_measure_delay() {
    let target = http_204_server();
    let config = TempConfig::new(MINIMAL_CONFIG);

    let host = Arc::new(RecordingHost::default());
    let point = CoreController::new(Arc::new(DirectCore::new()), host.clone());
    point.start(&config.options()).unwrap();

    let ms = point.measure_delay(&format!("http://{}/generate_204", target)).unwrap();
    assert!(ms >= 0);
    assert!(!host.protected.lock().is_empty());
    point.stop();
}

/// A port already in use fails start in the startup phase
#[test]
fn test_direct_core_port_conflict() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = TempConfig::new(&relay_config(port, echo_server()));

    let host = Arc::new(RecordingHost::default());
    let point = CoreController::new(Arc::new(DirectCore::new()), host.clone());

    let err = point.start(&config.options()).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Startup));
    assert!(!point.is_running());
    assert!(host.statuses().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_core_measure_delay_async() {
    let target = http_204_server();
    let config = TempConfig::new(MINIMAL_CONFIG);

    let point = CoreController::new(Arc::new(DirectCore::new()), Arc::new(RecordingHost::default()));
    point.start(&config.options()).unwrap();

    let ms = point
        .measure_delay_async(&format!("http://{}/generate_204", target))
        .await
        .unwrap();
    assert!(ms >= 0);
    point.stop();
}

#[test]
fn test_fail_closed_policy_blocks_probe() {
    struct RefusingHost;

    impl SocketProtector for RefusingHost {
        fn protect(&self, _fd: i32) -> bool {
            false
        }
    }

    impl VpnServiceSupport for RefusingHost {
        fn setup(&self, _conf: &str) -> i32 {
            0
        }

        fn prepare(&self) -> i32 {
            0
        }

        fn shutdown(&self) -> i32 {
            0
        }

        fn on_emit_status(&self, _code: i32, _message: &str) -> i32 {
            0
        }
    }

    let target = http_204_server();
    let config = TempConfig::new(MINIMAL_CONFIG);
    let point = CoreController::with_policy(
        Arc::new(DirectCore::new()),
        Arc::new(RefusingHost),
        ProtectPolicy::FailClosed,
    );
    assert_eq!(point.protect_policy(), ProtectPolicy::FailClosed);
    point.start(&config.options()).unwrap();

    let result = point.measure_delay(&format!("http://{}/", target));
    assert!(matches!(result, Err(Error::Protect(_))));
    point.stop();
}

/// Configs missing from disk are served from the asset directory
#[test]
fn test_table_reads_config_from_assets() {
    let asset_dir = std::env::temp_dir().join(format!("point-assets-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&asset_dir).unwrap();
    std::fs::write(asset_dir.join("bundled.json"), MINIMAL_CONFIG).unwrap();

    let engine = Arc::new(ScriptedEngine::default());
    let reader = Arc::new(CoreEnv::new(asset_dir.to_string_lossy(), "").asset_reader());
    let table = InstanceTable::with_file_reader(engine.clone(), reader);

    table
        .start(Path::new("/nonexistent/dir/bundled.json"), 9)
        .unwrap();
    assert!(table.contains(9));
    table.stop(9);

    let _ = std::fs::remove_dir_all(&asset_dir);
}
