//! Direct core
//!
//! A small relay engine: each `dokodemo-door` inbound listens on a local
//! port and forwards every accepted connection to its fixed target through
//! the first outbound. `freedom` dials with the registered system dialer,
//! `blackhole` refuses.

use super::{CoreEngine, CoreInstance, PlainDialer, ProxyConnection, StatsManager, SystemDialer};
use crate::common::net::{Address, Destination, Network};
use crate::config::{CoreConfig, InboundConfig, OutboundConfig};
use crate::statistic::TrafficStats;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DIRECT_CORE_NAME: &str = "direct-core";

const INBOUND: &str = "inbound";
const OUTBOUND: &str = "outbound";

/// Back-off after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The in-crate engine
pub struct DirectCore {
    dialer: RwLock<Arc<dyn SystemDialer>>,
}

impl DirectCore {
    pub fn new() -> Self {
        DirectCore {
            dialer: RwLock::new(Arc::new(PlainDialer)),
        }
    }
}

impl Default for DirectCore {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreEngine for DirectCore {
    fn name(&self) -> &str {
        DIRECT_CORE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn register_dialer(&self, dialer: Arc<dyn SystemDialer>) {
        *self.dialer.write() = dialer;
        info!("Alternative system dialer registered");
    }

    fn new_instance(&self, config: CoreConfig) -> Result<Arc<dyn CoreInstance>> {
        let dialer = self.dialer.read().clone();
        let instance = DirectInstance::new(config, dialer)?;
        Ok(Arc::new(instance))
    }
}

/// Outbound handler kinds
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutboundKind {
    Freedom,
    Blackhole,
}

#[derive(Debug, Clone)]
struct Outbound {
    tag: String,
    kind: OutboundKind,
}

impl Outbound {
    fn from_config(index: usize, config: &OutboundConfig) -> Result<Self> {
        let kind = match config.protocol.to_lowercase().as_str() {
            "freedom" | "direct" => OutboundKind::Freedom,
            "blackhole" | "block" => OutboundKind::Blackhole,
            other => {
                return Err(Error::config(format!("unsupported outbound protocol: {}", other)))
            }
        };
        Ok(Outbound {
            tag: config.tag.clone().unwrap_or_else(|| format!("outbound-{}", index)),
            kind,
        })
    }
}

#[derive(Debug, Clone)]
struct Inbound {
    tag: String,
    listen: SocketAddr,
    target: Destination,
}

impl Inbound {
    fn from_config(index: usize, config: &InboundConfig) -> Result<Self> {
        let tag = config.tag.clone().unwrap_or_else(|| format!("inbound-{}", index));

        match config.protocol.to_lowercase().as_str() {
            "dokodemo-door" | "tunnel" => {}
            other => {
                return Err(Error::config(format!("unsupported inbound protocol: {}", other)))
            }
        }
        if config.port == 0 {
            return Err(Error::config(format!("inbound {}: port is required", tag)));
        }

        let ip: IpAddr = match config.listen.as_deref() {
            None | Some("") => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(listen) => listen
                .parse()
                .map_err(|_| Error::config(format!("inbound {}: invalid listen {}", tag, listen)))?,
        };

        let settings = &config.settings;
        let address = settings
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::config(format!("inbound {}: settings.address is required", tag)))?;
        let port = settings
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| Error::config(format!("inbound {}: settings.port is required", tag)))?;
        let network = settings
            .get("network")
            .and_then(|v| v.as_str())
            .unwrap_or("tcp")
            .parse::<Network>()?;
        if network != Network::Tcp {
            return Err(Error::config(format!("inbound {}: only tcp is supported", tag)));
        }

        Ok(Inbound {
            tag,
            listen: SocketAddr::new(ip, config.port),
            target: Destination::new(network, Address::from(address), port),
        })
    }
}

/// Shared state of a running instance used by dials and relays
struct Dispatcher {
    outbound: Outbound,
    dialer: Arc<dyn SystemDialer>,
    stats: Option<Arc<TrafficStats>>,
}

impl Dispatcher {
    async fn dial(&self, dest: &Destination) -> Result<Box<dyn ProxyConnection>> {
        match self.outbound.kind {
            OutboundKind::Freedom => {
                let stream = self.dialer.dial(dest).await?.into_tcp()?;
                Ok(Box::new(stream))
            }
            OutboundKind::Blackhole => Err(Error::connection(format!(
                "{} blocked by outbound {}",
                dest, self.outbound.tag
            ))),
        }
    }

    async fn relay(&self, inbound: &Inbound, mut client: TcpStream) -> Result<()> {
        let mut upstream = self.dial(&inbound.target).await?;
        let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;

        if let Some(stats) = &self.stats {
            stats.add_traffic(INBOUND, &inbound.tag, up, down);
            stats.add_traffic(OUTBOUND, &self.outbound.tag, up, down);
        }
        debug!("[{}] relay to {} done: up={} down={}", inbound.tag, inbound.target, up, down);
        Ok(())
    }
}

/// Instance created by [`DirectCore`]
pub struct DirectInstance {
    inbounds: Vec<Inbound>,
    dispatcher: Arc<Dispatcher>,
    runtime: Mutex<Option<Runtime>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DirectInstance {
    pub fn new(config: CoreConfig, dialer: Arc<dyn SystemDialer>) -> Result<Self> {
        if config.outbounds.is_empty() {
            return Err(Error::config("at least one outbound is required"));
        }

        let inbounds = config
            .inbounds
            .iter()
            .enumerate()
            .map(|(i, c)| Inbound::from_config(i, c))
            .collect::<Result<Vec<_>>>()?;
        let outbounds = config
            .outbounds
            .iter()
            .enumerate()
            .map(|(i, c)| Outbound::from_config(i, c))
            .collect::<Result<Vec<_>>>()?;

        let mut tags = HashSet::new();
        for tag in inbounds.iter().map(|i| &i.tag).chain(outbounds.iter().map(|o| &o.tag)) {
            if !tags.insert(tag.as_str()) {
                return Err(Error::config(format!("duplicate tag: {}", tag)));
            }
        }

        let stats = config.stats_enabled().then(|| {
            let stats = TrafficStats::new();
            for inbound in &inbounds {
                stats.register_traffic(INBOUND, &inbound.tag);
            }
            for outbound in &outbounds {
                stats.register_traffic(OUTBOUND, &outbound.tag);
            }
            Arc::new(stats)
        });

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().clamp(1, 2))
            .enable_all()
            .thread_name("direct-core-worker")
            .build()?;

        let outbound = outbounds.into_iter().next().ok_or_else(|| Error::config("no outbound"))?;
        Ok(DirectInstance {
            inbounds,
            dispatcher: Arc::new(Dispatcher {
                outbound,
                dialer,
                stats,
            }),
            runtime: Mutex::new(Some(runtime)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn spawn_listeners(&self, runtime: &Runtime) -> Result<()> {
        for inbound in &self.inbounds {
            let std_listener = std::net::TcpListener::bind(inbound.listen).map_err(|e| {
                Error::connection(format!("failed to listen on {}: {}", inbound.listen, e))
            })?;
            std_listener.set_nonblocking(true)?;

            let _guard = runtime.enter();
            let listener = TcpListener::from_std(std_listener)?;
            info!("[{}] listening on {} -> {}", inbound.tag, inbound.listen, inbound.target);

            let inbound = Arc::new(inbound.clone());
            let dispatcher = self.dispatcher.clone();
            let task = runtime.spawn(accept_loop(listener, inbound, dispatcher));
            self.tasks.lock().push(task);
        }
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, inbound: Arc<Inbound>, dispatcher: Arc<Dispatcher>) {
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("[{}] accept error: {}", inbound.tag, e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let inbound = inbound.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.relay(&inbound, client).await {
                debug!("[{}] connection from {} ended: {}", inbound.tag, peer, e);
            }
        });
    }
}

#[async_trait]
impl CoreInstance for DirectInstance {
    fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let guard = self.runtime.lock();
        let runtime = guard.as_ref().ok_or_else(|| {
            self.started.store(false, Ordering::SeqCst);
            Error::connection("instance already closed")
        })?;

        if let Err(e) = self.spawn_listeners(runtime) {
            self.abort_tasks();
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.abort_tasks();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stats_manager(&self) -> Option<Arc<dyn StatsManager>> {
        self.dispatcher
            .stats
            .clone()
            .map(|s| s as Arc<dyn StatsManager>)
    }

    async fn dial(&self, dest: &Destination) -> Result<Box<dyn ProxyConnection>> {
        self.dispatcher.dial(dest).await
    }
}

impl Drop for DirectInstance {
    fn drop(&mut self) {
        self.abort_tasks();
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
