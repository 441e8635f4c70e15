//! Core engine capability interface
//!
//! The binding drives a proxy core through these traits only:
//!
//! ```text
//! +-----------------+  new_instance   +------------------+
//! |   CoreEngine    |---------------->|   CoreInstance   |
//! | register_dialer |                 | start / close    |
//! +--------+--------+                 | stats / dial     |
//!          |                          +--------+---------+
//!          v                                   |
//! +-----------------+      every outbound      |
//! |  SystemDialer   |<-------------------------+
//! +-----------------+
//! ```
//!
//! [`direct::DirectCore`] is the engine shipped with the crate.

pub mod direct;

use crate::common::net::{configure_tcp_stream, Destination, Network};
use crate::config::CoreConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

pub use direct::DirectCore;

/// Stream returned by an engine dial
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyConnection for T {}

/// Connection produced by a system dialer
#[derive(Debug)]
pub enum DialedConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DialedConn {
    pub fn network(&self) -> Network {
        match self {
            DialedConn::Tcp(_) => Network::Tcp,
            DialedConn::Udp(_) => Network::Udp,
        }
    }

    pub fn into_tcp(self) -> Result<TcpStream> {
        match self {
            DialedConn::Tcp(stream) => Ok(stream),
            DialedConn::Udp(_) => Err(Error::connection("expected a tcp connection, got udp")),
        }
    }

    pub fn into_udp(self) -> Result<UdpSocket> {
        match self {
            DialedConn::Udp(socket) => Ok(socket),
            DialedConn::Tcp(_) => Err(Error::connection("expected a udp socket, got tcp")),
        }
    }
}

/// Low-level connection establishment used by the engine for every outbound
#[async_trait]
pub trait SystemDialer: Send + Sync {
    async fn dial(&self, dest: &Destination) -> Result<DialedConn>;
}

/// Statistics capability of a running instance
pub trait StatsManager: Send + Sync {
    /// Read a counter by name, optionally resetting it. `None` when unknown.
    fn query(&self, name: &str, reset: bool) -> Option<i64>;
}

/// A constructed engine instance
#[async_trait]
pub trait CoreInstance: Send + Sync {
    fn start(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn stats_manager(&self) -> Option<Arc<dyn StatsManager>>;

    /// Open a connection to `dest` through the instance's outbound
    async fn dial(&self, dest: &Destination) -> Result<Box<dyn ProxyConnection>>;
}

/// Factory side of the core engine
pub trait CoreEngine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Replace the dialer used by instances created afterwards
    fn register_dialer(&self, dialer: Arc<dyn SystemDialer>);

    fn new_instance(&self, config: CoreConfig) -> Result<Arc<dyn CoreInstance>>;
}

/// Dialer that connects without any platform hook
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainDialer;

#[async_trait]
impl SystemDialer for PlainDialer {
    async fn dial(&self, dest: &Destination) -> Result<DialedConn> {
        let addrs = dest.resolve().await?;
        let mut last_err = None;

        for addr in addrs {
            let attempt = match dest.network {
                Network::Tcp => TcpStream::connect(addr).await.map(|stream| {
                    configure_tcp_stream(&stream);
                    DialedConn::Tcp(stream)
                }),
                Network::Udp => connect_udp(addr).await.map(DialedConn::Udp),
            };
            match attempt {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("Dial {} via {} failed: {}", dest, addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => Error::connection(format!("failed to dial {}: {}", dest, e)),
            None => Error::address(format!("no address to dial for {}", dest)),
        })
    }
}

async fn connect_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind: SocketAddr = match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    Ok(socket)
}

/// Binding version line: `Lib v27, <engine> v<version>`
pub fn version_line(lib_version: u32, engine: &dyn CoreEngine) -> String {
    format!("Lib v{}, {} v{}", lib_version, engine.name(), engine.version())
}
