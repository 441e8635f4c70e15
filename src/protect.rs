//! Protected dialer
//!
//! Every socket the core opens is handed to the host before it connects, so
//! a VPN host can exclude it from its own tunnel. Without this the proxy's
//! upstream traffic would be captured by the TUN interface it serves.
//!
//! Dialing is split in two phases: create the socket, expose its descriptor
//! to [`SocketProtector::protect`], then connect.

use crate::common::net::{configure_tcp_stream, Destination, Network};
use crate::engine::{DialedConn, SystemDialer};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpSocket, UdpSocket};
use tracing::{debug, warn};

/// Host capability that exempts a socket from the VPN
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: i32) -> bool;
}

/// What to do when the host refuses to protect a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectPolicy {
    /// Log and connect anyway
    #[default]
    BestEffort,
    /// Abort the dial
    FailClosed,
}

/// Descriptors created but not yet connected
#[derive(Debug, Default)]
pub struct ProtectionRegistry {
    pending: DashSet<i32>,
}

impl ProtectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&self, fd: i32) -> PendingGuard<'_> {
        self.pending.insert(fd);
        PendingGuard { registry: self, fd }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct PendingGuard<'a> {
    registry: &'a ProtectionRegistry,
    fd: i32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.pending.remove(&self.fd);
    }
}

#[cfg(unix)]
fn socket_fd(socket: &Socket) -> Result<i32> {
    use std::os::fd::AsRawFd;
    Ok(socket.as_raw_fd())
}

#[cfg(windows)]
fn socket_fd(socket: &Socket) -> Result<i32> {
    use std::os::windows::io::AsRawSocket;
    narrow_handle(socket.as_raw_socket())
}

/// The host callback takes an `i32`; wider handles are refused
#[cfg(any(windows, test))]
fn narrow_handle(raw: u64) -> Result<i32> {
    i32::try_from(raw).map_err(|_| Error::protect(format!("socket handle {} does not fit in i32", raw)))
}

/// System dialer that protects every socket through the host
pub struct ProtectedDialer {
    protector: Arc<dyn SocketProtector>,
    policy: ProtectPolicy,
    registry: ProtectionRegistry,
}

impl ProtectedDialer {
    pub fn new(protector: Arc<dyn SocketProtector>) -> Self {
        Self::with_policy(protector, ProtectPolicy::default())
    }

    pub fn with_policy(protector: Arc<dyn SocketProtector>, policy: ProtectPolicy) -> Self {
        ProtectedDialer {
            protector,
            policy,
            registry: ProtectionRegistry::new(),
        }
    }

    pub fn policy(&self) -> ProtectPolicy {
        self.policy
    }

    pub fn registry(&self) -> &ProtectionRegistry {
        &self.registry
    }

    fn protect(&self, fd: i32) -> Result<()> {
        if self.protector.protect(fd) {
            debug!("Socket fd={} protected", fd);
            return Ok(());
        }
        match self.policy {
            ProtectPolicy::BestEffort => {
                warn!("Failed to protect socket fd={}, dialing anyway", fd);
                Ok(())
            }
            ProtectPolicy::FailClosed => Err(Error::protect(format!("host refused fd={}", fd))),
        }
    }

    async fn dial_tcp(&self, addr: SocketAddr) -> Result<DialedConn> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        let fd = socket_fd(&socket)?;
        let _pending = self.registry.track(fd);
        self.protect(fd)?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpSocket::from_std_stream(std_stream).connect(addr).await?;
        configure_tcp_stream(&stream);
        Ok(DialedConn::Tcp(stream))
    }

    fn dial_udp(&self, addr: SocketAddr) -> Result<DialedConn> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;

        let fd = socket_fd(&socket)?;
        let _pending = self.registry.track(fd);
        self.protect(fd)?;

        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        socket.bind(&SockAddr::from(bind))?;
        socket.connect(&SockAddr::from(addr))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(DialedConn::Udp(UdpSocket::from_std(std_socket)?))
    }
}

#[async_trait]
impl SystemDialer for ProtectedDialer {
    async fn dial(&self, dest: &Destination) -> Result<DialedConn> {
        let addrs = dest.resolve().await?;
        let mut last_err = None;

        for addr in addrs {
            let attempt = match dest.network {
                Network::Tcp => self.dial_tcp(addr).await,
                Network::Udp => self.dial_udp(addr),
            };
            match attempt {
                Ok(conn) => {
                    debug!("Dialed {} via {}", dest, addr);
                    return Ok(conn);
                }
                Err(e @ Error::Protect(_)) => return Err(e),
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
