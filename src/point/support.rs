//! Host-side capabilities the point calls back into

use crate::protect::SocketProtector;

/// Status code sent with every notification
pub const STATUS_OK: i32 = 0;

pub const STATUS_RUNNING: &str = "Running";

pub const STATUS_CLOSED: &str = "Closed";

/// Everything an Android VPN service provides to the point.
///
/// `prepare` and `setup` run after the core started, `shutdown` after it
/// stopped. Return codes other than 0 are logged, never acted upon.
pub trait VpnServiceSupport: SocketProtector {
    fn setup(&self, conf: &str) -> i32;

    fn prepare(&self) -> i32;

    fn shutdown(&self) -> i32;

    fn on_emit_status(&self, code: i32, message: &str) -> i32;
}

/// Host stand-in for desktop runs: protects nothing, logs statuses
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySupport;

impl SocketProtector for LogOnlySupport {
    fn protect(&self, _fd: i32) -> bool {
        true
    }
}

impl VpnServiceSupport for LogOnlySupport {
    fn setup(&self, _conf: &str) -> i32 {
        0
    }

    fn prepare(&self) -> i32 {
        0
    }

    fn shutdown(&self) -> i32 {
        0
    }

    fn on_emit_status(&self, code: i32, message: &str) -> i32 {
        tracing::info!("Status {}: {}", code, message);
        0
    }
}
