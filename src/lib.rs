//! libv2ray-mobile - mobile binding layer for a proxy core
//!
//! Exposes lifecycle control of a core engine to a host application (an
//! Android VPN service):
//! - Start / stop of a single core instance with status callbacks
//! - Protected dialing (every outbound socket is offered to the host first)
//! - Keyed "simple" instances running side by side
//! - Latency probing through a running instance
//!
//! # Architecture
//!
//! ```text
//!            host (VpnService)
//!                  |
//!        +---------v----------+       +-----------------+
//!        |  point/ controller |------>|  config/ env/   |
//!        |  point/ table      |       +-----------------+
//!        +---------+----------+
//!                  |  CoreEngine / CoreInstance
//!        +---------v----------+       +-----------------+
//!        |      engine/       |------>|  statistic/     |
//!        |   (direct core)    |       +-----------------+
//!        +---------+----------+
//!                  |  SystemDialer
//!        +---------v----------+
//!        |      protect       |----> host.protect(fd)
//!        +--------------------+
//! ```

pub mod common;
pub mod config;
pub mod engine;
pub mod delay;
pub mod env;
pub mod logging;
pub mod point;
pub mod protect;
pub mod statistic;

pub use common::error::{Error, Phase, Result};
pub use config::CoreConfig;
pub use point::{CoreController, InstanceTable, StartOptions, VpnServiceSupport};
pub use protect::{ProtectPolicy, ProtectedDialer, SocketProtector};

/// Binding version reported by `check_version`
pub const LIB_VERSION: u32 = 27;

/// Version line for `engine` without a controller
pub fn check_version(engine: &dyn engine::CoreEngine) -> String {
    engine::version_line(LIB_VERSION, engine)
}
