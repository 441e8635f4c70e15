//! Points: host-facing control of core instances
//!
//! # Components
//!
//! - `CoreController`: one instance, serialized start/stop, host notifications
//! - `InstanceTable`: many instances keyed by caller id, no notifications
//! - `VpnServiceSupport`: callbacks the host implements
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine: Arc<dyn CoreEngine> = Arc::new(DirectCore::new());
//! let point = CoreController::new(engine, Arc::new(host_support));
//!
//! point.start(&StartOptions::new("/data/config.json").with_tun_fd(fd))?;
//! let ms = point.measure_delay("")?;
//! point.stop();
//! ```

mod controller;
mod support;
mod table;

pub use controller::{CoreController, StartOptions};
pub use support::{LogOnlySupport, VpnServiceSupport, STATUS_CLOSED, STATUS_OK, STATUS_RUNNING};
pub use table::InstanceTable;
