//! Log sink setup
//!
//! Lines carry no timestamp: the Android log already stamps every line.

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber at `level` unless one is already set.
/// `RUST_LOG` takes precedence. Returns whether this call installed it.
pub fn try_init(level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            let level = level.as_str().to_lowercase();
            EnvFilter::new(format!("libv2ray_mobile={0},v2ray_point={0}", level))
        });

    tracing_subscriber::registry()
        .with(fmt::layer().without_time().with_target(false))
        .with(filter)
        .try_init()
        .is_ok()
}

pub fn try_init_default() -> bool {
    try_init(Level::INFO)
}
