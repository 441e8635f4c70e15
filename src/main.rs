//! v2ray-point - desktop runner for the mobile binding
//!
//! Drives the same `CoreController` a VPN host would, with a host stand-in
//! that protects nothing and logs status notifications.

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Context;
use clap::Parser;
use libv2ray_mobile::config::load_config_file;
use libv2ray_mobile::delay::{delay_or_failed, DEFAULT_PROBE_URL};
use libv2ray_mobile::engine::{CoreEngine, DirectCore};
use libv2ray_mobile::env::CoreEnv;
use libv2ray_mobile::point::LogOnlySupport;
use libv2ray_mobile::{logging, CoreController, StartOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "v2ray-point")]
#[command(version)]
#[command(about = "Run a core instance through the mobile binding")]
struct Args {
    /// Path to the core configuration (JSON)
    #[arg(short = 'c', long = "config", default_value = "config.json")]
    config: PathBuf,

    /// Directory holding geo data and other assets
    #[arg(short = 'd', long = "asset-dir", default_value = "")]
    asset_dir: String,

    /// XUDP base key
    #[arg(long = "xudp-key", default_value = "")]
    xudp_key: String,

    /// TUN file descriptor handed to the core
    #[arg(long = "tun-fd")]
    tun_fd: Option<i32>,

    /// Probe latency after start (default probe URL when no value is given)
    #[arg(long = "delay", num_args = 0..=1, default_missing_value = DEFAULT_PROBE_URL)]
    delay: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();

    let mut core_env = CoreEnv::new(args.asset_dir.as_str(), args.xudp_key.as_str());
    if let Some(fd) = args.tun_fd {
        core_env = core_env.with_tun_fd(fd);
    }
    core_env.apply();
    let reader = Arc::new(core_env.asset_reader());

    let config = load_config_file(reader.as_ref(), &args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    logging::try_init(config.log.level().unwrap_or(Level::ERROR));

    let engine: Arc<dyn CoreEngine> = Arc::new(DirectCore::new());

    if args.test {
        let instance = engine.new_instance(config).context("configuration test failed")?;
        instance.close()?;
        info!("Configuration test passed");
        return Ok(());
    }

    let point = CoreController::new(engine, Arc::new(LogOnlySupport)).with_file_reader(reader);
    info!("{}", point.check_version());

    point.start(&StartOptions::new(&args.config))?;

    if let Some(url) = args.delay.as_deref() {
        let ms = delay_or_failed(point.measure_delay(url));
        info!("Delay {}: {}ms", url, ms);
    }

    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;

    info!("Interrupted, stopping");
    point.stop();
    Ok(())
}
