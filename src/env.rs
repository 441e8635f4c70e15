//! Process environment for the core and the file-reader hook
//!
//! The core reads its asset location, XUDP base key and TUN descriptor from
//! environment variables. Files it opens (configs, geo data, certificates) go
//! through a [`FileReader`] so a host can serve them from its app bundle
//! when they are not on the filesystem.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Asset base path variable
pub const ASSET_LOCATION_ENV: &str = "xray.location.asset";

/// XUDP base key variable
pub const XUDP_BASE_KEY_ENV: &str = "xray.xudp.basekey";

/// TUN file descriptor variable
pub const TUN_FD_ENV: &str = "xray.tun.fd";

/// Environment values set once at process start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreEnv {
    pub asset_path: String,
    pub xudp_base_key: String,
    pub tun_fd: Option<i32>,
}

impl CoreEnv {
    pub fn new<A: Into<String>, K: Into<String>>(asset_path: A, xudp_base_key: K) -> Self {
        CoreEnv {
            asset_path: asset_path.into(),
            xudp_base_key: xudp_base_key.into(),
            tun_fd: None,
        }
    }

    pub fn with_tun_fd(mut self, fd: i32) -> Self {
        self.tun_fd = Some(fd);
        self
    }

    /// Publish non-empty values to the process environment
    pub fn apply(&self) {
        if !self.asset_path.is_empty() {
            std::env::set_var(ASSET_LOCATION_ENV, &self.asset_path);
            info!("Asset location: {}", self.asset_path);
        }
        if !self.xudp_base_key.is_empty() {
            std::env::set_var(XUDP_BASE_KEY_ENV, &self.xudp_base_key);
        }
        if let Some(fd) = self.tun_fd {
            set_tun_fd(fd);
        }
    }

    pub fn from_env() -> Self {
        CoreEnv {
            asset_path: std::env::var(ASSET_LOCATION_ENV).unwrap_or_default(),
            xudp_base_key: std::env::var(XUDP_BASE_KEY_ENV).unwrap_or_default(),
            tun_fd: tun_fd(),
        }
    }

    /// Asset reader serving from `asset_path` when a file is missing
    pub fn asset_reader(&self) -> AssetFallbackReader {
        AssetFallbackReader::new(Arc::new(DirAssetBundle::new(&self.asset_path)))
    }
}

/// Publish the TUN descriptor for the next start.
///
/// Not synchronized with other threads reading the environment; call it
/// before any instance runs.
pub fn set_tun_fd(fd: i32) {
    std::env::set_var(TUN_FD_ENV, fd.to_string());
}

pub fn clear_tun_fd() {
    std::env::remove_var(TUN_FD_ENV);
}

pub fn tun_fd() -> Option<i32> {
    std::env::var(TUN_FD_ENV).ok()?.parse().ok()
}

/// File-reader hook
pub trait FileReader: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;
}

/// Opens paths on the filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsReader;

impl FileReader for FsReader {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }
}

/// Named assets shipped inside the host application
pub trait AssetBundle: Send + Sync {
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Assets stored flat in a directory
#[derive(Debug, Clone)]
pub struct DirAssetBundle {
    root: PathBuf,
}

impl DirAssetBundle {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        DirAssetBundle {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl AssetBundle for DirAssetBundle {
    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.root.join(name))?))
    }
}

/// Opens existing files directly; missing paths fall back to the asset
/// bundle, looked up by base name
pub struct AssetFallbackReader {
    bundle: Arc<dyn AssetBundle>,
}

impl AssetFallbackReader {
    pub fn new(bundle: Arc<dyn AssetBundle>) -> Self {
        AssetFallbackReader { bundle }
    }
}

impl FileReader for AssetFallbackReader {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        if path.exists() {
            return Ok(Box::new(File::open(path)?));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))?;
        debug!("{} not on filesystem, opening asset {}", path.display(), name);
        self.bundle.open(name)
    }
}
