//! Core configuration (the engine's JSON dialect)
//!
//! Only the parts the binding and the direct core look at are typed; every
//! other key is kept in `extra` so full engine configs load unchanged.

use crate::env::FileReader;
use crate::{Error, Phase, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::Level;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub log: LogConfig,

    /// Present (even empty) when the statistics capability is wanted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,

    pub inbounds: Vec<InboundConfig>,

    pub outbounds: Vec<OutboundConfig>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Log section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub loglevel: String,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            loglevel: "warning".to_string(),
            extra: HashMap::new(),
        }
    }
}

impl LogConfig {
    /// Tracing level for `loglevel`; `None` for "none"
    pub fn level(&self) -> Option<Level> {
        match self.loglevel.to_lowercase().as_str() {
            "none" => None,
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "error" => Some(Level::ERROR),
            _ => Some(Level::WARN),
        }
    }
}

/// Inbound entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub listen: Option<String>,

    #[serde(default)]
    pub port: u16,

    pub protocol: String,

    #[serde(default)]
    pub settings: Value,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Outbound entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub tag: Option<String>,

    pub protocol: String,

    #[serde(default)]
    pub settings: Value,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CoreConfig {
    /// Parse from a string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(content)?;
        Ok(config)
    }

    /// Whether the statistics capability is enabled
    pub fn stats_enabled(&self) -> bool {
        self.stats.is_some()
    }
}

/// Parse a config from any reader
pub fn load_config<R: Read>(reader: R) -> Result<CoreConfig> {
    let config: CoreConfig = serde_json::from_reader(reader)?;
    Ok(config)
}

/// Open `path` through the file-reader hook and parse it.
/// Every failure is tagged as a config-load failure.
pub fn load_config_file(reader: &dyn FileReader, path: &Path) -> Result<CoreConfig> {
    let file = reader
        .open(path)
        .map_err(|e| Error::config_load(format!("{}: {}", path.display(), e)))?;
    load_config(file).map_err(|e| e.in_phase(Phase::ConfigLoad))
}
