//! Keyed instance table ("simple" points)
//!
//! Several instances may run at once, each under a caller-chosen key. There
//! are no lifecycle notifications and no single-instance guarantee; the map
//! only guarantees one instance per key.

use crate::config::load_config_file;
use crate::engine::{CoreEngine, CoreInstance};
use crate::env::{FileReader, FsReader};
use crate::{Error, Phase, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InstanceTable {
    engine: Arc<dyn CoreEngine>,
    reader: Arc<dyn FileReader>,
    points: DashMap<i32, Arc<dyn CoreInstance>>,
}

impl InstanceTable {
    pub fn new(engine: Arc<dyn CoreEngine>) -> Self {
        Self::with_file_reader(engine, Arc::new(FsReader))
    }

    pub fn with_file_reader(engine: Arc<dyn CoreEngine>, reader: Arc<dyn FileReader>) -> Self {
        InstanceTable {
            engine,
            reader,
            points: DashMap::new(),
        }
    }

    /// Load, build and start an instance, then register it under `key`.
    ///
    /// If `key` is taken by the time the instance is up, the new instance is
    /// closed and `Error::AlreadyExists` is returned; the existing one stays.
    pub fn start(&self, config_path: &Path, key: i32) -> Result<()> {
        let config = load_config_file(self.reader.as_ref(), config_path)?;
        let instance = self
            .engine
            .new_instance(config)
            .map_err(|e| e.in_phase(Phase::CoreInit))?;

        if let Err(e) = instance.start() {
            if let Err(close_err) = instance.close() {
                warn!("Failed to release point {} after start failure: {}", key, close_err);
            }
            return Err(e.in_phase(Phase::Startup));
        }

        // Close outside the entry guard; it holds the shard lock
        let rejected = match self.points.entry(key) {
            Entry::Occupied(_) => Some(instance),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                None
            }
        };

        match rejected {
            Some(instance) => {
                if let Err(e) = instance.close() {
                    warn!("Failed to close rejected point {}: {}", key, e);
                }
                Err(Error::AlreadyExists(key))
            }
            None => {
                debug!("Point {} started", key);
                Ok(())
            }
        }
    }

    /// Remove and close the instance under `key`, if any
    pub fn stop(&self, key: i32) {
        if let Some((_, instance)) = self.points.remove(&key) {
            if let Err(e) = instance.close() {
                warn!("Point {} close returned error: {}", key, e);
            }
            debug!("Point {} stopped", key);
        }
    }

    pub fn contains(&self, key: i32) -> bool {
        self.points.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
