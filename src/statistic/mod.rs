//! Traffic counters
//!
//! Named counters in the engine's `kind>>>tag>>>traffic>>>direction` form,
//! exposed to the binding through [`StatsManager`].

use crate::engine::StatsManager;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Uplink direction name
pub const UPLINK: &str = "uplink";

/// Downlink direction name
pub const DOWNLINK: &str = "downlink";

/// Build a traffic counter name, e.g. `outbound>>>direct>>>traffic>>>uplink`
pub fn counter_name(kind: &str, tag: &str, direction: &str) -> String {
    format!("{}>>>{}>>>traffic>>>{}", kind, tag, direction)
}

/// A single named counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> i64 {
        self.value.swap(0, Ordering::Relaxed)
    }
}

/// Registry of traffic counters
#[derive(Default)]
pub struct TrafficStats {
    counters: DashMap<String, Arc<Counter>>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter
    pub fn register(&self, name: &str) -> Arc<Counter> {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Counter::default()))
            .clone()
    }

    /// Register both directions for `kind>>>tag`
    pub fn register_traffic(&self, kind: &str, tag: &str) {
        self.register(&counter_name(kind, tag, UPLINK));
        self.register(&counter_name(kind, tag, DOWNLINK));
    }

    /// Add relayed bytes for `kind>>>tag`
    pub fn add_traffic(&self, kind: &str, tag: &str, uplink: u64, downlink: u64) {
        self.register(&counter_name(kind, tag, UPLINK)).add(uplink as i64);
        self.register(&counter_name(kind, tag, DOWNLINK)).add(downlink as i64);
    }

    pub fn get(&self, name: &str) -> Option<Arc<Counter>> {
        self.counters.get(name).map(|c| c.value().clone())
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl StatsManager for TrafficStats {
    fn query(&self, name: &str, reset: bool) -> Option<i64> {
        let counter = self.get(name)?;
        if reset {
            Some(counter.reset())
        } else {
            Some(counter.value())
        }
    }
}
