//! Per-address advertising-cadence tracker.
//!
//! Learns how often each device advertises so the manager can tell a
//! device that went quiet from one that is simply slow, and can decide
//! when a history entry from another scanner is stale enough to replace.

use std::collections::HashMap;

use serde_json::json;
use shared::types::{MonotonicTime, ServiceInfo};

/// Samples kept per address. The interval is the minimum successive gap,
/// so a handful of samples is enough and old ones only add noise.
pub const ADVERTISING_TIMES_NEEDED: usize = 6;

#[derive(Debug, Default)]
pub struct AdvertisementTracker {
    /// Learned advertising interval per address.
    pub intervals: HashMap<String, f64>,
    /// Manager-supplied overrides used when nothing has been measured.
    pub fallback_intervals: HashMap<String, f64>,
    /// Which scanner the samples for each address came from.
    pub sources: HashMap<String, String>,
    timings: HashMap<String, Vec<MonotonicTime>>,
}

impl AdvertisementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one advertisement timestamp for its address.
    ///
    /// Keeps the last [`ADVERTISING_TIMES_NEEDED`] samples and, once two or
    /// more are present, stores the minimum successive gap as the learned
    /// interval.
    pub fn collect(&mut self, service_info: &ServiceInfo) {
        self.sources
            .insert(service_info.address.clone(), service_info.source.clone());
        let timings = self.timings.entry(service_info.address.clone()).or_default();
        timings.push(service_info.time);
        if timings.len() > ADVERTISING_TIMES_NEEDED {
            timings.remove(0);
        }
        if timings.len() < 2 {
            return;
        }
        let mut min_gap = timings[1] - timings[0];
        for pair in timings.windows(2).skip(1) {
            let gap = pair[1] - pair[0];
            if gap < min_gap {
                min_gap = gap;
            }
        }
        self.intervals.insert(service_info.address.clone(), min_gap);
    }

    /// [`collect`](Self::collect), but drop the sample when it would be
    /// attributed to a scanner that does not own the address.
    pub fn collect_if_authoritative(&mut self, service_info: &ServiceInfo) {
        if let Some(owner) = self.sources.get(&service_info.address) {
            if *owner != service_info.source {
                return;
            }
        }
        self.collect(service_info);
    }

    /// Forget everything about an address.
    pub fn remove_address(&mut self, address: &str) {
        self.intervals.remove(address);
        self.sources.remove(address);
        self.timings.remove(address);
    }

    pub fn remove_fallback_interval(&mut self, address: &str) {
        self.fallback_intervals.remove(address);
    }

    /// Forget every address attributed to a scanner that went away.
    pub fn remove_source(&mut self, source: &str) {
        let addresses: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, tracked)| tracked.as_str() == source)
            .map(|(address, _)| address.clone())
            .collect();
        for address in addresses {
            self.remove_address(&address);
        }
    }

    pub fn diagnostics(&self) -> serde_json::Value {
        json!({
            "intervals": self.intervals,
            "fallback_intervals": self.fallback_intervals,
            "sources": self.sources,
            "timings": self.timings,
        })
    }
}
