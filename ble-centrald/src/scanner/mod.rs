//! Scanner state shared by local radios and remote proxies.

pub mod adv_parser;
pub mod local;
pub mod remote;

use std::collections::HashMap;

use serde_json::json;
use shared::types::{
    AdvertisementData, DeviceHandle, MonotonicTime, ScanMode, ServiceInfo,
};

/// Score penalty per connection already in progress on the scanner.
pub const CONNECT_IN_PROGRESS_PENALTY: f64 = 2.0;
/// Score penalty per previous connect failure to the address.
pub const CONNECT_FAILURE_PENALTY: f64 = 0.5;

/// State every scanner carries: identity, mode, detection clock, the
/// per-source discovered table, and connection-slot bookkeeping.
#[derive(Debug)]
pub struct ScannerCore {
    pub source: String,
    pub adapter: String,
    pub name: String,
    pub connectable: bool,
    pub requested_mode: Option<ScanMode>,
    pub current_mode: Option<ScanMode>,
    pub scanning: bool,
    pub last_detection: MonotonicTime,
    pub start_time: MonotonicTime,
    connect_failures: HashMap<String, u32>,
    connect_in_progress: HashMap<String, MonotonicTime>,
    pub discovered: HashMap<String, ServiceInfo>,
}

impl ScannerCore {
    pub fn new(
        source: impl Into<String>,
        adapter: impl Into<String>,
        connectable: bool,
        requested_mode: Option<ScanMode>,
    ) -> Self {
        let source = source.into();
        let adapter = adapter.into();
        let name = if adapter == source {
            source.clone()
        } else {
            format!("{adapter} ({source})")
        };
        Self {
            source,
            adapter,
            name,
            connectable,
            requested_mode,
            current_mode: None,
            scanning: true,
            last_detection: 0.0,
            start_time: 0.0,
            connect_failures: HashMap::new(),
            connect_in_progress: HashMap::new(),
            discovered: HashMap::new(),
        }
    }

    pub fn time_since_last_detection(&self, now: MonotonicTime) -> f64 {
        now - self.last_detection
    }

    /// Number of GATT connection attempts currently holding a slot.
    pub fn connections_in_progress(&self) -> usize {
        self.connect_in_progress.len()
    }

    pub fn connection_failures(&self, address: &str) -> u32 {
        self.connect_failures.get(address).copied().unwrap_or(0)
    }

    /// Mark a connection attempt as started.
    pub fn add_connecting(&mut self, address: &str, now: MonotonicTime) {
        if self
            .connect_in_progress
            .insert(address.to_string(), now)
            .is_some()
        {
            tracing::warn!(
                scanner = %self.name,
                address,
                "connection already marked in progress"
            );
        }
        self.scanning = self.connect_in_progress.is_empty();
    }

    /// Mark a connection attempt as finished, recording the outcome.
    ///
    /// A successful connection clears the address's failure count; a failed
    /// one increments it.
    pub fn finished_connecting(&mut self, address: &str, connected: bool) {
        if self.connect_in_progress.remove(address).is_none() {
            tracing::warn!(
                scanner = %self.name,
                address,
                "finishing a connection that was never in progress"
            );
        }
        if connected {
            self.connect_failures.remove(address);
        } else {
            *self.connect_failures.entry(address.to_string()).or_insert(0) += 1;
        }
        self.scanning = self.connect_in_progress.is_empty();
    }

    /// Addresses with a connection attempt currently holding a slot.
    pub fn in_progress_addresses(&self) -> std::collections::HashSet<String> {
        self.connect_in_progress.keys().cloned().collect()
    }

    pub fn clear_connection_history(&mut self) {
        self.connect_failures.clear();
        self.connect_in_progress.clear();
        self.scanning = true;
    }

    /// Score this scanner as a connection path for `address`.
    ///
    /// `rssi_diff` is the caller-computed signal advantage; busier or
    /// historically failing scanners score lower and the higher score wins.
    pub fn score_connection_path(&self, rssi_diff: f64, address: &str) -> f64 {
        rssi_diff
            - CONNECT_IN_PROGRESS_PENALTY * self.connect_in_progress.len() as f64
            - CONNECT_FAILURE_PENALTY * f64::from(self.connection_failures(address))
    }

    /// Record an advertisement in this scanner's discovered table and bump
    /// the detection clock.
    pub fn record_discovery(&mut self, info: ServiceInfo) {
        debug_assert_eq!(info.source, self.source);
        self.last_detection = info.time;
        self.discovered.insert(info.address.clone(), info);
    }

    pub fn get_discovered_device_advertisement_data(
        &self,
        address: &str,
    ) -> Option<(DeviceHandle, AdvertisementData)> {
        self.discovered
            .get(address)
            .map(|info| (info.device.clone(), info.advertisement().clone()))
    }

    pub fn discovered_addresses(&self) -> impl Iterator<Item = &str> {
        self.discovered.keys().map(String::as_str)
    }

    pub fn diagnostics(&self, now: MonotonicTime) -> serde_json::Value {
        json!({
            "name": self.name,
            "source": self.source,
            "adapter": self.adapter,
            "connectable": self.connectable,
            "scanning": self.scanning,
            "requested_mode": self.requested_mode,
            "current_mode": self.current_mode,
            "start_time": self.start_time,
            "last_detection": self.last_detection,
            "time_since_last_detection": self.time_since_last_detection(now),
            "connections_in_progress": self.connections_in_progress(),
            "discovered_count": self.discovered.len(),
        })
    }
}

/// A registered scanner of either flavour.
#[derive(Debug)]
pub enum Scanner {
    Remote(remote::RemoteScanner),
    Local(local::LocalScanner),
}

impl Scanner {
    pub fn core(&self) -> &ScannerCore {
        match self {
            Scanner::Remote(scanner) => &scanner.core,
            Scanner::Local(scanner) => &scanner.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut ScannerCore {
        match self {
            Scanner::Remote(scanner) => &mut scanner.core,
            Scanner::Local(scanner) => &mut scanner.core,
        }
    }

    pub fn as_remote_mut(&mut self) -> Option<&mut remote::RemoteScanner> {
        match self {
            Scanner::Remote(scanner) => Some(scanner),
            Scanner::Local(_) => None,
        }
    }

    pub fn as_local_mut(&mut self) -> Option<&mut local::LocalScanner> {
        match self {
            Scanner::Remote(_) => None,
            Scanner::Local(scanner) => Some(scanner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn core() -> ScannerCore {
        ScannerCore::new("hci0", "hci0", true, Some(ScanMode::Active))
    }

    fn adv(address: &str, time: f64) -> ServiceInfo {
        ServiceInfo::new(
            None,
            address.into(),
            -60,
            Map::new(),
            Map::new(),
            vec![],
            "hci0".into(),
            DeviceHandle::new(address, None),
            None,
            true,
            time,
            None,
        )
    }

    #[test]
    fn slot_bookkeeping_stays_consistent() {
        let mut scanner = core();
        scanner.add_connecting(ADDR, 10.0);
        scanner.add_connecting("AA:BB:CC:DD:EE:02", 10.5);
        assert_eq!(scanner.connections_in_progress(), 2);
        assert!(!scanner.scanning);

        scanner.finished_connecting(ADDR, false);
        assert_eq!(scanner.connections_in_progress(), 1);
        assert_eq!(scanner.connection_failures(ADDR), 1);

        scanner.finished_connecting("AA:BB:CC:DD:EE:02", true);
        assert_eq!(scanner.connections_in_progress(), 0);
        assert!(scanner.scanning);
    }

    #[test]
    fn success_clears_failure_count() {
        let mut scanner = core();
        scanner.add_connecting(ADDR, 1.0);
        scanner.finished_connecting(ADDR, false);
        scanner.add_connecting(ADDR, 2.0);
        scanner.finished_connecting(ADDR, false);
        assert_eq!(scanner.connection_failures(ADDR), 2);

        scanner.add_connecting(ADDR, 3.0);
        scanner.finished_connecting(ADDR, true);
        assert_eq!(scanner.connection_failures(ADDR), 0);
    }

    #[test]
    fn clear_connection_history_resets_everything() {
        let mut scanner = core();
        scanner.add_connecting(ADDR, 1.0);
        scanner.finished_connecting(ADDR, false);
        scanner.add_connecting(ADDR, 2.0);
        scanner.clear_connection_history();
        assert_eq!(scanner.connections_in_progress(), 0);
        assert_eq!(scanner.connection_failures(ADDR), 0);
        assert!(scanner.scanning);
    }

    #[test]
    fn score_penalises_busy_and_failing_paths() {
        let mut scanner = core();
        assert_eq!(scanner.score_connection_path(10.0, ADDR), 10.0);

        scanner.add_connecting("AA:BB:CC:DD:EE:02", 1.0);
        assert_eq!(scanner.score_connection_path(10.0, ADDR), 8.0);

        scanner.finished_connecting("AA:BB:CC:DD:EE:02", false);
        scanner.add_connecting(ADDR, 2.0);
        scanner.finished_connecting(ADDR, false);
        // One failure for ADDR and one for EE:02; only ADDR's counts here.
        assert_eq!(scanner.score_connection_path(10.0, ADDR), 9.5);
    }

    #[test]
    fn record_discovery_updates_clock_and_table() {
        let mut scanner = core();
        scanner.record_discovery(adv(ADDR, 42.0));
        assert_eq!(scanner.last_detection, 42.0);
        assert_eq!(scanner.time_since_last_detection(50.0), 8.0);
        let (device, advertisement) = scanner
            .get_discovered_device_advertisement_data(ADDR)
            .unwrap();
        assert_eq!(device.address, ADDR);
        assert_eq!(advertisement.rssi, -60);
    }
}
