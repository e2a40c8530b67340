//! Multi-scanner fan-in: source selection, merge history, subscriber
//! dispatch, unavailable tracking, and connection-slot accounting.
//!
//! The manager is single-owner state: every mutation happens from the loop
//! that owns it (see `central`). Scanner tasks and transports marshal
//! their events onto that loop instead of touching the manager directly.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use shared::types::{
    AdvertisementData, DeviceHandle, MonotonicTime, ScannerRegistrationEvent, ServiceInfo,
    SlotAllocations,
};

use crate::config::{ManagerConfig, ScannerConfig};
use crate::error::{BleError, Result};
use crate::mgmt::codec::MgmtEvent;
use crate::scanner::adv_parser::parse_advertisement_bytes;
use crate::scanner::local::StartOutcome;
use crate::scanner::{Scanner, ScannerCore};
use crate::tracker::AdvertisementTracker;

/// A device whose advertisements stopped is never considered gone sooner
/// than this, however short its measured interval.
pub const FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 60.0;

/// RSSI stand-in when a transport reported none.
pub const NO_RSSI_VALUE: i8 = -127;

const APPLE_MFR_ID: u16 = 0x004C;

pub type SubscriberCallback = Box<dyn Fn(&DeviceHandle, &AdvertisementData) + Send>;
pub type UnavailableCallback = Box<dyn Fn(&ServiceInfo) + Send>;
pub type DisappearedCallback = Box<dyn Fn(&str) + Send>;
pub type AllocationCallback = Box<dyn Fn(&SlotAllocations) + Send>;
pub type RegistrationCallback = Box<dyn Fn(&str, ScannerRegistrationEvent) + Send>;

/// Subscriber filters; an empty filter set matches everything.
#[derive(Debug, Clone, Default)]
pub struct CallbackFilters {
    pub uuids: Option<HashSet<Uuid>>,
}

impl CallbackFilters {
    pub fn for_uuids(uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuids: Some(uuids.into_iter().collect()),
        }
    }

    fn matches(&self, service_uuids: &[Uuid]) -> bool {
        match &self.uuids {
            None => true,
            Some(wanted) => service_uuids.iter().any(|uuid| wanted.contains(uuid)),
        }
    }
}

struct RegisteredScanner {
    scanner: Scanner,
    seq: u64,
}

pub struct BluetoothManager {
    config: ManagerConfig,
    scanner_config: ScannerConfig,
    tracker: AdvertisementTracker,
    all_history: HashMap<String, ServiceInfo>,
    connectable_history: HashMap<String, ServiceInfo>,
    sources: HashMap<String, RegisteredScanner>,
    connectable_sources: HashSet<String>,
    non_connectable_sources: HashSet<String>,
    adapter_sources: HashMap<String, String>,
    /// controller index on the management channel -> scanner source
    controllers: HashMap<u16, String>,
    allocations: HashMap<String, SlotAllocations>,
    dirty_allocations: HashSet<String>,
    subscriber_callbacks: HashMap<u64, (SubscriberCallback, CallbackFilters)>,
    unavailable_callbacks: HashMap<String, HashMap<u64, UnavailableCallback>>,
    connectable_unavailable_callbacks: HashMap<String, HashMap<u64, UnavailableCallback>>,
    disappeared_callbacks: HashMap<u64, DisappearedCallback>,
    allocation_callbacks: HashMap<Option<String>, HashMap<u64, AllocationCallback>>,
    registration_callbacks: HashMap<u64, RegistrationCallback>,
    next_callback_id: u64,
    next_scanner_seq: u64,
    recovery_lock: Arc<Mutex<()>>,
}

impl BluetoothManager {
    pub fn new(config: ManagerConfig, scanner_config: ScannerConfig) -> Self {
        Self {
            config,
            scanner_config,
            tracker: AdvertisementTracker::new(),
            all_history: HashMap::new(),
            connectable_history: HashMap::new(),
            sources: HashMap::new(),
            connectable_sources: HashSet::new(),
            non_connectable_sources: HashSet::new(),
            adapter_sources: HashMap::new(),
            controllers: HashMap::new(),
            allocations: HashMap::new(),
            dirty_allocations: HashSet::new(),
            subscriber_callbacks: HashMap::new(),
            unavailable_callbacks: HashMap::new(),
            connectable_unavailable_callbacks: HashMap::new(),
            disappeared_callbacks: HashMap::new(),
            allocation_callbacks: HashMap::new(),
            registration_callbacks: HashMap::new(),
            next_callback_id: 0,
            next_scanner_seq: 0,
            recovery_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn scanner_config(&self) -> &ScannerConfig {
        &self.scanner_config
    }

    fn next_id(&mut self) -> u64 {
        self.next_callback_id += 1;
        self.next_callback_id
    }

    // ----- scanner registration ---------------------------------------

    /// Register a scanner, returning its source id.
    ///
    /// Declaring `connection_slots` makes the scanner's adapter eligible
    /// for slot-allocation tracking and notifications.
    pub fn register_scanner(
        &mut self,
        mut scanner: Scanner,
        connection_slots: Option<usize>,
    ) -> String {
        let source = scanner.core().source.clone();
        let adapter = scanner.core().adapter.clone();
        let connectable = scanner.core().connectable;
        tracing::debug!(%source, %adapter, connectable, "registering scanner");

        scanner.core_mut().clear_connection_history();
        if connectable {
            self.connectable_sources.insert(source.clone());
        } else {
            self.non_connectable_sources.insert(source.clone());
        }
        self.adapter_sources.insert(adapter.clone(), source.clone());
        if let Some(slots) = connection_slots {
            self.allocations.insert(
                adapter.clone(),
                SlotAllocations {
                    adapter: adapter.clone(),
                    slots,
                    free: slots,
                    allocated: HashSet::new(),
                },
            );
            self.dirty_allocations.insert(adapter);
        }
        self.next_scanner_seq += 1;
        self.sources.insert(
            source.clone(),
            RegisteredScanner {
                scanner,
                seq: self.next_scanner_seq,
            },
        );
        self.fire_registration(&source, ScannerRegistrationEvent::Added);
        source
    }

    /// Unregister a scanner and re-elect an owner for every address it
    /// held in history.
    pub fn unregister_scanner(&mut self, source: &str) {
        let Some(entry) = self.sources.remove(source) else {
            return;
        };
        tracing::debug!(%source, "unregistering scanner");
        let core = entry.scanner.core();
        let adapter = core.adapter.clone();
        let discovered: Vec<String> = core.discovered.keys().cloned().collect();

        self.connectable_sources.remove(source);
        self.non_connectable_sources.remove(source);
        self.adapter_sources.remove(&adapter);
        self.allocations.remove(&adapter);
        self.dirty_allocations.remove(&adapter);
        self.controllers.retain(|_, s| s != source);
        self.tracker.remove_source(source);
        self.connectable_history
            .retain(|_, info| info.source != source);

        for address in discovered {
            let owned = self
                .all_history
                .get(&address)
                .is_some_and(|info| info.source == source);
            if !owned {
                continue;
            }
            self.all_history.remove(&address);
            // Let the surviving scanners compete for the address again.
            let candidates: Vec<ServiceInfo> = self
                .sources
                .values()
                .filter_map(|entry| entry.scanner.core().discovered.get(&address).cloned())
                .collect();
            for candidate in candidates {
                self.scanner_adv_received(candidate);
            }
        }
        self.fire_registration(source, ScannerRegistrationEvent::Removed);
    }

    fn fire_registration(&self, source: &str, event: ScannerRegistrationEvent) {
        for callback in self.registration_callbacks.values() {
            if catch_unwind(AssertUnwindSafe(|| callback(source, event))).is_err() {
                tracing::error!(%source, "scanner registration callback panicked");
            }
        }
    }

    /// Bind a management-channel controller index to a registered source.
    pub fn attach_controller(&mut self, controller_idx: u16, source: impl Into<String>) {
        self.controllers.insert(controller_idx, source.into());
    }

    // ----- advertisement fan-in ---------------------------------------

    /// Remote scanner direct intake, then fan-in.
    #[allow(clippy::too_many_arguments)]
    pub fn remote_advertisement(
        &mut self,
        source: &str,
        address: &str,
        rssi: i8,
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
        service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        tx_power: Option<i8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    ) {
        let Some(info) = self
            .sources
            .get_mut(source)
            .and_then(|entry| entry.scanner.as_remote_mut())
            .map(|remote| {
                remote.on_advertisement(
                    address,
                    rssi,
                    local_name,
                    service_uuids,
                    service_data,
                    manufacturer_data,
                    tx_power,
                    details,
                    time,
                )
            })
        else {
            tracing::warn!(%source, "advertisement from unknown remote scanner");
            return;
        };
        self.scanner_adv_received(info);
    }

    /// Remote scanner raw intake, then fan-in.
    pub fn remote_raw_advertisement(
        &mut self,
        source: &str,
        address: &str,
        rssi: i8,
        raw: Vec<u8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    ) {
        let Some(info) = self
            .sources
            .get_mut(source)
            .and_then(|entry| entry.scanner.as_remote_mut())
            .map(|remote| remote.on_raw_advertisement(address, rssi, raw, details, time))
        else {
            tracing::warn!(%source, "raw advertisement from unknown remote scanner");
            return;
        };
        self.scanner_adv_received(info);
    }

    /// Local scanner detection path, then fan-in.
    #[allow(clippy::too_many_arguments)]
    pub fn local_detection(
        &mut self,
        source: &str,
        address: &str,
        rssi: i8,
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
        service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        tx_power: Option<i8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
        raw: Option<Vec<u8>>,
    ) {
        let Some(info) = self
            .sources
            .get_mut(source)
            .and_then(|entry| entry.scanner.as_local_mut())
            .map(|local| {
                local.on_detection(
                    address,
                    rssi,
                    local_name,
                    service_uuids,
                    service_data,
                    manufacturer_data,
                    tx_power,
                    details,
                    time,
                    raw,
                )
            })
        else {
            tracing::warn!(%source, "detection from unknown local scanner");
            return;
        };
        self.scanner_adv_received(info);
    }

    /// Stale horizon for an address: the measured or fallback interval,
    /// floored at the maximum-stale constant, plus buffering wobble.
    pub fn stale_seconds(&self, address: &str) -> f64 {
        let base = self
            .tracker
            .intervals
            .get(address)
            .or_else(|| self.tracker.fallback_intervals.get(address))
            .copied()
            .unwrap_or(self.config.default_stale_seconds);
        base.max(FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS) + self.config.tracker_wobble_seconds
    }

    /// Whether the old advertisement from a different source should be
    /// kept over the new one.
    fn prefer_previous_adv_from_different_source(
        &self,
        old: &ServiceInfo,
        new: &ServiceInfo,
    ) -> bool {
        let Some(owner) = self.sources.get(&old.source) else {
            // The old source is gone; any live advertisement wins.
            return false;
        };
        if !owner.scanner.core().scanning {
            return false;
        }
        if new.time - old.time > self.stale_seconds(&new.address) {
            tracing::debug!(
                address = %new.address,
                old_source = %old.source,
                new_source = %new.source,
                "switching source: old advertisement is stale"
            );
            return false;
        }
        if i16::from(new.rssi) - i16::from(old.rssi) >= self.config.rssi_switch_threshold {
            tracing::debug!(
                address = %new.address,
                old_source = %old.source,
                new_source = %new.source,
                new_rssi = new.rssi,
                old_rssi = old.rssi,
                "switching source: signal is significantly better"
            );
            return false;
        }
        true
    }

    /// Advertisements from every scanner arrive here.
    pub fn scanner_adv_received(&mut self, info: ServiceInfo) {
        let address = info.address.clone();
        let had_connectable = self.connectable_history.contains_key(&address);
        let old_info = self.all_history.get(&address).cloned();

        if let Some(old) = &old_info {
            if old.source != info.source
                && self.prefer_previous_adv_from_different_source(old, &info)
            {
                // The new advertisement loses overall, but a connectable
                // observation may still be the best connectable path.
                if info.connectable {
                    let keep_old_connectable = match self.connectable_history.get(&address) {
                        None => false,
                        Some(old_conn) if old_conn.source == old.source => true,
                        Some(old_conn) => {
                            old_conn.source != info.source
                                && self
                                    .prefer_previous_adv_from_different_source(old_conn, &info)
                        }
                    };
                    if !keep_old_connectable {
                        self.connectable_history.insert(address, info);
                    }
                }
                return;
            }
        }

        if info.connectable {
            self.connectable_history
                .insert(address.clone(), info.clone());
        }
        self.all_history.insert(address.clone(), info.clone());

        // Interval tracking follows the authoritative source only.
        if self
            .tracker
            .sources
            .get(&address)
            .is_some_and(|owner| *owner != info.source)
        {
            self.tracker.remove_address(&address);
        }
        self.tracker.collect(&info);

        // Same source re-advertising the same payload: history is fresh,
        // subscribers learn nothing new. A connectable device missing from
        // connectable history still goes through so it becomes reachable
        // again after an unavailable cycle.
        if let Some(old) = &old_info {
            if old.source == info.source
                && info.same_payload(old)
                && !(info.connectable && !had_connectable)
            {
                return;
            }
        }

        if self.apple_noise(&info) {
            return;
        }

        let dispatch_info = if !info.connectable && had_connectable {
            // A connectable path exists, so consumers may connect even
            // though this observation was passive.
            info.to_connectable()
        } else {
            info
        };
        self.dispatch_to_subscribers(&dispatch_info);
    }

    /// Apple traffic is noisy; only a handful of type bytes are worth
    /// waking subscribers for. History is updated regardless.
    fn apple_noise(&self, info: &ServiceInfo) -> bool {
        if !info.service_data.is_empty() || info.manufacturer_data.len() != 1 {
            return false;
        }
        let Some(payload) = info.manufacturer_data.get(&APPLE_MFR_ID) else {
            return false;
        };
        match payload.first() {
            Some(first) => !self.config.apple_allowed_first_bytes.contains(first),
            None => true,
        }
    }

    fn dispatch_to_subscribers(&self, info: &ServiceInfo) {
        if self.subscriber_callbacks.is_empty() {
            // Skip materialising the advertisement entirely.
            return;
        }
        let advertisement = info.advertisement();
        for (callback, filters) in self.subscriber_callbacks.values() {
            if !filters.matches(&info.service_uuids) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(&info.device, advertisement))).is_err() {
                tracing::error!(
                    address = %info.address,
                    error = %BleError::CallbackFailure("panic in subscriber".into()),
                    "subscriber callback failed"
                );
            }
        }
    }

    // ----- subscriber registries --------------------------------------

    /// Register a subscriber; connectable history is replayed so devices
    /// discovered before registration are not missed.
    pub fn register_callback(
        &mut self,
        callback: SubscriberCallback,
        filters: CallbackFilters,
    ) -> u64 {
        for info in self.connectable_history.values() {
            if !filters.matches(&info.service_uuids) {
                continue;
            }
            let advertisement = info.advertisement();
            if catch_unwind(AssertUnwindSafe(|| callback(&info.device, advertisement))).is_err() {
                tracing::error!(address = %info.address, "subscriber callback failed during replay");
            }
        }
        let id = self.next_id();
        self.subscriber_callbacks.insert(id, (callback, filters));
        id
    }

    pub fn unregister_callback(&mut self, id: u64) {
        self.subscriber_callbacks.remove(&id);
    }

    pub fn register_unavailable_callback(
        &mut self,
        address: &str,
        connectable: bool,
        callback: UnavailableCallback,
    ) -> u64 {
        let id = self.next_id();
        let registry = if connectable {
            &mut self.connectable_unavailable_callbacks
        } else {
            &mut self.unavailable_callbacks
        };
        registry
            .entry(address.to_string())
            .or_default()
            .insert(id, callback);
        id
    }

    pub fn unregister_unavailable_callback(&mut self, address: &str, connectable: bool, id: u64) {
        let registry = if connectable {
            &mut self.connectable_unavailable_callbacks
        } else {
            &mut self.unavailable_callbacks
        };
        if let Some(callbacks) = registry.get_mut(address) {
            callbacks.remove(&id);
            if callbacks.is_empty() {
                registry.remove(address);
            }
        }
    }

    pub fn register_disappeared_callback(&mut self, callback: DisappearedCallback) -> u64 {
        let id = self.next_id();
        self.disappeared_callbacks.insert(id, callback);
        id
    }

    pub fn unregister_disappeared_callback(&mut self, id: u64) {
        self.disappeared_callbacks.remove(&id);
    }

    /// `adapter = None` subscribes to every adapter's changes.
    pub fn register_allocation_callback(
        &mut self,
        adapter: Option<String>,
        callback: AllocationCallback,
    ) -> u64 {
        let id = self.next_id();
        self.allocation_callbacks
            .entry(adapter)
            .or_default()
            .insert(id, callback);
        id
    }

    pub fn unregister_allocation_callback(&mut self, adapter: Option<String>, id: u64) {
        if let Some(callbacks) = self.allocation_callbacks.get_mut(&adapter) {
            callbacks.remove(&id);
            if callbacks.is_empty() {
                self.allocation_callbacks.remove(&adapter);
            }
        }
    }

    pub fn register_scanner_registration_callback(
        &mut self,
        callback: RegistrationCallback,
    ) -> u64 {
        let id = self.next_id();
        self.registration_callbacks.insert(id, callback);
        id
    }

    pub fn unregister_scanner_registration_callback(&mut self, id: u64) {
        self.registration_callbacks.remove(&id);
    }

    // ----- unavailable tracking ---------------------------------------

    /// Effective expiry for an address; same shape as [`stale_seconds`].
    pub fn effective_expiry(&self, address: &str) -> f64 {
        self.stale_seconds(address)
    }

    fn discovered_addresses(&self, connectable: bool) -> HashSet<String> {
        let mut addresses = HashSet::new();
        for (source, entry) in &self.sources {
            if connectable && !self.connectable_sources.contains(source) {
                continue;
            }
            addresses.extend(entry.scanner.core().discovered.keys().cloned());
        }
        addresses
    }

    /// One sweep of the unavailable tracker.
    ///
    /// Connectable entries disappear as soon as no connectable scanner
    /// still reports them; non-connectable availability can only be judged
    /// by silence, so those wait out the effective expiry first. Evicting
    /// twice in a row is a no-op.
    pub fn check_unavailable(&mut self, now: MonotonicTime) {
        let mut unavailable: Vec<(ServiceInfo, bool)> = Vec::new();
        let mut disappeared: Vec<String> = Vec::new();

        let discovered = self.discovered_addresses(true);
        let evict: Vec<String> = self
            .connectable_history
            .keys()
            .filter(|address| !discovered.contains(*address))
            .cloned()
            .collect();
        for address in evict {
            if let Some(info) = self.connectable_history.remove(&address) {
                unavailable.push((info, true));
            }
        }

        let discovered = self.discovered_addresses(false);
        let evict: Vec<String> = self
            .all_history
            .iter()
            .filter_map(|(address, info)| {
                if discovered.contains(address) {
                    return None;
                }
                let source_gone = !self.sources.contains_key(&info.source);
                if !source_gone && now - info.time <= self.effective_expiry(address) {
                    return None;
                }
                Some(address.clone())
            })
            .collect();
        for address in evict {
            self.tracker.remove_fallback_interval(&address);
            self.tracker.remove_address(&address);
            self.connectable_history.remove(&address);
            disappeared.push(address.clone());
            if let Some(info) = self.all_history.remove(&address) {
                unavailable.push((info, false));
            }
        }

        for address in &disappeared {
            for callback in self.disappeared_callbacks.values() {
                if catch_unwind(AssertUnwindSafe(|| callback(address))).is_err() {
                    tracing::error!(%address, "disappeared callback panicked");
                }
            }
        }
        for (info, connectable) in unavailable {
            let registry = if connectable {
                &self.connectable_unavailable_callbacks
            } else {
                &self.unavailable_callbacks
            };
            let Some(callbacks) = registry.get(&info.address) else {
                continue;
            };
            for callback in callbacks.values() {
                if catch_unwind(AssertUnwindSafe(|| callback(&info))).is_err() {
                    tracing::error!(address = %info.address, "unavailable callback panicked");
                }
            }
        }
    }

    // ----- connection slots -------------------------------------------

    pub fn add_connecting(&mut self, source: &str, address: &str, now: MonotonicTime) {
        let Some(entry) = self.sources.get_mut(source) else {
            return;
        };
        entry.scanner.core_mut().add_connecting(address, now);
        let adapter = entry.scanner.core().adapter.clone();
        self.recompute_allocations(&adapter);
    }

    pub fn finished_connecting(&mut self, source: &str, address: &str, connected: bool) {
        let Some(entry) = self.sources.get_mut(source) else {
            return;
        };
        entry.scanner.core_mut().finished_connecting(address, connected);
        let adapter = entry.scanner.core().adapter.clone();
        self.recompute_allocations(&adapter);
    }

    fn recompute_allocations(&mut self, adapter: &str) {
        let Some(source) = self.adapter_sources.get(adapter) else {
            return;
        };
        let Some(entry) = self.sources.get(source) else {
            return;
        };
        let allocated = entry.scanner.core().in_progress_addresses();
        let Some(alloc) = self.allocations.get_mut(adapter) else {
            return;
        };
        alloc.free = alloc.slots.saturating_sub(allocated.len());
        alloc.allocated = allocated;
        self.dirty_allocations.insert(adapter.to_string());
    }

    /// The kernel's view of which devices hold connections on an adapter.
    pub fn apply_connections_report(&mut self, controller_idx: u16, addresses: Vec<String>) {
        let Some(source) = self.controllers.get(&controller_idx) else {
            return;
        };
        let Some(entry) = self.sources.get(source) else {
            return;
        };
        let adapter = entry.scanner.core().adapter.clone();
        let Some(alloc) = self.allocations.get_mut(&adapter) else {
            return;
        };
        alloc.allocated = addresses.into_iter().collect();
        alloc.free = alloc.slots.saturating_sub(alloc.allocated.len());
        self.dirty_allocations.insert(adapter);
    }

    /// Fire one coalesced notification per dirty adapter.
    ///
    /// The owning loop calls this once per iteration, after the current
    /// burst of events has drained, so N slot changes in one tick yield
    /// one callback with the final state.
    pub fn flush_allocation_notifications(&mut self) {
        if self.dirty_allocations.is_empty() {
            return;
        }
        let dirty: Vec<String> = self.dirty_allocations.drain().collect();
        for adapter in dirty {
            let Some(snapshot) = self.allocations.get(&adapter).cloned() else {
                continue;
            };
            for key in [Some(adapter.clone()), None] {
                let Some(callbacks) = self.allocation_callbacks.get(&key) else {
                    continue;
                };
                for callback in callbacks.values() {
                    if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                        tracing::error!(%adapter, "allocation callback panicked");
                    }
                }
            }
        }
    }

    // ----- management events ------------------------------------------

    /// Route a decoded management event into the core.
    pub fn apply_mgmt_event(&mut self, event: MgmtEvent, now: MonotonicTime) {
        match event {
            MgmtEvent::DeviceFound {
                controller_idx,
                address,
                address_type,
                rssi,
                flags,
                ad_data,
            } => {
                let Some(source) = self.controllers.get(&controller_idx).cloned() else {
                    tracing::debug!(controller_idx, "device found on unmapped controller");
                    return;
                };
                let parsed = parse_advertisement_bytes(&ad_data);
                let mut details = HashMap::new();
                details.insert("address_type".to_string(), json!(address_type));
                details.insert("flags".to_string(), json!(flags));
                self.local_detection(
                    &source,
                    &address,
                    rssi.unwrap_or(NO_RSSI_VALUE),
                    parsed.local_name,
                    parsed.service_uuids,
                    parsed.service_data,
                    parsed.manufacturer_data,
                    parsed.tx_power,
                    details,
                    now,
                    Some(ad_data),
                );
            }
            MgmtEvent::CommandComplete {
                controller_idx,
                opcode,
                status,
                data,
            } if opcode == shared::protocol::MGMT_OP_GET_CONNECTIONS => {
                if status != 0 {
                    tracing::warn!(
                        controller_idx,
                        status,
                        "GET_CONNECTIONS completed with failure"
                    );
                    return;
                }
                if data.len() < 2 {
                    return;
                }
                let count = u16::from_le_bytes([data[0], data[1]]) as usize;
                let addresses = data[2..]
                    .chunks_exact(7)
                    .take(count)
                    .map(|entry| {
                        let mut wire_addr = [0u8; 6];
                        wire_addr.copy_from_slice(&entry[..6]);
                        shared::protocol::format_wire_address(&wire_addr)
                    })
                    .collect();
                self.apply_connections_report(controller_idx, addresses);
            }
            MgmtEvent::CommandComplete { .. } => {}
            MgmtEvent::CommandStatus {
                controller_idx,
                opcode,
                status,
            } => {
                if status != 0 {
                    tracing::warn!(controller_idx, opcode, status, "management command failed");
                }
            }
        }
    }

    // ----- connection-path election -----------------------------------

    /// Pick the best scanner to open a connection to `address`.
    ///
    /// Candidates are connectable scanners currently hearing the device;
    /// each is scored by its signal disadvantage against the best
    /// candidate minus busy/failure penalties. Ties break on free slots,
    /// then on registration order.
    pub fn best_connection_path(&self, address: &str) -> Option<String> {
        let candidates: Vec<(&String, &RegisteredScanner, i8)> = self
            .sources
            .iter()
            .filter(|(_, entry)| {
                entry.scanner.core().connectable && entry.scanner.core().scanning
            })
            .filter_map(|(source, entry)| {
                entry
                    .scanner
                    .core()
                    .discovered
                    .get(address)
                    .map(|info| (source, entry, info.rssi))
            })
            .collect();
        let best_rssi = candidates.iter().map(|(_, _, rssi)| *rssi).max()?;

        candidates
            .into_iter()
            .max_by(|(_, a_entry, a_rssi), (_, b_entry, b_rssi)| {
                let a_score = a_entry
                    .scanner
                    .core()
                    .score_connection_path(f64::from(*a_rssi) - f64::from(best_rssi), address);
                let b_score = b_entry
                    .scanner
                    .core()
                    .score_connection_path(f64::from(*b_rssi) - f64::from(best_rssi), address);
                a_score
                    .total_cmp(&b_score)
                    .then_with(|| self.free_slots(a_entry).cmp(&self.free_slots(b_entry)))
                    // Earlier registration wins a full tie.
                    .then_with(|| b_entry.seq.cmp(&a_entry.seq))
            })
            .map(|(source, _, _)| source.clone())
    }

    fn free_slots(&self, entry: &RegisteredScanner) -> usize {
        self.allocations
            .get(&entry.scanner.core().adapter)
            .map(|alloc| alloc.free)
            .unwrap_or(0)
    }

    // ----- adapter recovery -------------------------------------------

    /// Restart every local scanner stuck in the failed state.
    ///
    /// At most one recovery runs fleet-wide; a second call while one is in
    /// flight returns immediately. Scanners that still fail surface
    /// [`BleError::AdapterRecoveryFailed`] but do not stop the others.
    pub async fn recover_failed_scanners(&mut self, now: MonotonicTime) -> Result<()> {
        let lock = Arc::clone(&self.recovery_lock);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!("adapter recovery already in progress");
            return Ok(());
        };
        let failed: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, entry)| match &entry.scanner {
                Scanner::Local(local) => local.state == crate::scanner::local::ScanState::Failed,
                Scanner::Remote(_) => false,
            })
            .map(|(source, _)| source.clone())
            .collect();

        let mut first_error = None;
        for source in failed {
            let Some(start) = self
                .sources
                .get_mut(&source)
                .and_then(|entry| entry.scanner.as_local_mut())
                .and_then(|local| local.begin_start())
            else {
                continue;
            };
            let outcome = start.await;
            let failed_again = matches!(outcome, StartOutcome::Failed(_));
            if let Some(local) = self
                .sources
                .get_mut(&source)
                .and_then(|entry| entry.scanner.as_local_mut())
            {
                local.finish_start(outcome, now);
            }
            if failed_again {
                let adapter = self
                    .sources
                    .get(&source)
                    .map(|entry| entry.scanner.core().adapter.clone())
                    .unwrap_or_else(|| source.clone());
                tracing::error!(%adapter, "adapter recovery exhausted");
                first_error.get_or_insert(BleError::AdapterRecoveryFailed {
                    adapter,
                    reason: "restart failed in both modes".into(),
                });
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ----- queries ----------------------------------------------------

    pub fn scanner_count(&self, connectable: bool) -> usize {
        if connectable {
            self.connectable_sources.len()
        } else {
            self.sources.len()
        }
    }

    pub fn scanner_core(&self, source: &str) -> Option<&ScannerCore> {
        self.sources.get(source).map(|entry| entry.scanner.core())
    }

    pub fn scanner_mut(&mut self, source: &str) -> Option<&mut Scanner> {
        self.sources.get_mut(source).map(|entry| &mut entry.scanner)
    }

    pub fn address_present(&self, address: &str, connectable: bool) -> bool {
        if connectable {
            self.connectable_history.contains_key(address)
        } else {
            self.all_history.contains_key(address)
        }
    }

    pub fn ble_device_from_address(
        &self,
        address: &str,
        connectable: bool,
    ) -> Option<DeviceHandle> {
        let history = if connectable {
            &self.connectable_history
        } else {
            &self.all_history
        };
        history.get(address).map(|info| info.device.clone())
    }

    pub fn last_service_info(&self, address: &str, connectable: bool) -> Option<&ServiceInfo> {
        if connectable {
            self.connectable_history.get(address)
        } else {
            self.all_history.get(address)
        }
    }

    pub fn discovered_service_info(&self, connectable: bool) -> Vec<ServiceInfo> {
        let history = if connectable {
            &self.connectable_history
        } else {
            &self.all_history
        };
        history.values().cloned().collect()
    }

    pub fn all_discovered_devices(
        &self,
        connectable: bool,
    ) -> Vec<(DeviceHandle, AdvertisementData)> {
        let history = if connectable {
            &self.connectable_history
        } else {
            &self.all_history
        };
        history
            .values()
            .map(|info| (info.device.clone(), info.advertisement().clone()))
            .collect()
    }

    /// Every scanner currently hearing `address`, with its view of the
    /// device.
    pub fn scanner_devices_by_address(
        &self,
        address: &str,
        connectable: bool,
    ) -> Vec<(String, DeviceHandle, AdvertisementData)> {
        self.sources
            .iter()
            .filter(|(source, _)| !connectable || self.connectable_sources.contains(*source))
            .filter_map(|(source, entry)| {
                entry
                    .scanner
                    .core()
                    .get_discovered_device_advertisement_data(address)
                    .map(|(device, advertisement)| (source.clone(), device, advertisement))
            })
            .collect()
    }

    pub fn learned_advertising_interval(&self, address: &str) -> Option<f64> {
        self.tracker.intervals.get(address).copied()
    }

    pub fn fallback_availability_interval(&self, address: &str) -> Option<f64> {
        self.tracker.fallback_intervals.get(address).copied()
    }

    pub fn set_fallback_availability_interval(&mut self, address: &str, interval: f64) {
        self.tracker
            .fallback_intervals
            .insert(address.to_string(), interval);
    }

    pub fn current_allocations(&self, adapter: Option<&str>) -> Vec<SlotAllocations> {
        match adapter {
            Some(adapter) => self
                .allocations
                .get(adapter)
                .cloned()
                .into_iter()
                .collect(),
            None => self.allocations.values().cloned().collect(),
        }
    }

    pub fn current_scanners(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    /// Snapshot of `all_history` for persistence.
    pub fn history_snapshot(&self) -> HashMap<String, ServiceInfo> {
        self.all_history.clone()
    }

    /// Reload persisted history.
    ///
    /// Entries land in history with `connectable` preserved; no tracker
    /// state is touched and no callbacks fire, so a restore can never
    /// trigger expiry.
    pub fn restore_history(&mut self, entries: HashMap<String, ServiceInfo>) {
        for (address, info) in entries {
            if info.connectable {
                self.connectable_history.insert(address.clone(), info.clone());
            }
            self.all_history.insert(address, info);
        }
    }

    pub fn diagnostics(&self, now: MonotonicTime) -> Value {
        json!({
            "scanners": self
                .sources
                .values()
                .map(|entry| entry.scanner.core().diagnostics(now))
                .collect::<Vec<_>>(),
            "allocations": self.allocations,
            "all_history_count": self.all_history.len(),
            "connectable_history_count": self.connectable_history.len(),
            "advertisement_tracker": self.tracker.diagnostics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManagerConfig, ScannerConfig};
    use crate::scanner::remote::RemoteScanner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn manager() -> BluetoothManager {
        BluetoothManager::new(ManagerConfig::default(), ScannerConfig::default())
    }

    fn remote(source: &str) -> Scanner {
        Scanner::Remote(RemoteScanner::new(source, source, true, 195.0))
    }

    fn push(
        manager: &mut BluetoothManager,
        source: &str,
        address: &str,
        rssi: i8,
        time: f64,
    ) {
        manager.remote_advertisement(
            source,
            address,
            rssi,
            None,
            vec![],
            HashMap::new(),
            HashMap::new(),
            None,
            HashMap::new(),
            time,
        );
    }

    fn owner(manager: &BluetoothManager, address: &str) -> String {
        manager
            .last_service_info(address, false)
            .map(|info| info.source.clone())
            .expect("address should be in history")
    }

    fn counting_callback(count: Arc<AtomicUsize>) -> SubscriberCallback {
        Box::new(move |_device, _adv| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn assert_connectable_subset(manager: &BluetoothManager) {
        for info in manager.discovered_service_info(true) {
            assert!(
                manager.address_present(&info.address, false),
                "connectable entry {} missing from all_history",
                info.address
            );
            assert!(info.connectable);
        }
    }

    #[test]
    fn source_switch_on_rssi_gain() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);

        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());

        push(&mut manager, "s1", ADDR, -80, 100.0);
        assert_eq!(owner(&manager, ADDR), "s1");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Slightly worse signal from another source: dropped by policy.
        push(&mut manager, "s2", ADDR, -85, 100.5);
        assert_eq!(owner(&manager, ADDR), "s1");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 20 dBm better: the other source takes over.
        push(&mut manager, "s2", ADDR, -60, 101.0);
        assert_eq!(owner(&manager, ADDR), "s2");
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_connectable_subset(&manager);
    }

    #[test]
    fn stale_takeover_after_silence() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);

        push(&mut manager, "s1", ADDR, -70, 100.0);
        assert_eq!(manager.stale_seconds(ADDR), 63.0);

        // Within the stale horizon and weaker: rejected.
        push(&mut manager, "s2", ADDR, -75, 130.0);
        assert_eq!(owner(&manager, ADDR), "s1");

        // 100 s of silence beats the 63 s horizon even at worse rssi.
        push(&mut manager, "s2", ADDR, -75, 200.0);
        assert_eq!(owner(&manager, ADDR), "s2");
    }

    #[test]
    fn takeover_conditions_are_the_only_ones() {
        // Every accepted replacement must come from one of the policy
        // clauses: same source, rssi gain, stale, or dead source.
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);

        push(&mut manager, "s1", ADDR, -70, 100.0);
        for (rssi, time) in [(-70, 100.5), (-56, 101.0), (-80, 110.0)] {
            let old = manager.last_service_info(ADDR, false).unwrap().clone();
            push(&mut manager, "s2", ADDR, rssi, time);
            let new = manager.last_service_info(ADDR, false).unwrap();
            if new.source != old.source || new.time != old.time {
                let accepted = new.source == old.source
                    || i16::from(new.rssi) - i16::from(old.rssi) >= 16
                    || new.time - old.time > manager.stale_seconds(ADDR);
                assert!(accepted, "replacement outside the policy: {rssi} at {time}");
            }
        }
    }

    #[test]
    fn dead_or_stopped_source_loses_immediately() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);

        push(&mut manager, "s1", ADDR, -60, 100.0);
        manager
            .scanner_mut("s1")
            .unwrap()
            .core_mut()
            .add_connecting("AA:BB:CC:DD:EE:99", 100.5);
        assert!(!manager.scanner_core("s1").unwrap().scanning);

        // Weaker and fresh, but the owner stopped scanning.
        push(&mut manager, "s2", ADDR, -90, 101.0);
        assert_eq!(owner(&manager, ADDR), "s2");
    }

    #[test]
    fn apple_noise_updates_history_without_dispatch() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());

        manager.remote_advertisement(
            "s1",
            ADDR,
            -60,
            None,
            vec![],
            HashMap::new(),
            HashMap::from([(0x004C_u16, vec![0x07, 0x00])]),
            None,
            HashMap::new(),
            10.0,
        );
        assert!(manager.address_present(ADDR, false));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // iBeacon type byte is on the allow list.
        manager.remote_advertisement(
            "s1",
            ADDR,
            -60,
            None,
            vec![],
            HashMap::new(),
            HashMap::from([(0x004C_u16, vec![0x02, 0x15])]),
            None,
            HashMap::new(),
            11.0,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_failing_subscriber_does_not_break_fanout() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);

        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());
        manager.register_callback(
            Box::new(|_device, _adv| panic!("subscriber bug")),
            CallbackFilters::default(),
        );
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());

        push(&mut manager, "s1", ADDR, -60, 10.0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn uuid_filters_select_subscribers() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);

        let hid = crate::scanner::adv_parser::uuid_from_u16(0x1812);
        let battery = crate::scanner::adv_parser::uuid_from_u16(0x180F);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(
            counting_callback(Arc::clone(&count)),
            CallbackFilters::for_uuids([battery]),
        );

        manager.remote_advertisement(
            "s1",
            ADDR,
            -60,
            None,
            vec![hid],
            HashMap::new(),
            HashMap::new(),
            None,
            HashMap::new(),
            10.0,
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);

        manager.remote_advertisement(
            "s1",
            ADDR,
            -60,
            None,
            vec![hid, battery],
            HashMap::new(),
            HashMap::new(),
            None,
            HashMap::new(),
            11.0,
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_replays_connectable_history() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        push(&mut manager, "s1", ADDR, -60, 10.0);

        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());
        assert_eq!(count.load(Ordering::SeqCst), 1, "history should replay");
    }

    #[test]
    fn duplicate_payload_from_same_source_skips_dispatch() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        let count = Arc::new(AtomicUsize::new(0));
        manager.register_callback(counting_callback(Arc::clone(&count)), CallbackFilters::default());

        push(&mut manager, "s1", ADDR, -60, 10.0);
        push(&mut manager, "s1", ADDR, -61, 10.5);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // History still took the fresher observation.
        assert_eq!(manager.last_service_info(ADDR, false).unwrap().time, 10.5);
    }

    #[test]
    fn unavailable_sweep_evicts_and_fires_once() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        push(&mut manager, "s1", ADDR, -60, 10.0);

        let unavailable = Arc::new(AtomicUsize::new(0));
        let unavailable_clone = Arc::clone(&unavailable);
        manager.register_unavailable_callback(
            ADDR,
            true,
            Box::new(move |_info| {
                unavailable_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let disappeared: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let disappeared_clone = Arc::clone(&disappeared);
        manager.register_disappeared_callback(Box::new(move |address| {
            disappeared_clone.lock().unwrap().push(address.to_string());
        }));

        // Still discovered by the scanner: nothing happens.
        manager.check_unavailable(100.0);
        assert!(manager.address_present(ADDR, false));

        // The scanner expired it and the expiry horizon passed.
        manager
            .scanner_mut("s1")
            .unwrap()
            .as_remote_mut()
            .unwrap()
            .expire_devices(300.0);
        manager.check_unavailable(300.0);
        assert!(!manager.address_present(ADDR, false));
        assert!(!manager.address_present(ADDR, true));
        assert_eq!(unavailable.load(Ordering::SeqCst), 1);
        assert_eq!(disappeared.lock().unwrap().as_slice(), [ADDR.to_string()]);

        // Idempotent: a second sweep finds nothing to do.
        manager.check_unavailable(301.0);
        assert_eq!(unavailable.load(Ordering::SeqCst), 1);
        assert_eq!(disappeared.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregister_re_elects_surviving_source() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);

        push(&mut manager, "s1", ADDR, -60, 100.0);
        // Rejected for history, but s2 keeps it in its own view.
        push(&mut manager, "s2", ADDR, -75, 100.5);
        assert_eq!(owner(&manager, ADDR), "s1");

        manager.unregister_scanner("s1");
        assert_eq!(owner(&manager, ADDR), "s2");
        assert_connectable_subset(&manager);
    }

    #[test]
    fn registration_callbacks_see_add_and_remove() {
        let mut manager = manager();
        let events: Arc<StdMutex<Vec<(String, ScannerRegistrationEvent)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        manager.register_scanner_registration_callback(Box::new(move |source, event| {
            events_clone.lock().unwrap().push((source.to_string(), event));
        }));

        manager.register_scanner(remote("s1"), None);
        manager.unregister_scanner("s1");
        assert_eq!(
            events.lock().unwrap().as_slice(),
            [
                ("s1".to_string(), ScannerRegistrationEvent::Added),
                ("s1".to_string(), ScannerRegistrationEvent::Removed),
            ]
        );
    }

    #[test]
    fn slot_accounting_coalesces_per_flush() {
        let mut manager = manager();
        manager.register_scanner(remote("hci0"), Some(3));
        manager.flush_allocation_notifications();

        let seen: Arc<StdMutex<Vec<SlotAllocations>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        manager.register_allocation_callback(
            Some("hci0".into()),
            Box::new(move |alloc| {
                seen_clone.lock().unwrap().push(alloc.clone());
            }),
        );

        manager.add_connecting("hci0", "AA:BB:CC:DD:EE:01", 10.0);
        manager.add_connecting("hci0", "AA:BB:CC:DD:EE:02", 10.1);
        manager.finished_connecting("hci0", "AA:BB:CC:DD:EE:01", true);
        manager.flush_allocation_notifications();

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].slots, 3);
        assert_eq!(calls[0].free, 2);
        assert_eq!(
            calls[0].allocated,
            HashSet::from(["AA:BB:CC:DD:EE:02".to_string()])
        );
    }

    #[test]
    fn kernel_connections_report_overrides_allocations() {
        let mut manager = manager();
        manager.register_scanner(remote("hci0"), Some(2));
        manager.attach_controller(0, "hci0");
        manager.flush_allocation_notifications();

        manager.apply_connections_report(0, vec![ADDR.to_string()]);
        let allocations = manager.current_allocations(Some("hci0"));
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].free, 1);
        assert!(allocations[0].allocated.contains(ADDR));
    }

    #[test]
    fn best_connection_path_prefers_signal_then_load() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);
        push(&mut manager, "s1", ADDR, -60, 10.0);
        push(&mut manager, "s2", ADDR, -61, 10.1);

        assert_eq!(manager.best_connection_path(ADDR).as_deref(), Some("s1"));

        // A connection in progress on s1 outweighs its 1 dBm advantage.
        manager
            .scanner_mut("s1")
            .unwrap()
            .core_mut()
            .add_connecting(ADDR, 11.0);
        assert_eq!(manager.best_connection_path(ADDR).as_deref(), Some("s2"));
    }

    #[test]
    fn best_connection_path_ties_break_on_slots_then_order() {
        let mut manager = manager();
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), Some(2));
        push(&mut manager, "s1", ADDR, -60, 10.0);
        push(&mut manager, "s2", ADDR, -60, 10.1);

        // Equal score; s2 has free slots declared.
        assert_eq!(manager.best_connection_path(ADDR).as_deref(), Some("s2"));

        let mut manager = BluetoothManager::new(ManagerConfig::default(), ScannerConfig::default());
        manager.register_scanner(remote("s1"), None);
        manager.register_scanner(remote("s2"), None);
        push(&mut manager, "s1", ADDR, -60, 10.0);
        push(&mut manager, "s2", ADDR, -60, 10.1);
        // Full tie: earlier registration wins.
        assert_eq!(manager.best_connection_path(ADDR).as_deref(), Some("s1"));
    }

    #[test]
    fn device_found_frames_route_to_the_mapped_scanner() {
        use crate::scanner::local::{LocalScanner, RadioBackend};
        use futures::future::BoxFuture;
        use shared::types::ScanMode;

        struct NullBackend;
        impl RadioBackend for NullBackend {
            fn start(&self, _mode: ScanMode) -> BoxFuture<'_, anyhow::Result<()>> {
                Box::pin(async { Ok(()) })
            }
            fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
                Box::pin(async { Ok(()) })
            }
        }

        let mut manager = manager();
        manager.register_scanner(
            Scanner::Local(LocalScanner::new(
                "hci0",
                "hci0",
                true,
                ScanMode::Active,
                Arc::new(NullBackend),
            )),
            None,
        );
        manager.attach_controller(0, "hci0");

        let frame = crate::mgmt::codec::MgmtFrame::device_found(
            0,
            ADDR,
            0x01,
            -64,
            0,
            &[0x03, 0x03, 0x12, 0x18],
        )
        .unwrap();
        let event = MgmtEvent::from_frame(&frame).unwrap();
        manager.apply_mgmt_event(event, 50.0);

        let info = manager.last_service_info(ADDR, false).unwrap();
        assert_eq!(info.source, "hci0");
        assert_eq!(info.rssi, -64);
        assert_eq!(
            info.service_uuids,
            vec![crate::scanner::adv_parser::uuid_from_u16(0x1812)]
        );
        assert_eq!(info.device.details["address_type"], 1);
        assert_eq!(info.raw.as_deref(), Some([0x03, 0x03, 0x12, 0x18].as_slice()));

        let views = manager.scanner_devices_by_address(ADDR, true);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].0, "hci0");
    }

    #[test]
    fn restore_preserves_connectable_and_fires_nothing() {
        let mut manager = manager();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        manager.register_unavailable_callback(
            ADDR,
            false,
            Box::new(move |_info| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let mut entries = HashMap::new();
        entries.insert(
            ADDR.to_string(),
            ServiceInfo::new(
                Some("Tag".into()),
                ADDR.into(),
                -60,
                HashMap::new(),
                HashMap::new(),
                vec![],
                "s1".into(),
                DeviceHandle::new(ADDR, Some("Tag".into())),
                None,
                true,
                10.0,
                None,
            ),
        );
        manager.restore_history(entries);

        assert!(manager.address_present(ADDR, false));
        assert!(manager.address_present(ADDR, true));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_connectable_subset(&manager);
    }
}
