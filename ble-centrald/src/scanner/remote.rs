//! Remote scanner: advertisements pushed in by an external transport.
//!
//! Remote sources often split one device's advertisement across packets
//! (scan response vs. advertising data), so each intake merges the new
//! packet with the previous view of the device before publishing.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use shared::types::{DeviceHandle, MonotonicTime, ScanMode, ServiceInfo};

use super::adv_parser::parse_advertisement_bytes;
use super::ScannerCore;

#[derive(Debug)]
pub struct RemoteScanner {
    pub core: ScannerCore,
    /// Seconds before an address this scanner stopped hearing is dropped;
    /// also bounds how old a previous view may be and still merge.
    pub expire_seconds: f64,
}

impl RemoteScanner {
    pub fn new(
        scanner_id: impl Into<String>,
        name: impl Into<String>,
        connectable: bool,
        expire_seconds: f64,
    ) -> Self {
        let mut core = ScannerCore::new(scanner_id, name, connectable, Some(ScanMode::Passive));
        core.current_mode = Some(ScanMode::Passive);
        Self {
            core,
            expire_seconds,
        }
    }

    /// How often the expiry timer should fire while the scanner is active.
    pub fn expiry_tick_seconds(&self) -> f64 {
        self.expire_seconds / 2.0
    }

    /// Intake for transports that deliver the raw AD-structure bytes.
    pub fn on_raw_advertisement(
        &mut self,
        address: &str,
        rssi: i8,
        raw: Vec<u8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    ) -> ServiceInfo {
        let parsed = parse_advertisement_bytes(&raw);
        self.on_advertisement_internal(
            address,
            rssi,
            parsed.local_name,
            parsed.service_uuids,
            parsed.service_data,
            parsed.manufacturer_data,
            parsed.tx_power,
            details,
            time,
            Some(raw),
        )
    }

    /// Intake for transports that deliver pre-parsed fields.
    #[allow(clippy::too_many_arguments)]
    pub fn on_advertisement(
        &mut self,
        address: &str,
        rssi: i8,
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
        service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        tx_power: Option<i8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    ) -> ServiceInfo {
        self.on_advertisement_internal(
            address,
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            details,
            time,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn on_advertisement_internal(
        &mut self,
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
    ) -> ServiceInfo {
        self.core.scanning = self.core.connections_in_progress() == 0;

        let prev = self
            .core
            .discovered
            .get(address)
            .filter(|prev| time - prev.time <= self.expire_seconds);

        let (name, uuids, service_data, manufacturer_data, merged_details) = match prev {
            None => (
                local_name,
                service_uuids,
                service_data,
                manufacturer_data,
                details,
            ),
            Some(prev) => {
                let name = match local_name {
                    Some(name) if !name.is_empty() => Some(name),
                    _ => prev.name.clone(),
                };

                let uuids = if service_uuids.is_empty() {
                    prev.service_uuids.clone()
                } else {
                    let mut merged = prev.service_uuids.clone();
                    for uuid in service_uuids {
                        if !merged.contains(&uuid) {
                            merged.push(uuid);
                        }
                    }
                    merged
                };

                let service_data = if service_data.is_empty() {
                    prev.service_data.clone()
                } else {
                    let mut merged = prev.service_data.clone();
                    merged.extend(service_data);
                    merged
                };

                let manufacturer_data = if manufacturer_data.is_empty() {
                    prev.manufacturer_data.clone()
                } else {
                    let mut merged = prev.manufacturer_data.clone();
                    merged.extend(manufacturer_data);
                    merged
                };

                let merged_details = if details.is_empty() {
                    prev.device.details.clone()
                } else {
                    let mut merged = prev.device.details.clone();
                    merged.extend(details);
                    merged
                };

                (name, uuids, service_data, manufacturer_data, merged_details)
            }
        };

        let mut device = DeviceHandle::new(address, name.clone());
        device.details = merged_details;
        device
            .details
            .insert("source".into(), Value::String(self.core.source.clone()));

        let info = ServiceInfo::new(
            name,
            address.to_string(),
            rssi,
            manufacturer_data,
            service_data,
            uuids,
            self.core.source.clone(),
            device,
            raw,
            self.core.connectable,
            time,
            tx_power,
        );
        self.core.record_discovery(info.clone());
        info
    }

    /// Drop every address not heard within `expire_seconds`.
    pub fn expire_devices(&mut self, now: MonotonicTime) -> Vec<String> {
        let expire_seconds = self.expire_seconds;
        let expired: Vec<String> = self
            .core
            .discovered
            .iter()
            .filter(|(_, info)| now - info.time > expire_seconds)
            .map(|(address, _)| address.clone())
            .collect();
        for address in &expired {
            self.core.discovered.remove(address);
        }
        if !expired.is_empty() {
            tracing::debug!(
                scanner = %self.core.name,
                count = expired.len(),
                "expired devices not heard within {expire_seconds}s"
            );
        }
        expired
    }

    /// Snapshot of the per-device view for persistence.
    pub fn serialize_discovered_devices(&self) -> HashMap<String, ServiceInfo> {
        self.core.discovered.clone()
    }

    /// Reload a persisted snapshot.
    ///
    /// Entries are rebound to this scanner's source and connectable flag,
    /// anything already past expiry is dropped immediately, and the
    /// detection clock is left untouched so a restore can never trigger
    /// watchdog or expiry callbacks.
    pub fn restore_discovered_devices(
        &mut self,
        entries: HashMap<String, ServiceInfo>,
        now: MonotonicTime,
    ) {
        for (address, mut info) in entries {
            info.source = self.core.source.clone();
            info.connectable = self.core.connectable;
            self.core.discovered.insert(address, info);
        }
        self.expire_devices(now);
    }
}
