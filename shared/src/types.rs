use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonic seconds since an arbitrary process-local epoch.
pub type MonotonicTime = f64;

/// Scanning mode of a BLE adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Passive,
    Active,
}

/// Opaque handle to a remote device as one scanner saw it.
///
/// `details` carries platform/transport data the core does not interpret
/// (address type, D-Bus path, proxy id, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub address: String,
    pub name: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl DeviceHandle {
    pub fn new(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            address: address.into(),
            name,
            details: HashMap::new(),
        }
    }
}

/// Parsed advertisement projection handed to subscriber callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub tx_power: Option<i8>,
    pub rssi: i8,
    /// `(source, device name)` pair, mirroring the platform tuple the
    /// scanner reported the advertisement with.
    pub platform_data: (String, Option<String>),
}

/// Immutable snapshot of one advertisement from one scanner.
///
/// All fields are set at construction; after the record has been published
/// to the manager it must not be mutated. The parsed [`AdvertisementData`]
/// projection is built on first access and cached in the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: Option<String>,
    pub address: String,
    pub rssi: i8,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub source: String,
    pub device: DeviceHandle,
    pub raw: Option<Vec<u8>>,
    pub connectable: bool,
    pub time: MonotonicTime,
    pub tx_power: Option<i8>,
    #[serde(skip)]
    advertisement: OnceLock<AdvertisementData>,
}

impl ServiceInfo {
    /// Positional fast-path constructor used on every advertisement.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: Option<String>,
        address: String,
        rssi: i8,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        service_data: HashMap<Uuid, Vec<u8>>,
        service_uuids: Vec<Uuid>,
        source: String,
        device: DeviceHandle,
        raw: Option<Vec<u8>>,
        connectable: bool,
        time: MonotonicTime,
        tx_power: Option<i8>,
    ) -> Self {
        Self {
            name,
            address,
            rssi,
            manufacturer_data,
            service_data,
            service_uuids,
            source,
            device,
            raw,
            connectable,
            time,
            tx_power,
            advertisement: OnceLock::new(),
        }
    }

    /// The parsed advertisement, materialised on first read.
    ///
    /// An absent local name stays `None`; it is never rendered as an empty
    /// string.
    pub fn advertisement(&self) -> &AdvertisementData {
        self.advertisement.get_or_init(|| AdvertisementData {
            local_name: self.name.clone(),
            service_uuids: self.service_uuids.clone(),
            service_data: self.service_data.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            tx_power: self.tx_power,
            rssi: self.rssi,
            platform_data: (self.source.clone(), self.device.name.clone()),
        })
    }

    /// Whether the projection has been materialised yet.
    pub fn advertisement_cached(&self) -> bool {
        self.advertisement.get().is_some()
    }

    /// Copy of this record with `connectable` forced on.
    ///
    /// Used when a connectable path exists for a device that the current
    /// advertisement observed passively; the cached projection is carried
    /// over so nothing is re-parsed.
    pub fn to_connectable(&self) -> Self {
        let mut copy = self.clone();
        copy.connectable = true;
        copy
    }

    /// Payload equality: the fields a subscriber can observe, ignoring
    /// rssi/time/source bookkeeping.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.name == other.name
            && self.manufacturer_data == other.manufacturer_data
            && self.service_data == other.service_data
            && self.service_uuids == other.service_uuids
    }
}

impl PartialEq for ServiceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.address == other.address
            && self.rssi == other.rssi
            && self.manufacturer_data == other.manufacturer_data
            && self.service_data == other.service_data
            && self.service_uuids == other.service_uuids
            && self.source == other.source
            && self.device == other.device
            && self.raw == other.raw
            && self.connectable == other.connectable
            && self.time == other.time
            && self.tx_power == other.tx_power
    }
}

/// Connection-slot usage snapshot for one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotAllocations {
    pub adapter: String,
    pub slots: usize,
    pub free: usize,
    pub allocated: HashSet<String>,
}

/// Fired to scanner-registration subscribers when the scanner set changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerRegistrationEvent {
    Added,
    Removed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: Option<&str>) -> ServiceInfo {
        ServiceInfo::new(
            name.map(str::to_string),
            "AA:BB:CC:DD:EE:01".into(),
            -60,
            HashMap::from([(76u16, vec![0x02, 0x15])]),
            HashMap::new(),
            vec![],
            "hci0".into(),
            DeviceHandle::new("AA:BB:CC:DD:EE:01", name.map(str::to_string)),
            None,
            true,
            100.0,
            Some(4),
        )
    }

    #[test]
    fn advertisement_is_lazy_and_cached() {
        let record = info(Some("Tag"));
        assert!(!record.advertisement_cached());
        let adv = record.advertisement().clone();
        assert!(record.advertisement_cached());
        assert_eq!(adv.local_name.as_deref(), Some("Tag"));
        assert_eq!(adv.rssi, -60);
        assert_eq!(adv.platform_data.0, "hci0");
        // Second read returns the same materialisation.
        assert_eq!(record.advertisement(), &adv);
    }

    #[test]
    fn absent_name_projects_as_none() {
        let record = info(None);
        assert_eq!(record.advertisement().local_name, None);
    }

    #[test]
    fn to_connectable_keeps_cached_projection() {
        let record = info(Some("Tag"));
        record.advertisement();
        let connectable = record.to_connectable();
        assert!(connectable.connectable);
        assert!(connectable.advertisement_cached());
        assert_eq!(connectable.rssi, record.rssi);
    }

    #[test]
    fn serde_round_trip_drops_projection_cache() {
        let record = info(Some("Tag"));
        record.advertisement();
        let json = serde_json::to_string(&record).unwrap();
        let back: ServiceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(!back.advertisement_cached());
    }
}
