//! BLE advertisement aggregation and routing core.
//!
//! Many scanners (local radios and remote proxies) feed one
//! [`manager::BluetoothManager`], which deduplicates and ranks the
//! per-device advertisement stream, merges partial payloads, dispatches
//! matching advertisements to subscribers, tracks advertising cadence and
//! disappearance, and accounts GATT connection slots per adapter.

pub mod central;
pub mod config;
pub mod error;
pub mod manager;
pub mod mgmt;
pub mod scanner;
pub mod storage;
pub mod tracker;

use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic seconds since the process first asked for the time.
///
/// All advertisement timestamps and expiry math use this clock; wall time
/// only appears in persisted snapshots.
pub fn monotonic_time() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}
