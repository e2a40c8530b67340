//! Async shell around [`BluetoothManager`]: one loop owns the state,
//! everything else talks to it through a command channel.
//!
//! Scanner drivers, remote transports, and consumers hold a
//! [`ManagerHandle`]; per-scanner expiry and watchdog timers live in a
//! [`DelayQueue`] on the loop, and the unavailable sweep runs on its own
//! interval. Slot-allocation notifications flush once per loop iteration,
//! after the pending burst of commands has drained.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use uuid::Uuid;

use shared::types::{
    AdvertisementData, DeviceHandle, MonotonicTime, ServiceInfo, SlotAllocations,
};

use crate::error::{BleError, Result};
use crate::manager::{
    AllocationCallback, BluetoothManager, CallbackFilters, DisappearedCallback,
    RegistrationCallback, SubscriberCallback, UnavailableCallback,
};
use crate::mgmt::codec::MgmtEvent;
use crate::scanner::local::StartOutcome;
use crate::scanner::Scanner;

/// Time source for the loop; injectable so tests control the clock.
pub type Clock = Arc<dyn Fn() -> MonotonicTime + Send + Sync>;

pub enum ManagerCommand {
    RemoteAdvertisement {
        source: String,
        address: String,
        rssi: i8,
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
        service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        tx_power: Option<i8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    },
    RemoteRawAdvertisement {
        source: String,
        address: String,
        rssi: i8,
        raw: Vec<u8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    },
    LocalDetection {
        source: String,
        address: String,
        rssi: i8,
        local_name: Option<String>,
        service_uuids: Vec<Uuid>,
        service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>,
        tx_power: Option<i8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    },
    Mgmt(MgmtEvent),
    AttachController {
        controller_idx: u16,
        source: String,
    },
    AddConnecting {
        source: String,
        address: String,
    },
    FinishedConnecting {
        source: String,
        address: String,
        connected: bool,
    },
    RegisterScanner {
        scanner: Scanner,
        connection_slots: Option<usize>,
        reply: oneshot::Sender<String>,
    },
    UnregisterScanner {
        source: String,
    },
    StartScanner {
        source: String,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    StopScanner {
        source: String,
        reply: Option<oneshot::Sender<()>>,
    },
    ScannerStartFinished {
        source: String,
        outcome: StartOutcome,
    },
    ScannerStopFinished {
        source: String,
    },
    RegisterCallback {
        callback: SubscriberCallback,
        filters: CallbackFilters,
        reply: oneshot::Sender<u64>,
    },
    UnregisterCallback {
        id: u64,
    },
    RegisterUnavailable {
        address: String,
        connectable: bool,
        callback: UnavailableCallback,
        reply: oneshot::Sender<u64>,
    },
    UnregisterUnavailable {
        address: String,
        connectable: bool,
        id: u64,
    },
    RegisterDisappeared {
        callback: DisappearedCallback,
        reply: oneshot::Sender<u64>,
    },
    UnregisterDisappeared {
        id: u64,
    },
    RegisterAllocation {
        adapter: Option<String>,
        callback: AllocationCallback,
        reply: oneshot::Sender<u64>,
    },
    UnregisterAllocation {
        adapter: Option<String>,
        id: u64,
    },
    RegisterScannerRegistration {
        callback: RegistrationCallback,
        reply: oneshot::Sender<u64>,
    },
    UnregisterScannerRegistration {
        id: u64,
    },
    SetFallbackInterval {
        address: String,
        interval: f64,
    },
    DiscoveredServiceInfo {
        connectable: bool,
        reply: oneshot::Sender<Vec<ServiceInfo>>,
    },
    AllDiscoveredDevices {
        connectable: bool,
        reply: oneshot::Sender<Vec<(DeviceHandle, AdvertisementData)>>,
    },
    CurrentAllocations {
        adapter: Option<String>,
        reply: oneshot::Sender<Vec<SlotAllocations>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Value>,
    },
    HistorySnapshot {
        reply: oneshot::Sender<HashMap<String, ServiceInfo>>,
    },
    RestoreHistory {
        entries: HashMap<String, ServiceInfo>,
    },
    RecoverFailedScanners {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScannerTimer {
    Watchdog(String),
    RemoteExpire(String),
}

/// What a [`CallbackHandle`] unregisters when cancelled.
enum CancelKind {
    Subscriber(u64),
    Unavailable {
        address: String,
        connectable: bool,
        id: u64,
    },
    Disappeared(u64),
    Allocation {
        adapter: Option<String>,
        id: u64,
    },
    ScannerRegistration(u64),
    Scanner(String),
}

/// Cancel handle returned by the registration methods; `cancel` removes
/// the registration in O(1) on the manager loop.
pub struct CallbackHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
    kind: Option<CancelKind>,
}

impl CallbackHandle {
    pub fn cancel(mut self) {
        let Some(kind) = self.kind.take() else { return };
        let command = match kind {
            CancelKind::Subscriber(id) => ManagerCommand::UnregisterCallback { id },
            CancelKind::Unavailable {
                address,
                connectable,
                id,
            } => ManagerCommand::UnregisterUnavailable {
                address,
                connectable,
                id,
            },
            CancelKind::Disappeared(id) => ManagerCommand::UnregisterDisappeared { id },
            CancelKind::Allocation { adapter, id } => {
                ManagerCommand::UnregisterAllocation { adapter, id }
            }
            CancelKind::ScannerRegistration(id) => {
                ManagerCommand::UnregisterScannerRegistration { id }
            }
            CancelKind::Scanner(source) => ManagerCommand::UnregisterScanner { source },
        };
        let _ = self.tx.send(command);
    }
}

#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl ManagerHandle {
    /// Spawn the manager loop and return its handle.
    pub fn spawn(manager: BluetoothManager) -> (Self, CancellationToken) {
        Self::spawn_with_clock(manager, Arc::new(crate::monotonic_time))
    }

    pub fn spawn_with_clock(
        manager: BluetoothManager,
        clock: Clock,
    ) -> (Self, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(manager, rx, tx.clone(), clock, cancel.clone()));
        (Self { tx }, cancel)
    }

    fn handle(&self, kind: CancelKind) -> CallbackHandle {
        CallbackHandle {
            tx: self.tx.clone(),
            kind: Some(kind),
        }
    }

    // -- scanner push interface ----------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn remote_advertisement(
        &self,
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
        let _ = self.tx.send(ManagerCommand::RemoteAdvertisement {
            source: source.into(),
            address: address.into(),
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            details,
            time,
        });
    }

    pub fn remote_raw_advertisement(
        &self,
        source: &str,
        address: &str,
        rssi: i8,
        raw: Vec<u8>,
        details: HashMap<String, Value>,
        time: MonotonicTime,
    ) {
        let _ = self.tx.send(ManagerCommand::RemoteRawAdvertisement {
            source: source.into(),
            address: address.into(),
            rssi,
            raw,
            details,
            time,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn local_detection(
        &self,
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
        let _ = self.tx.send(ManagerCommand::LocalDetection {
            source: source.into(),
            address: address.into(),
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            details,
            time,
        });
    }

    /// Forward decoded management events from a channel reader task.
    pub fn attach_mgmt_events(&self, mut events: mpsc::Receiver<MgmtEvent>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(ManagerCommand::Mgmt(event)).is_err() {
                    break;
                }
            }
        });
    }

    pub fn attach_controller(&self, controller_idx: u16, source: &str) {
        let _ = self.tx.send(ManagerCommand::AttachController {
            controller_idx,
            source: source.into(),
        });
    }

    // -- connection slots ----------------------------------------------

    pub fn add_connecting(&self, source: &str, address: &str) {
        let _ = self.tx.send(ManagerCommand::AddConnecting {
            source: source.into(),
            address: address.into(),
        });
    }

    pub fn finished_connecting(&self, source: &str, address: &str, connected: bool) {
        let _ = self.tx.send(ManagerCommand::FinishedConnecting {
            source: source.into(),
            address: address.into(),
            connected,
        });
    }

    // -- registration --------------------------------------------------

    pub async fn register_scanner(
        &self,
        scanner: Scanner,
        connection_slots: Option<usize>,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterScanner {
            scanner,
            connection_slots,
            reply,
        });
        let source = rx.await.unwrap_or_default();
        self.handle(CancelKind::Scanner(source))
    }

    pub async fn start_scanner(&self, source: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::StartScanner {
            source: source.into(),
            reply: Some(reply),
        });
        rx.await.unwrap_or_else(|_| {
            Err(BleError::ScannerStartFailed {
                scanner: source.into(),
                reason: "manager loop is gone".into(),
            })
        })
    }

    pub async fn stop_scanner(&self, source: &str) {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::StopScanner {
            source: source.into(),
            reply: Some(reply),
        });
        let _ = rx.await;
    }

    pub async fn register_callback(
        &self,
        callback: impl Fn(&DeviceHandle, &AdvertisementData) + Send + 'static,
        filters: CallbackFilters,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterCallback {
            callback: Box::new(callback),
            filters,
            reply,
        });
        let id = rx.await.unwrap_or_default();
        self.handle(CancelKind::Subscriber(id))
    }

    pub async fn register_unavailable_callback(
        &self,
        address: &str,
        connectable: bool,
        callback: impl Fn(&ServiceInfo) + Send + 'static,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterUnavailable {
            address: address.into(),
            connectable,
            callback: Box::new(callback),
            reply,
        });
        let id = rx.await.unwrap_or_default();
        self.handle(CancelKind::Unavailable {
            address: address.into(),
            connectable,
            id,
        })
    }

    pub async fn register_disappeared_callback(
        &self,
        callback: impl Fn(&str) + Send + 'static,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterDisappeared {
            callback: Box::new(callback),
            reply,
        });
        let id = rx.await.unwrap_or_default();
        self.handle(CancelKind::Disappeared(id))
    }

    pub async fn register_allocation_callback(
        &self,
        adapter: Option<String>,
        callback: impl Fn(&SlotAllocations) + Send + 'static,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterAllocation {
            adapter: adapter.clone(),
            callback: Box::new(callback),
            reply,
        });
        let id = rx.await.unwrap_or_default();
        self.handle(CancelKind::Allocation { adapter, id })
    }

    pub async fn register_scanner_registration_callback(
        &self,
        callback: impl Fn(&str, shared::types::ScannerRegistrationEvent) + Send + 'static,
    ) -> CallbackHandle {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RegisterScannerRegistration {
            callback: Box::new(callback),
            reply,
        });
        let id = rx.await.unwrap_or_default();
        self.handle(CancelKind::ScannerRegistration(id))
    }

    pub fn set_fallback_interval(&self, address: &str, interval: f64) {
        let _ = self.tx.send(ManagerCommand::SetFallbackInterval {
            address: address.into(),
            interval,
        });
    }

    // -- queries -------------------------------------------------------

    pub async fn discovered_service_info(&self, connectable: bool) -> Vec<ServiceInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ManagerCommand::DiscoveredServiceInfo { connectable, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn all_discovered_devices(
        &self,
        connectable: bool,
    ) -> Vec<(DeviceHandle, AdvertisementData)> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ManagerCommand::AllDiscoveredDevices { connectable, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn current_allocations(&self, adapter: Option<String>) -> Vec<SlotAllocations> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ManagerCommand::CurrentAllocations { adapter, reply });
        rx.await.unwrap_or_default()
    }

    pub async fn diagnostics(&self) -> Value {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::Diagnostics { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn history_snapshot(&self) -> HashMap<String, ServiceInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::HistorySnapshot { reply });
        rx.await.unwrap_or_default()
    }

    pub fn restore_history(&self, entries: HashMap<String, ServiceInfo>) {
        let _ = self.tx.send(ManagerCommand::RestoreHistory { entries });
    }

    pub async fn recover_failed_scanners(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerCommand::RecoverFailedScanners { reply });
        rx.await.unwrap_or(Ok(()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ManagerCommand::Shutdown);
    }
}

struct LoopState {
    timers: DelayQueue<ScannerTimer>,
    pending_start_replies: HashMap<String, oneshot::Sender<Result<()>>>,
    pending_restart: HashSet<String>,
}

async fn run(
    mut manager: BluetoothManager,
    mut rx: mpsc::UnboundedReceiver<ManagerCommand>,
    tx: mpsc::UnboundedSender<ManagerCommand>,
    clock: Clock,
    cancel: CancellationToken,
) {
    let mut unavailable = tokio::time::interval(Duration::from_secs_f64(
        manager.config().unavailable_track_seconds.max(0.001),
    ));
    unavailable.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut state = LoopState {
        timers: DelayQueue::new(),
        pending_start_replies: HashMap::new(),
        pending_restart: HashSet::new(),
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                let mut shutdown =
                    handle_command(command, &mut manager, &mut state, &tx, &clock).await;
                while !shutdown {
                    match rx.try_recv() {
                        Ok(command) => {
                            shutdown =
                                handle_command(command, &mut manager, &mut state, &tx, &clock)
                                    .await;
                        }
                        Err(_) => break,
                    }
                }
                manager.flush_allocation_notifications();
                if shutdown {
                    break;
                }
            }
            _ = unavailable.tick() => {
                manager.check_unavailable(clock());
                manager.flush_allocation_notifications();
            }
            Some(expired) = state.timers.next(), if !state.timers.is_empty() => {
                handle_timer(expired.into_inner(), &mut manager, &mut state, &tx, &clock);
                manager.flush_allocation_notifications();
            }
        }
    }
    tracing::debug!("bluetooth manager loop stopped");
}

fn initiate_start(
    source: &str,
    reply: Option<oneshot::Sender<Result<()>>>,
    manager: &mut BluetoothManager,
    state: &mut LoopState,
    tx: &mpsc::UnboundedSender<ManagerCommand>,
) {
    let start = manager
        .scanner_mut(source)
        .and_then(|scanner| scanner.as_local_mut())
        .and_then(|local| local.begin_start());
    match start {
        Some(future) => {
            if let Some(reply) = reply {
                state.pending_start_replies.insert(source.to_string(), reply);
            }
            let tx = tx.clone();
            let source = source.to_string();
            tokio::spawn(async move {
                let outcome = future.await;
                let _ = tx.send(ManagerCommand::ScannerStartFinished { source, outcome });
            });
        }
        None => {
            // Not a local scanner or not in a startable state.
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

async fn handle_command(
    command: ManagerCommand,
    manager: &mut BluetoothManager,
    state: &mut LoopState,
    tx: &mpsc::UnboundedSender<ManagerCommand>,
    clock: &Clock,
) -> bool {
    match command {
        ManagerCommand::RemoteAdvertisement {
            source,
            address,
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            details,
            time,
        } => {
            manager.remote_advertisement(
                &source,
                &address,
                rssi,
                local_name,
                service_uuids,
                service_data,
                manufacturer_data,
                tx_power,
                details,
                time,
            );
        }
        ManagerCommand::RemoteRawAdvertisement {
            source,
            address,
            rssi,
            raw,
            details,
            time,
        } => {
            manager.remote_raw_advertisement(&source, &address, rssi, raw, details, time);
        }
        ManagerCommand::LocalDetection {
            source,
            address,
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            details,
            time,
        } => {
            manager.local_detection(
                &source,
                &address,
                rssi,
                local_name,
                service_uuids,
                service_data,
                manufacturer_data,
                tx_power,
                details,
                time,
                None,
            );
        }
        ManagerCommand::Mgmt(event) => manager.apply_mgmt_event(event, clock()),
        ManagerCommand::AttachController {
            controller_idx,
            source,
        } => manager.attach_controller(controller_idx, source),
        ManagerCommand::AddConnecting { source, address } => {
            manager.add_connecting(&source, &address, clock());
        }
        ManagerCommand::FinishedConnecting {
            source,
            address,
            connected,
        } => manager.finished_connecting(&source, &address, connected),
        ManagerCommand::RegisterScanner {
            scanner,
            connection_slots,
            reply,
        } => {
            let expiry_tick = match &scanner {
                Scanner::Remote(remote) => Some(remote.expiry_tick_seconds()),
                Scanner::Local(_) => None,
            };
            let is_local = matches!(scanner, Scanner::Local(_));
            let source = manager.register_scanner(scanner, connection_slots);
            if let Some(seconds) = expiry_tick {
                state.timers.insert(
                    ScannerTimer::RemoteExpire(source.clone()),
                    Duration::from_secs_f64(seconds.max(0.001)),
                );
            }
            if is_local {
                state.timers.insert(
                    ScannerTimer::Watchdog(source.clone()),
                    Duration::from_secs_f64(manager.scanner_config().watchdog_interval.max(0.001)),
                );
            }
            let _ = reply.send(source);
        }
        ManagerCommand::UnregisterScanner { source } => {
            // Timers notice the missing source at their next firing.
            manager.unregister_scanner(&source);
        }
        ManagerCommand::StartScanner { source, reply } => {
            initiate_start(&source, reply, manager, state, tx);
        }
        ManagerCommand::StopScanner { source, reply } => {
            let stop = manager
                .scanner_mut(&source)
                .and_then(|scanner| scanner.as_local_mut())
                .and_then(|local| local.begin_stop());
            if let Some(future) = stop {
                let tx = tx.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    future.await;
                    let _ = tx.send(ManagerCommand::ScannerStopFinished { source });
                });
            }
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        }
        ManagerCommand::ScannerStartFinished { source, outcome } => {
            let failure = match &outcome {
                StartOutcome::Failed(reason) => Some(reason.clone()),
                _ => None,
            };
            if let Some(local) = manager
                .scanner_mut(&source)
                .and_then(|scanner| scanner.as_local_mut())
            {
                local.finish_start(outcome, clock());
            }
            if let Some(reply) = state.pending_start_replies.remove(&source) {
                let result = match failure {
                    Some(reason) => Err(BleError::ScannerStartFailed {
                        scanner: source.clone(),
                        reason,
                    }),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
        }
        ManagerCommand::ScannerStopFinished { source } => {
            if let Some(local) = manager
                .scanner_mut(&source)
                .and_then(|scanner| scanner.as_local_mut())
            {
                local.finish_stop();
            }
            if state.pending_restart.remove(&source) {
                initiate_start(&source, None, manager, state, tx);
            }
        }
        ManagerCommand::RegisterCallback {
            callback,
            filters,
            reply,
        } => {
            let _ = reply.send(manager.register_callback(callback, filters));
        }
        ManagerCommand::UnregisterCallback { id } => manager.unregister_callback(id),
        ManagerCommand::RegisterUnavailable {
            address,
            connectable,
            callback,
            reply,
        } => {
            let _ = reply.send(manager.register_unavailable_callback(
                &address,
                connectable,
                callback,
            ));
        }
        ManagerCommand::UnregisterUnavailable {
            address,
            connectable,
            id,
        } => manager.unregister_unavailable_callback(&address, connectable, id),
        ManagerCommand::RegisterDisappeared { callback, reply } => {
            let _ = reply.send(manager.register_disappeared_callback(callback));
        }
        ManagerCommand::UnregisterDisappeared { id } => {
            manager.unregister_disappeared_callback(id);
        }
        ManagerCommand::RegisterAllocation {
            adapter,
            callback,
            reply,
        } => {
            let _ = reply.send(manager.register_allocation_callback(adapter, callback));
        }
        ManagerCommand::UnregisterAllocation { adapter, id } => {
            manager.unregister_allocation_callback(adapter, id);
        }
        ManagerCommand::RegisterScannerRegistration { callback, reply } => {
            let _ = reply.send(manager.register_scanner_registration_callback(callback));
        }
        ManagerCommand::UnregisterScannerRegistration { id } => {
            manager.unregister_scanner_registration_callback(id);
        }
        ManagerCommand::SetFallbackInterval { address, interval } => {
            manager.set_fallback_availability_interval(&address, interval);
        }
        ManagerCommand::DiscoveredServiceInfo { connectable, reply } => {
            let _ = reply.send(manager.discovered_service_info(connectable));
        }
        ManagerCommand::AllDiscoveredDevices { connectable, reply } => {
            let _ = reply.send(manager.all_discovered_devices(connectable));
        }
        ManagerCommand::CurrentAllocations { adapter, reply } => {
            let _ = reply.send(manager.current_allocations(adapter.as_deref()));
        }
        ManagerCommand::Diagnostics { reply } => {
            let _ = reply.send(manager.diagnostics(clock()));
        }
        ManagerCommand::HistorySnapshot { reply } => {
            let _ = reply.send(manager.history_snapshot());
        }
        ManagerCommand::RestoreHistory { entries } => manager.restore_history(entries),
        ManagerCommand::RecoverFailedScanners { reply } => {
            let _ = reply.send(manager.recover_failed_scanners(clock()).await);
        }
        ManagerCommand::Shutdown => return true,
    }
    false
}

fn handle_timer(
    timer: ScannerTimer,
    manager: &mut BluetoothManager,
    state: &mut LoopState,
    tx: &mpsc::UnboundedSender<ManagerCommand>,
    clock: &Clock,
) {
    let now = clock();
    match timer {
        ScannerTimer::RemoteExpire(source) => {
            let Some(remote) = manager
                .scanner_mut(&source)
                .and_then(|scanner| scanner.as_remote_mut())
            else {
                return; // unregistered; let the timer die
            };
            remote.expire_devices(now);
            let next = remote.expiry_tick_seconds().max(0.001);
            state.timers.insert(
                ScannerTimer::RemoteExpire(source),
                Duration::from_secs_f64(next),
            );
        }
        ScannerTimer::Watchdog(source) => {
            let interval = manager.scanner_config().watchdog_interval.max(0.001);
            let timeout = manager.scanner_config().watchdog_timeout;
            let max_age = manager.scanner_config().expire_seconds;
            let Some(local) = manager
                .scanner_mut(&source)
                .and_then(|scanner| scanner.as_local_mut())
            else {
                return;
            };
            local.prune_discovered(now, max_age);
            if local.watchdog_triggered(now, timeout) {
                let err = BleError::ScannerTimeout {
                    scanner: source.clone(),
                    seconds: local.core.time_since_last_detection(now),
                };
                tracing::warn!(error = %err, "scanner has gone quiet, restarting it");
                if let Some(stop) = local.begin_stop() {
                    state.pending_restart.insert(source.clone());
                    let tx = tx.clone();
                    let stopped_source = source.clone();
                    tokio::spawn(async move {
                        stop.await;
                        let _ = tx.send(ManagerCommand::ScannerStopFinished {
                            source: stopped_source,
                        });
                    });
                }
            }
            state.timers.insert(
                ScannerTimer::Watchdog(source),
                Duration::from_secs_f64(interval),
            );
        }
    }
}
