//! Local scanner: a radio on this host, with a start/stop lifecycle and a
//! watchdog that restarts the radio when it goes quiet.
//!
//! The OS driver sits behind [`RadioBackend`]; lifecycle transitions run as
//! spawned tasks so advertisement processing never waits on the driver,
//! with the outcome routed back to the owning manager loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shared::types::{DeviceHandle, MonotonicTime, ScanMode, ServiceInfo};

use super::ScannerCore;

/// Driver for one physical radio.
pub trait RadioBackend: Send + Sync {
    fn start(&self, mode: ScanMode) -> BoxFuture<'_, anyhow::Result<()>>;
    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Lifecycle state of a local scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Starting,
    Scanning,
    Stopping,
    Failed,
}

/// Result of a start attempt, reported back to the manager loop.
#[derive(Debug)]
pub enum StartOutcome {
    /// The radio is scanning in this mode (possibly the passive fallback).
    Started(ScanMode),
    /// `stop` arrived while the start was outstanding.
    Cancelled,
    Failed(String),
}

pub struct LocalScanner {
    pub core: ScannerCore,
    pub state: ScanState,
    backend: Arc<dyn RadioBackend>,
    start_stop_lock: Arc<Mutex<()>>,
    start_cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for LocalScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScanner")
            .field("core", &self.core)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl LocalScanner {
    pub fn new(
        source: impl Into<String>,
        adapter: impl Into<String>,
        connectable: bool,
        requested_mode: ScanMode,
        backend: Arc<dyn RadioBackend>,
    ) -> Self {
        Self {
            core: ScannerCore::new(source, adapter, connectable, Some(requested_mode)),
            state: ScanState::Idle,
            backend,
            start_stop_lock: Arc::new(Mutex::new(())),
            start_cancel: None,
        }
    }

    /// Begin a start attempt.
    ///
    /// Moves to `Starting` and returns the driver future for the caller to
    /// spawn; `None` when the scanner is not in a startable state. The
    /// future tries the requested mode and falls back from active to
    /// passive exactly once.
    pub fn begin_start(&mut self) -> Option<impl Future<Output = StartOutcome> + Send> {
        if !matches!(self.state, ScanState::Idle | ScanState::Failed) {
            return None;
        }
        self.state = ScanState::Starting;
        let cancel = CancellationToken::new();
        self.start_cancel = Some(cancel.clone());

        let backend = Arc::clone(&self.backend);
        let lock = Arc::clone(&self.start_stop_lock);
        let mode = self.core.requested_mode.unwrap_or(ScanMode::Active);
        let name = self.core.name.clone();

        Some(async move {
            let _guard = lock.lock().await;
            let attempt = async {
                match backend.start(mode).await {
                    Ok(()) => StartOutcome::Started(mode),
                    Err(err) if mode == ScanMode::Active => {
                        tracing::warn!(
                            scanner = %name,
                            error = %err,
                            "active scan failed, retrying in passive mode"
                        );
                        match backend.start(ScanMode::Passive).await {
                            Ok(()) => StartOutcome::Started(ScanMode::Passive),
                            Err(err) => StartOutcome::Failed(err.to_string()),
                        }
                    }
                    Err(err) => StartOutcome::Failed(err.to_string()),
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => StartOutcome::Cancelled,
                outcome = attempt => outcome,
            }
        })
    }

    /// Apply the outcome of a start attempt.
    ///
    /// The entry state is the checkpoint: cancellation restores `Idle`,
    /// success lands in `Scanning`, exhaustion in `Failed`.
    pub fn finish_start(&mut self, outcome: StartOutcome, now: MonotonicTime) {
        self.start_cancel = None;
        match outcome {
            StartOutcome::Started(mode) => {
                self.state = ScanState::Scanning;
                self.core.current_mode = Some(mode);
                self.core.scanning = true;
                self.core.start_time = now;
                self.core.last_detection = now;
            }
            StartOutcome::Cancelled => {
                self.state = ScanState::Idle;
                self.core.scanning = false;
            }
            StartOutcome::Failed(reason) => {
                tracing::error!(
                    scanner = %self.core.name,
                    %reason,
                    "scanner failed to start"
                );
                self.state = ScanState::Failed;
                self.core.current_mode = None;
                self.core.scanning = false;
            }
        }
    }

    /// Begin a stop.
    ///
    /// During `Starting` the outstanding start is cancelled and the scanner
    /// drops straight to `Idle` with no driver call. From `Scanning` the
    /// returned future performs the driver stop.
    pub fn begin_stop(&mut self) -> Option<impl Future<Output = ()> + Send> {
        match self.state {
            ScanState::Starting => {
                if let Some(cancel) = self.start_cancel.take() {
                    cancel.cancel();
                }
                self.state = ScanState::Idle;
                self.core.scanning = false;
                None
            }
            ScanState::Scanning => {
                self.state = ScanState::Stopping;
                self.core.scanning = false;
                let backend = Arc::clone(&self.backend);
                let lock = Arc::clone(&self.start_stop_lock);
                let name = self.core.name.clone();
                Some(async move {
                    let _guard = lock.lock().await;
                    if let Err(err) = backend.stop().await {
                        tracing::warn!(scanner = %name, error = %err, "driver stop failed");
                    }
                })
            }
            _ => None,
        }
    }

    /// Apply completion of a driver stop.
    pub fn finish_stop(&mut self) {
        if self.state == ScanState::Stopping {
            self.state = ScanState::Idle;
        }
    }

    /// Whether the watchdog should restart the scanner: it claims to be
    /// scanning but has produced nothing for longer than `timeout`.
    pub fn watchdog_triggered(&self, now: MonotonicTime, timeout: f64) -> bool {
        self.state == ScanState::Scanning && self.core.time_since_last_detection(now) > timeout
    }

    /// Drop discovered entries not re-advertised within `max_age`.
    ///
    /// The kernel keeps reporting a device only while it actually hears
    /// it; entries we stop hearing must age out or the manager would see
    /// the device as discovered forever.
    pub fn prune_discovered(&mut self, now: MonotonicTime, max_age: f64) {
        self.core
            .discovered
            .retain(|_, info| now - info.time <= max_age);
    }

    /// Per-advertisement path: the driver marshalled a detection onto the
    /// manager loop.
    #[allow(clippy::too_many_arguments)]
    pub fn on_detection(
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
        let mut device = DeviceHandle::new(address, local_name.clone());
        device.details = details;
        let info = ServiceInfo::new(
            local_name,
            address.to_string(),
            rssi,
            manufacturer_data,
            service_data,
            service_uuids,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Backend that fails the first `fail_first` start calls.
    struct FlakyBackend {
        starts: AtomicUsize,
        fail_first: usize,
    }

    impl FlakyBackend {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                fail_first,
            })
        }
    }

    impl RadioBackend for FlakyBackend {
        fn start(&self, _mode: ScanMode) -> BoxFuture<'_, anyhow::Result<()>> {
            let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if attempt < self.fail_first {
                    anyhow::bail!("HCI start failed");
                }
                Ok(())
            })
        }

        fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Backend whose start blocks until released.
    struct StuckBackend {
        release: Notify,
    }

    impl RadioBackend for StuckBackend {
        fn start(&self, _mode: ScanMode) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async {
                self.release.notified().await;
                Ok(())
            })
        }

        fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn scanner(backend: Arc<dyn RadioBackend>) -> LocalScanner {
        LocalScanner::new("hci0", "hci0", true, ScanMode::Active, backend)
    }

    #[tokio::test]
    async fn start_reaches_scanning() {
        let mut local = scanner(FlakyBackend::new(0));
        let fut = local.begin_start().unwrap();
        assert_eq!(local.state, ScanState::Starting);
        let outcome = fut.await;
        local.finish_start(outcome, 100.0);
        assert_eq!(local.state, ScanState::Scanning);
        assert_eq!(local.core.current_mode, Some(ScanMode::Active));
        assert_eq!(local.core.start_time, 100.0);
        assert_eq!(local.core.last_detection, 100.0);
    }

    #[tokio::test]
    async fn active_failure_falls_back_to_passive_once() {
        let backend = FlakyBackend::new(1);
        let mut local = scanner(backend.clone());
        let outcome = local.begin_start().unwrap().await;
        local.finish_start(outcome, 1.0);
        assert_eq!(local.state, ScanState::Scanning);
        assert_eq!(local.core.current_mode, Some(ScanMode::Passive));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_failure_lands_in_failed() {
        let backend = FlakyBackend::new(2);
        let mut local = scanner(backend.clone());
        let outcome = local.begin_start().unwrap().await;
        local.finish_start(outcome, 1.0);
        assert_eq!(local.state, ScanState::Failed);
        assert_eq!(backend.starts.load(Ordering::SeqCst), 2);
        // Failed is restartable.
        assert!(local.begin_start().is_some());
    }

    #[tokio::test]
    async fn stop_during_starting_cancels_and_forces_idle() {
        let backend = Arc::new(StuckBackend {
            release: Notify::new(),
        });
        let mut local = scanner(backend);
        let fut = local.begin_start().unwrap();
        let task = tokio::spawn(fut);

        assert!(local.begin_stop().is_none());
        assert_eq!(local.state, ScanState::Idle);

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, StartOutcome::Cancelled));
        // The late-arriving cancelled outcome keeps the checkpoint state.
        local.finish_start(outcome, 2.0);
        assert_eq!(local.state, ScanState::Idle);
    }

    #[tokio::test]
    async fn stop_from_scanning_runs_the_driver() {
        let mut local = scanner(FlakyBackend::new(0));
        let outcome = local.begin_start().unwrap().await;
        local.finish_start(outcome, 1.0);

        let stop = local.begin_stop().unwrap();
        assert_eq!(local.state, ScanState::Stopping);
        stop.await;
        local.finish_stop();
        assert_eq!(local.state, ScanState::Idle);
    }

    #[test]
    fn watchdog_triggers_only_while_scanning_and_silent() {
        let mut local = scanner(FlakyBackend::new(0));
        assert!(!local.watchdog_triggered(1000.0, 90.0));
        local.state = ScanState::Scanning;
        local.core.last_detection = 100.0;
        assert!(!local.watchdog_triggered(150.0, 90.0));
        assert!(local.watchdog_triggered(200.0, 90.0));
    }

    #[test]
    fn detection_records_and_forwards() {
        let mut local = scanner(FlakyBackend::new(0));
        let info = local.on_detection(
            "AA:BB:CC:DD:EE:01",
            -55,
            Some("Tag".into()),
            vec![],
            HashMap::new(),
            HashMap::new(),
            None,
            HashMap::new(),
            12.5,
            None,
        );
        assert_eq!(info.source, "hci0");
        assert!(info.connectable);
        assert_eq!(info.time, 12.5);
        assert_eq!(local.core.last_detection, 12.5);
        assert!(local.core.discovered.contains_key("AA:BB:CC:DD:EE:01"));
    }
}
