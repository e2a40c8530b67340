use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use ble_centrald::central::ManagerHandle;
use ble_centrald::config::Config;
use ble_centrald::manager::BluetoothManager;
use ble_centrald::storage::{self, HistoryDocument};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ble_centrald=info")),
        )
        .init();

    tracing::info!("Starting ble-centrald");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ble-centrald/centrald.toml".to_string());

    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {config_path}"))?
    } else {
        tracing::info!("No config at {config_path}, using defaults");
        Config::default()
    };
    let history_path = config.storage.history_path.clone();

    // Build the manager and restore last-seen history
    let mut manager = BluetoothManager::new(config.manager.clone(), config.scanner.clone());
    match storage::load_from_path(&history_path) {
        Ok(Some(document)) => {
            tracing::info!(
                entries = document.entries.len(),
                saved_at = %document.saved_at,
                "Restored advertisement history"
            );
            document.restore(&mut manager);
        }
        Ok(None) => tracing::info!("No stored history at {}", history_path.display()),
        Err(err) => tracing::warn!("Could not restore history: {err:#}"),
    }

    // Spawn the manager loop; scanners and remote transports register
    // through the handle.
    let (handle, loop_cancel): (ManagerHandle, CancellationToken) = ManagerHandle::spawn(manager);

    tracing::info!("Manager loop running; waiting for scanner registrations");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Persist the last-seen view before stopping the loop
    let snapshot = handle.history_snapshot().await;
    let document = HistoryDocument {
        saved_at: chrono::Utc::now(),
        entries: snapshot,
    };
    if let Err(err) = storage::save_to_path(&document, &history_path) {
        tracing::error!("Failed to persist history: {err:#}");
    } else {
        tracing::info!(
            entries = document.entries.len(),
            "Persisted advertisement history"
        );
    }

    handle.shutdown();
    loop_cancel.cancel();

    tracing::info!("Shutdown complete");
    Ok(())
}
