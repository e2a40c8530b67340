//! Persisted advertisement history.
//!
//! The on-disk form is one JSON document: a wall-clock stamp plus the
//! address-keyed map of last-seen [`ServiceInfo`] records. Loading a
//! document back only refills the in-memory model; it never schedules
//! expiry or fires callbacks.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::ServiceInfo;

use crate::manager::BluetoothManager;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub saved_at: DateTime<Utc>,
    pub entries: HashMap<String, ServiceInfo>,
}

impl HistoryDocument {
    /// Snapshot the manager's cross-source history.
    pub fn dump(manager: &BluetoothManager) -> Self {
        Self {
            saved_at: Utc::now(),
            entries: manager.history_snapshot(),
        }
    }

    /// Reinject a document into the manager, `connectable` preserved.
    pub fn restore(self, manager: &mut BluetoothManager) {
        manager.restore_history(self.entries);
    }
}

/// Write the history document to `path`, creating parent directories.
pub fn save_to_path(document: &HistoryDocument, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(document).context("Failed to serialize history")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write history file: {}", path.display()))?;
    Ok(())
}

/// Load a history document; `Ok(None)` when no file exists yet.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Option<HistoryDocument>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    let document = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))?;
    Ok(Some(document))
}
