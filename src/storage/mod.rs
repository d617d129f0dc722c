//! Persistence layer for signals.
//!
//! `SignalStore` is the collaborator the coordinator writes signals to and
//! reads them back from. The in-memory implementation lives in `memory`;
//! it is persisted across restarts as a JSON snapshot file.

pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{Signal, SignalStrength};

pub use memory::InMemorySignalStore;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for reading signals back. Also the shape the cache key is built
/// from, so field order matters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalQuery {
    pub strength: Option<SignalStrength>,
    pub min_score: Option<f64>,
    pub saved: Option<bool>,
    pub include_expired: bool,
    pub limit: Option<usize>,
}

impl SignalQuery {
    /// Every stored signal, expired or not.
    pub fn all() -> Self {
        Self {
            include_expired: true,
            ..Self::default()
        }
    }

    /// Active hot signals.
    pub fn hot() -> Self {
        Self {
            min_score: Some(crate::types::HOT_SIGNAL_SCORE),
            ..Self::default()
        }
    }

    pub fn matches(&self, signal: &Signal, now: DateTime<Utc>) -> bool {
        if !self.include_expired && signal.is_expired(now) {
            return false;
        }
        if self.strength.is_some_and(|s| s != signal.signal_strength) {
            return false;
        }
        if self.min_score.is_some_and(|m| signal.convergence_score < m) {
            return false;
        }
        if self.saved.is_some_and(|s| s != signal.saved) {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Durable home of signals. Owns the view/save bookkeeping.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Persist a new signal and return it as stored.
    async fn create_signal(&self, signal: Signal) -> Result<Signal>;

    /// Matching signals, highest convergence score first.
    async fn query(&self, query: &SignalQuery) -> Result<Vec<Signal>>;

    async fn get(&self, id: Uuid) -> Result<Option<Signal>>;

    /// Returns false if no signal has this id.
    async fn mark_viewed(&self, id: Uuid) -> Result<bool>;

    /// Flip the saved flag. `None` if no signal has this id.
    async fn toggle_saved(&self, id: Uuid) -> Result<Option<bool>>;
}

// ---------------------------------------------------------------------------
// Snapshot files
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalSnapshot {
    saved_at: DateTime<Utc>,
    signals: Vec<Signal>,
}

/// Write all signals to a JSON file, creating parent directories.
pub fn save_snapshot(signals: &[Signal], path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for {path}"))?;
        }
    }

    let snapshot = SignalSnapshot {
        saved_at: Utc::now(),
        signals: signals.to_vec(),
    };
    let json = serde_json::to_string_pretty(&snapshot)
        .context("Failed to serialise signal snapshot")?;

    std::fs::write(path, &json).with_context(|| format!("Failed to write snapshot to {path}"))?;

    debug!(path, signals = signals.len(), "Snapshot saved");
    Ok(())
}

/// Load signals from a JSON snapshot.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: &str) -> Result<Option<Vec<Signal>>> {
    if !Path::new(path).exists() {
        info!(path, "No signal snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot from {path}"))?;

    let snapshot: SignalSnapshot = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        signals = snapshot.signals.len(),
        saved_at = %snapshot.saved_at,
        "Signal snapshot loaded"
    );

    Ok(Some(snapshot.signals))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete snapshot {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
