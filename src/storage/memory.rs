//! In-process signal store.
//!
//! Keeps the latest signal per symbol. A newer signal for the same symbol
//! replaces the old one but inherits its `saved` flag.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{SignalQuery, SignalStore};
use crate::types::Signal;

#[derive(Default)]
pub struct InMemorySignalStore {
    signals: RwLock<Vec<Signal>>,
}

impl InMemorySignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a snapshot.
    pub fn from_signals(signals: Vec<Signal>) -> Self {
        Self {
            signals: RwLock::new(signals),
        }
    }

    /// Copy of everything stored, for snapshotting.
    pub async fn snapshot(&self) -> Vec<Signal> {
        self.signals.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.signals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired signals nobody saved. Returns how many were removed.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut signals = self.signals.write().await;
        let before = signals.len();
        signals.retain(|s| s.saved || !s.is_expired(now));
        before - signals.len()
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn create_signal(&self, mut signal: Signal) -> Result<Signal> {
        let mut signals = self.signals.write().await;
        if let Some(pos) = signals.iter().position(|s| s.symbol == signal.symbol) {
            let previous = signals.remove(pos);
            signal.saved = previous.saved;
            debug!(symbol = %signal.symbol, replaced = %previous.id, "Signal superseded");
        }
        signals.push(signal.clone());
        Ok(signal)
    }

    async fn query(&self, query: &SignalQuery) -> Result<Vec<Signal>> {
        let now = Utc::now();
        let signals = self.signals.read().await;
        let mut matching: Vec<Signal> = signals
            .iter()
            .filter(|s| query.matches(s, now))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.convergence_score
                .total_cmp(&a.convergence_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Signal>> {
        Ok(self.signals.read().await.iter().find(|s| s.id == id).cloned())
    }

    async fn mark_viewed(&self, id: Uuid) -> Result<bool> {
        let mut signals = self.signals.write().await;
        match signals.iter_mut().find(|s| s.id == id) {
            Some(s) => {
                s.viewed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn toggle_saved(&self, id: Uuid) -> Result<Option<bool>> {
        let mut signals = self.signals.write().await;
        Ok(signals.iter_mut().find(|s| s.id == id).map(|s| {
            s.saved = !s.saved;
            s.saved
        }))
    }
}
