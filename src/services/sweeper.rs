//! Stale Record Sweeper
//!
//! Background task that expires `pending` idempotency records whose TTL has
//! elapsed, so a worker that crashed mid-request does not block its key.
//! Expired records become `failed`; the next admission with the same key
//! re-processes from scratch.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::idempotency::IdempotencyGate;
use crate::error::Result;

pub struct StaleRecordSweeper {
    gate: IdempotencyGate,
    interval: Duration,
}

impl StaleRecordSweeper {
    pub fn new(gate: IdempotencyGate, interval: Duration) -> Self {
        Self { gate, interval }
    }

    pub async fn sweep_once(&self) -> Result<u64> {
        self.gate.reclaim_stale(Utc::now()).await
    }

    /// Sweeps every `interval` until `shutdown` flips to `true` or its
    /// sender is dropped. A failed sweep is logged and retried next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Stale record sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::warn!(code = e.reason_code(), "Stale record sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Stale record sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IdempotencyState, MemoryStore, SettlementStore};
    use crate::services::idempotency::RequestFingerprint;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), Duration::from_millis(0));
        let fingerprint = RequestFingerprint::new("POST", "/draw", serde_json::json!({}));
        gate.admit("abandoned", &fingerprint).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let sweeper = StaleRecordSweeper::new(gate.clone(), Duration::from_millis(5));
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let record = store.find_idempotency_record("abandoned").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Failed);
    }

    #[tokio::test]
    async fn test_sweep_once_leaves_fresh_records() {
        let store: Arc<dyn SettlementStore> = Arc::new(MemoryStore::new());
        let gate = IdempotencyGate::new(store.clone(), Duration::from_secs(60));
        let fingerprint = RequestFingerprint::new("POST", "/draw", serde_json::json!({}));
        gate.admit("fresh", &fingerprint).await.unwrap();

        let sweeper = StaleRecordSweeper::new(gate, Duration::from_secs(1));
        tokio_test::assert_ok!(sweeper.sweep_once().await);
        let record = store.find_idempotency_record("fresh").await.unwrap().unwrap();
        assert_eq!(record.state, IdempotencyState::Pending);
    }
}
