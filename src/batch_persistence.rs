//! The single path every batch mutation takes to disk and to observers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;

use crate::batch::BatchId;
use crate::callbacks::CallbackDispatcher;
use crate::download_batch::DownloadBatch;
use crate::error::Result;
use crate::persistence::{DownloadsPersistence, PersistedBatch};
use crate::status::BatchSnapshot;
use crate::throttle::ThrottleGate;

/// Persists batches and publishes their snapshots through the throttle.
pub struct DownloadsBatchPersistence {
    store: Arc<dyn DownloadsPersistence>,
    gate: ThrottleGate,
    dispatcher: CallbackDispatcher,
}

impl DownloadsBatchPersistence {
    #[must_use]
    pub fn new(
        store: Arc<dyn DownloadsPersistence>,
        gate: ThrottleGate,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        Self {
            store,
            gate,
            dispatcher,
        }
    }

    /// Every stored batch, rebuilt in memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`](crate::Error::Persistence) if the store
    /// cannot be read.
    pub async fn load_all(&self) -> Result<Vec<DownloadBatch>> {
        Ok(self
            .store
            .load_all()
            .await?
            .into_iter()
            .map(PersistedBatch::into_download_batch)
            .collect())
    }

    /// Writes the batch and all its files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`](crate::Error::Persistence) if the write
    /// fails; the stored record is then unchanged.
    pub async fn persist(&self, batch: &DownloadBatch) -> Result<()> {
        self.store.upsert_batch(&PersistedBatch::from(batch)).await
    }

    /// A state change the caller asked for: persisted first, published only
    /// if the write succeeded.
    ///
    /// # Errors
    ///
    /// Returns the persistence error; nothing is published in that case.
    pub async fn commit(&mut self, batch: &DownloadBatch, eta: Option<Duration>) -> Result<()> {
        self.persist(batch).await?;
        self.publish(batch.snapshot(eta));
        Ok(())
    }

    /// A change driven by a transfer: written and published together when
    /// the throttle lets the update through. A failed write is logged and
    /// the in-memory state stands.
    pub async fn record(&mut self, batch: &DownloadBatch, eta: Option<Duration>) {
        let snapshot = batch.snapshot(eta);
        if !self.gate.offer(&snapshot, Instant::now()) {
            return;
        }
        if let Err(e) = self.persist(batch).await {
            warn!("Failed to persist batch {}: {e}", batch.id());
        }
        self.dispatcher.publish(snapshot);
    }

    /// Status transition driven by a transfer: always written, published
    /// through the throttle.
    pub async fn record_transition(&mut self, batch: &DownloadBatch, eta: Option<Duration>) {
        if let Err(e) = self.persist(batch).await {
            warn!("Failed to persist batch {}: {e}", batch.id());
        }
        self.publish(batch.snapshot(eta));
    }

    /// Publishes a snapshot if the throttle lets it through.
    pub fn publish(&mut self, snapshot: BatchSnapshot) -> bool {
        if self.gate.offer(&snapshot, Instant::now()) {
            self.dispatcher.publish(snapshot);
            true
        } else {
            false
        }
    }

    /// Removes the record and forgets its throttle history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`](crate::Error::Persistence) if the
    /// record cannot be removed.
    pub async fn delete(&mut self, batch_id: &BatchId) -> Result<()> {
        self.store.delete_batch(batch_id).await?;
        self.gate.forget(batch_id);
        Ok(())
    }
}
