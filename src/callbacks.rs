//! Observer registration and delivery.
//!
//! Updates are handed to a dedicated dispatch task over one channel, so they
//! reach callbacks in the order the engine produced them and never run on
//! the thread that caused them.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::status::BatchSnapshot;

/// Receives batch status updates.
pub trait DownloadBatchStatusCallback: Send + Sync {
    fn on_update(&self, snapshot: &BatchSnapshot);
}

impl<F> DownloadBatchStatusCallback for F
where
    F: Fn(&BatchSnapshot) + Send + Sync,
{
    fn on_update(&self, snapshot: &BatchSnapshot) {
        self(snapshot);
    }
}

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

enum Message {
    Update(BatchSnapshot),
    Add(CallbackId, Arc<dyn DownloadBatchStatusCallback>),
    Remove(CallbackId),
}

/// Sending side of the dispatch task. Cloning shares the same task.
///
/// The task ends once every clone has been dropped and the queued updates
/// have been delivered.
#[derive(Clone)]
pub struct CallbackDispatcher {
    tx: mpsc::UnboundedSender<Message>,
    next_id: Arc<AtomicU64>,
}

impl CallbackDispatcher {
    /// Starts the dispatch task.
    #[must_use]
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch(rx));
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            handle,
        )
    }

    /// Registers a callback. Updates published after this call reach it.
    pub fn add(&self, callback: Arc<dyn DownloadBatchStatusCallback>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Message::Add(id, callback));
        id
    }

    /// Unregisters a callback. Updates published after this call skip it.
    pub fn remove(&self, id: CallbackId) {
        let _ = self.tx.send(Message::Remove(id));
    }

    /// Queues an update for every registered callback.
    pub fn publish(&self, snapshot: BatchSnapshot) {
        if self.tx.send(Message::Update(snapshot)).is_err() {
            debug!("Callback dispatcher stopped, update dropped");
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut callbacks: BTreeMap<CallbackId, Arc<dyn DownloadBatchStatusCallback>> =
        BTreeMap::new();
    while let Some(message) = rx.recv().await {
        match message {
            Message::Add(id, callback) => {
                callbacks.insert(id, callback);
            }
            Message::Remove(id) => {
                callbacks.remove(&id);
            }
            Message::Update(snapshot) => {
                for (id, callback) in &callbacks {
                    let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        callback.on_update(&snapshot);
                    }));
                    if delivered.is_err() {
                        error!("Callback {id:?} panicked on update for batch {}", snapshot.batch_id);
                    }
                }
            }
        }
    }
}
