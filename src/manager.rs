//! The public facade: a cheap handle that forwards every call to the
//! downloader task.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::batch::{Batch, BatchId};
use crate::batch_persistence::DownloadsBatchPersistence;
use crate::callbacks::{CallbackDispatcher, CallbackId, DownloadBatchStatusCallback};
use crate::config::EngineConfig;
use crate::connection::{ConnectionChecker, ConnectivityMonitor, ManualConnectivity};
use crate::downloader::{Command, LiteDownloadManagerDownloader};
use crate::error::{Error, Result};
use crate::file_ops::{FileDownloader, FileOperations, FileSizeRequester};
use crate::fs::{FilePersistence, LocalFilePersistence};
use crate::migration::Migration;
use crate::network::{DEFAULT_TIMEOUT, NetworkFileDownloader, NetworkFileSizeRequester, http_client};
use crate::persistence::{DownloadsPersistence, TomlDownloadsPersistence};
use crate::recovery::NetworkRecovery;
use crate::status::BatchSnapshot;
use crate::throttle::CallbackThrottleCreator;

/// Handle to a running download engine.
///
/// Every operation is applied in the engine's own task, in the order the
/// calls were made. Status updates reach registered callbacks on a separate
/// dispatch task.
pub struct DownloadManager {
    commands: mpsc::UnboundedSender<Command>,
    callbacks: CallbackDispatcher,
    recovery: NetworkRecovery,
    actor: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl DownloadManager {
    /// Shorthand for [`DownloadManagerBuilder::new`].
    #[must_use]
    pub fn builder(config: EngineConfig) -> DownloadManagerBuilder {
        DownloadManagerBuilder::new(config)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Submits a batch and returns its id once the batch is stored.
    ///
    /// Submitting an id that already exists with the same files is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty or malformed batch, or an id
    ///   already used by a batch with different content
    /// - [`Error::BatchBeingDeleted`] while a batch with this id is being
    ///   removed
    /// - [`Error::Persistence`] if the batch could not be stored
    pub async fn submit(&self, batch: Batch) -> Result<BatchId> {
        let batch_id = batch.id().clone();
        self.request(|reply| Command::Submit { batch, reply })
            .await??;
        Ok(batch_id)
    }

    /// Pauses a batch. Unknown ids and batches that cannot pause are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the new state could not be stored;
    /// the batch keeps running in that case.
    pub async fn pause(&self, batch_id: &BatchId) -> Result<()> {
        let batch_id = batch_id.clone();
        self.request(|reply| Command::Pause { batch_id, reply })
            .await?
    }

    /// Resumes a paused batch, or retries the failed files of an errored one.
    ///
    /// Without an allowed connection the batch stays paused for the network
    /// and resumes once one appears.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the new state could not be stored.
    pub async fn resume(&self, batch_id: &BatchId) -> Result<()> {
        let batch_id = batch_id.clone();
        self.request(|reply| Command::Resume { batch_id, reply })
            .await?
    }

    /// Deletes a batch together with its downloaded files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the deletion could not be recorded.
    pub async fn delete(&self, batch_id: &BatchId) -> Result<()> {
        let batch_id = batch_id.clone();
        self.request(|reply| Command::Delete { batch_id, reply })
            .await?
    }

    pub fn add_callback(&self, callback: impl DownloadBatchStatusCallback + 'static) -> CallbackId {
        self.callbacks.add(Arc::new(callback))
    }

    pub fn remove_callback(&self, id: CallbackId) {
        self.callbacks.remove(id);
    }

    /// Latest known state of one batch. May lag the running transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is no longer running.
    pub async fn get_batch_status(&self, batch_id: &BatchId) -> Result<Option<BatchSnapshot>> {
        let batch_id = batch_id.clone();
        self.request(|reply| Command::GetBatch { batch_id, reply })
            .await
    }

    /// Latest known state of every batch, in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is no longer running.
    pub async fn get_all_batch_statuses(&self) -> Result<Vec<BatchSnapshot>> {
        self.request(|reply| Command::GetAll { reply }).await
    }

    /// Adopts downloads tracked by an earlier store. Returns the ids that
    /// were imported; invalid records and ids already known are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if an imported batch could not be
    /// stored. Batches imported before the failure stay imported.
    pub async fn import_migrations(&self, migrations: Vec<Migration>) -> Result<Vec<BatchId>> {
        self.request(|reply| Command::ImportMigrations { migrations, reply })
            .await?
    }

    /// Stops the engine: transfers are cancelled and awaited, the final
    /// state is stored and pending callbacks are delivered.
    pub async fn shutdown(self) {
        let Self {
            commands,
            callbacks,
            recovery,
            actor,
            dispatcher_task,
        } = self;

        recovery.stop().await;
        let (reply, rx) = oneshot::channel();
        if commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
        let _ = actor.await;
        drop(callbacks);
        drop(commands);
        let _ = dispatcher_task.await;
        debug!("Download manager shut down");
    }
}

/// Assembles a [`DownloadManager`] from a config and optional replacements
/// for each collaborator.
pub struct DownloadManagerBuilder {
    config: EngineConfig,
    downloads_persistence: Option<Arc<dyn DownloadsPersistence>>,
    file_persistence: Option<Arc<dyn FilePersistence>>,
    transfer: Option<(Arc<dyn FileSizeRequester>, Arc<dyn FileDownloader>)>,
    throttle: Option<CallbackThrottleCreator>,
    connectivity: Option<Arc<dyn ConnectivityMonitor>>,
    callbacks: Vec<Arc<dyn DownloadBatchStatusCallback>>,
}

impl DownloadManagerBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            downloads_persistence: None,
            file_persistence: None,
            transfer: None,
            throttle: None,
            connectivity: None,
            callbacks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_downloads_persistence(mut self, store: Arc<dyn DownloadsPersistence>) -> Self {
        self.downloads_persistence = Some(store);
        self
    }

    #[must_use]
    pub fn with_file_persistence(mut self, files: Arc<dyn FilePersistence>) -> Self {
        self.file_persistence = Some(files);
        self
    }

    /// Replaces the HTTP size query and transfer.
    #[must_use]
    pub fn with_file_operations(
        mut self,
        size_requester: Arc<dyn FileSizeRequester>,
        downloader: Arc<dyn FileDownloader>,
    ) -> Self {
        self.transfer = Some((size_requester, downloader));
        self
    }

    /// Overrides the throttle named in the config.
    #[must_use]
    pub fn with_callback_throttle(mut self, throttle: CallbackThrottleCreator) -> Self {
        self.throttle = Some(throttle);
        self
    }

    #[must_use]
    pub fn with_connectivity_monitor(mut self, monitor: Arc<dyn ConnectivityMonitor>) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Registers a callback before startup, so it also sees the snapshots
    /// of batches restored from storage.
    #[must_use]
    pub fn with_callback(mut self, callback: impl DownloadBatchStatusCallback + 'static) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Starts the engine and restores stored batches.
    ///
    /// Batches left mid-transfer by an earlier process are paused, finished
    /// deletions are completed, and eligible batches are started.
    ///
    /// # Errors
    ///
    /// - [`Error::Http`] if the default HTTP client cannot be built
    /// - [`Error::Persistence`] if stored batches cannot be read
    pub async fn build(self) -> Result<DownloadManager> {
        let Self {
            config,
            downloads_persistence,
            file_persistence,
            transfer,
            throttle,
            connectivity,
            callbacks,
        } = self;

        let store = downloads_persistence
            .unwrap_or_else(|| Arc::new(TomlDownloadsPersistence::new(config.batches_dir())));
        let files = file_persistence
            .unwrap_or_else(|| Arc::new(LocalFilePersistence::from_config(&config)));
        let (size_requester, downloader) = match transfer {
            Some(pair) => pair,
            None => {
                let client = http_client(DEFAULT_TIMEOUT)?;
                (
                    Arc::new(NetworkFileSizeRequester::new(client.clone()))
                        as Arc<dyn FileSizeRequester>,
                    Arc::new(NetworkFileDownloader::new(client)) as Arc<dyn FileDownloader>,
                )
            }
        };
        let gate = throttle
            .unwrap_or_else(|| CallbackThrottleCreator::from(&config.throttle))
            .create();
        let monitor =
            connectivity.unwrap_or_else(|| Arc::new(ManualConnectivity::default()));

        let (dispatcher, dispatcher_task) = CallbackDispatcher::spawn();
        for callback in callbacks {
            dispatcher.add(callback);
        }

        let checker = ConnectionChecker::new(monitor, config.connection_type);
        let (commands, rx) = mpsc::unbounded_channel();
        let downloader = LiteDownloadManagerDownloader::new(
            &config,
            DownloadsBatchPersistence::new(store, gate, dispatcher.clone()),
            FileOperations::new(size_requester, downloader, files),
            checker.clone(),
            commands.downgrade(),
        );
        let actor = tokio::spawn(downloader.run(rx));

        let recovery = if config.network_recovery {
            NetworkRecovery::spawn(checker, commands.clone())
        } else {
            NetworkRecovery::disabled()
        };

        let manager = DownloadManager {
            commands,
            callbacks: dispatcher,
            recovery,
            actor,
            dispatcher_task,
        };
        if let Err(e) = manager.request(|reply| Command::Initialise { reply }).await? {
            manager.shutdown().await;
            return Err(e);
        }
        info!(
            "Download engine started ({:?} connections, {} concurrent)",
            config.connection_type, config.max_concurrent_batches
        );
        Ok(manager)
    }
}
