//! The downloader: one task that owns every batch.
//!
//! All state mutations (caller commands, worker reports, connectivity-driven
//! resumes) arrive as [`Command`]s on one queue and are applied one at a
//! time, so a batch is never mutated from two places at once. Transfers run
//! on worker tasks that report back through the same queue.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::{Batch, BatchId};
use crate::batch_persistence::DownloadsBatchPersistence;
use crate::config::EngineConfig;
use crate::connection::ConnectionChecker;
use crate::download_batch::DownloadBatch;
use crate::error::{Error, Result};
use crate::file_ops::FileOperations;
use crate::migration::{Migration, MigrationKind};
use crate::stats::SpeedTracker;
use crate::status::{BatchSnapshot, DownloadBatchStatus, PauseReason};
use crate::worker::{self, PlannedFile, WorkerContext, WorkerEvent, WorkerReport};

/// Messages processed by the downloader task.
pub enum Command {
    Initialise {
        reply: oneshot::Sender<Result<()>>,
    },
    Submit {
        batch: Batch,
        reply: oneshot::Sender<Result<()>>,
    },
    Pause {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<()>>,
    },
    Resume {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        batch_id: BatchId,
        reply: oneshot::Sender<Result<()>>,
    },
    ResumeNetworkPaused,
    ImportMigrations {
        migrations: Vec<Migration>,
        reply: oneshot::Sender<Result<Vec<BatchId>>>,
    },
    GetBatch {
        batch_id: BatchId,
        reply: oneshot::Sender<Option<BatchSnapshot>>,
    },
    GetAll {
        reply: oneshot::Sender<Vec<BatchSnapshot>>,
    },
    Worker(WorkerReport),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct RunningWorker {
    run_id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Entry {
    batch: DownloadBatch,
    worker: Option<RunningWorker>,
    speed: Option<SpeedTracker>,
}

impl Entry {
    const fn new(batch: DownloadBatch) -> Self {
        Self {
            batch,
            worker: None,
            speed: None,
        }
    }

    fn is_eligible(&self) -> bool {
        self.worker.is_none()
            && matches!(
                self.batch.status(),
                DownloadBatchStatus::Queued | DownloadBatchStatus::Downloading
            )
    }

    fn eta(&self) -> Option<Duration> {
        let speed = self.speed.as_ref()?;
        let total = self.batch.bytes_total()?;
        speed.eta(total.saturating_sub(self.batch.bytes_downloaded()))
    }

    /// Returns false if no worker was running.
    fn cancel_worker(&self) -> bool {
        match &self.worker {
            Some(worker) => {
                worker.token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Owns the in-memory batches and schedules their workers.
pub struct LiteDownloadManagerDownloader {
    entries: HashMap<BatchId, Entry>,
    /// Submission order; scheduling is first come, first served.
    order: Vec<BatchId>,
    persistence: DownloadsBatchPersistence,
    ops: FileOperations,
    checker: ConnectionChecker,
    network_recovery: bool,
    max_concurrent: usize,
    next_run_id: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl LiteDownloadManagerDownloader {
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        persistence: DownloadsBatchPersistence,
        ops: FileOperations,
        checker: ConnectionChecker,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            persistence,
            ops,
            checker,
            network_recovery: config.network_recovery,
            max_concurrent: config.max_concurrent_batches.max(1),
            next_run_id: 0,
            commands,
        }
    }

    /// Processes commands until shutdown or until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Initialise { reply } => {
                    let _ = reply.send(self.initialise().await);
                }
                Command::Submit { batch, reply } => {
                    let _ = reply.send(self.submit(batch).await);
                }
                Command::Pause { batch_id, reply } => {
                    let _ = reply.send(self.pause(&batch_id).await);
                }
                Command::Resume { batch_id, reply } => {
                    let _ = reply.send(self.resume(&batch_id).await);
                }
                Command::Delete { batch_id, reply } => {
                    let _ = reply.send(self.delete(&batch_id).await);
                }
                Command::ResumeNetworkPaused => self.resume_network_paused().await,
                Command::ImportMigrations { migrations, reply } => {
                    let _ = reply.send(self.import_migrations(migrations).await);
                }
                Command::GetBatch { batch_id, reply } => {
                    let snapshot = self
                        .entries
                        .get(&batch_id)
                        .map(|e| e.batch.snapshot(e.eta()));
                    let _ = reply.send(snapshot);
                }
                Command::GetAll { reply } => {
                    let _ = reply.send(self.snapshots());
                }
                Command::Worker(report) => self.on_worker_report(report).await,
                Command::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.shutdown().await;
    }

    fn snapshots(&self) -> Vec<BatchSnapshot> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.batch.snapshot(e.eta()))
            .collect()
    }

    /// Loads stored batches, pauses the ones left mid-transfer, finishes
    /// interrupted deletions and starts whatever is eligible.
    async fn initialise(&mut self) -> Result<()> {
        let batches = self.persistence.load_all().await?;
        let mut reconciled = 0usize;
        let mut pending_deletions = Vec::new();

        for mut batch in batches {
            let id = batch.id().clone();
            if self.entries.contains_key(&id) {
                continue;
            }
            if batch.status() == DownloadBatchStatus::Deletion {
                pending_deletions.push(id.clone());
            } else {
                if batch.reconcile_after_restart() {
                    reconciled += 1;
                    if let Err(e) = self.persistence.persist(&batch).await {
                        warn!("Failed to persist reconciled batch {id}: {e}");
                    }
                }
                self.persistence.publish(batch.snapshot(None));
            }
            self.order.push(id.clone());
            self.entries.insert(id, Entry::new(batch));
        }
        info!(
            "Restored {} stored batches, {reconciled} interrupted transfers paused",
            self.entries.len() - pending_deletions.len()
        );

        for id in pending_deletions {
            self.finish_delete(&id).await;
        }
        if self.network_recovery {
            self.resume_network_paused().await;
        }
        self.schedule().await;
        Ok(())
    }

    async fn submit(&mut self, request: Batch) -> Result<()> {
        request.validate()?;
        let id = request.id().clone();
        if let Some(entry) = self.entries.get(&id) {
            if entry.batch.status() == DownloadBatchStatus::Deletion {
                return Err(Error::BatchBeingDeleted(id));
            }
            if entry.batch.has_same_content(&request) {
                debug!("Batch {id} already submitted");
                return Ok(());
            }
            return Err(Error::InvalidRequest(format!(
                "batch {id} already exists with different content"
            )));
        }

        let mut batch = DownloadBatch::from_request(&request);
        if !self.checker.is_allowed_connection_available() {
            batch.pause(PauseReason::Network);
        }
        self.persistence.commit(&batch, None).await?;
        info!(
            "Submitted batch {id} ({} files): {}",
            batch.files().len(),
            batch.status()
        );
        self.order.push(id.clone());
        self.entries.insert(id, Entry::new(batch));
        self.schedule().await;
        Ok(())
    }

    async fn pause(&mut self, batch_id: &BatchId) -> Result<()> {
        let Some(entry) = self.entries.get_mut(batch_id) else {
            debug!("Pause of unknown batch {batch_id} ignored");
            return Ok(());
        };
        let before = entry.batch.clone();
        if !entry.batch.pause(PauseReason::User) {
            return Ok(());
        }
        if let Err(e) = self.persistence.commit(&entry.batch, None).await {
            entry.batch = before;
            return Err(e);
        }
        entry.cancel_worker();
        entry.speed = None;
        info!("Paused batch {batch_id}");
        Ok(())
    }

    async fn resume(&mut self, batch_id: &BatchId) -> Result<()> {
        let Some(entry) = self.entries.get_mut(batch_id) else {
            debug!("Resume of unknown batch {batch_id} ignored");
            return Ok(());
        };
        let before = entry.batch.clone();
        if !entry.batch.resume() {
            return Ok(());
        }
        let allowed = self.checker.is_allowed_connection_available();
        if !allowed {
            entry.batch.pause(PauseReason::Network);
        }
        if let Err(e) = self.persistence.commit(&entry.batch, None).await {
            entry.batch = before;
            return Err(e);
        }
        if allowed {
            info!("Resumed batch {batch_id}");
        } else {
            info!("Resume of batch {batch_id} deferred until an allowed connection is available");
        }
        self.schedule().await;
        Ok(())
    }

    async fn resume_network_paused(&mut self) {
        if !self.checker.is_allowed_connection_available() {
            return;
        }
        let paused: Vec<BatchId> = self
            .order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .is_some_and(|e| e.batch.pause_reason() == Some(PauseReason::Network))
            })
            .cloned()
            .collect();
        for id in paused {
            if let Err(e) = self.resume(&id).await {
                warn!("Automatic resume of batch {id} failed: {e}");
            }
        }
    }

    async fn delete(&mut self, batch_id: &BatchId) -> Result<()> {
        let Some(entry) = self.entries.get_mut(batch_id) else {
            debug!("Delete of unknown batch {batch_id} ignored");
            return Ok(());
        };
        if entry.batch.status() == DownloadBatchStatus::Deletion {
            return Ok(());
        }
        let before = entry.batch.clone();
        entry.batch.mark_deleted();
        if let Err(e) = self.persistence.commit(&entry.batch, None).await {
            entry.batch = before;
            return Err(e);
        }
        info!("Deleting batch {batch_id}");
        entry.speed = None;
        if !entry.cancel_worker() {
            self.finish_delete(batch_id).await;
        }
        Ok(())
    }

    /// Removes files and record once no worker can touch them any more.
    /// Failures are logged; the logical batch is gone either way.
    async fn finish_delete(&mut self, batch_id: &BatchId) {
        if let Err(e) = self.ops.file_persistence.delete_batch(batch_id).await {
            warn!("Failed to delete files of batch {batch_id}: {e}");
        }
        if let Err(e) = self.persistence.delete(batch_id).await {
            warn!("Failed to delete record of batch {batch_id}: {e}");
        }
        self.entries.remove(batch_id);
        self.order.retain(|id| id != batch_id);
        debug!("Batch {batch_id} removed");
    }

    async fn import_migrations(&mut self, migrations: Vec<Migration>) -> Result<Vec<BatchId>> {
        let mut imported = Vec::new();
        for migration in migrations {
            let id = migration.batch.id().clone();
            if let Err(e) = migration.batch.validate() {
                warn!("Skipping migration of batch {id}: {e}");
                continue;
            }
            if self.entries.contains_key(&id) {
                debug!("Batch {id} already present, migration skipped");
                continue;
            }

            let mut batch = DownloadBatch::from_request(&migration.batch);
            for file in &migration.files {
                let Some(target) = batch
                    .file(&file.file_id)
                    .map(|f| self.ops.file_persistence.resolve(&id, &f.relative_path))
                else {
                    warn!("Migration of batch {id} names unknown file {}", file.file_id);
                    continue;
                };
                let size = match self
                    .ops
                    .file_persistence
                    .import(&file.original_path, &target)
                    .await
                {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(
                            "Could not adopt {} for batch {id}: {e}",
                            file.original_path.display()
                        );
                        continue;
                    }
                };
                match migration.kind {
                    MigrationKind::Complete => {
                        batch.set_total_bytes(&file.file_id, size);
                        batch.reconcile_downloaded(&file.file_id, size);
                        batch.finish_file(&file.file_id);
                    }
                    MigrationKind::Partial => {
                        batch.reconcile_downloaded(&file.file_id, size);
                    }
                }
            }

            if let Some(at) = migration.last_modified {
                batch = DownloadBatch::from_parts(
                    id.clone(),
                    batch.title().to_string(),
                    batch.files().to_vec(),
                    batch.pause_reason(),
                    at,
                );
            }

            self.persistence.commit(&batch, None).await?;
            info!("Imported batch {id} as {}", batch.status());
            self.order.push(id.clone());
            self.entries.insert(id.clone(), Entry::new(batch));
            imported.push(id);
        }
        self.schedule().await;
        Ok(imported)
    }

    async fn on_worker_report(&mut self, report: WorkerReport) {
        let WorkerReport {
            batch_id,
            run_id,
            event,
        } = report;
        let current = self
            .entries
            .get(&batch_id)
            .and_then(|e| e.worker.as_ref())
            .map(|w| (w.run_id, w.token.is_cancelled()));
        let Some((current_run, cancelled)) = current else {
            debug!("Ignoring report from worker {run_id} for idle batch {batch_id}");
            return;
        };
        if current_run != run_id {
            debug!("Ignoring stale report from worker {run_id} for batch {batch_id}");
            return;
        }
        if event == WorkerEvent::Exited {
            self.on_worker_exited(&batch_id).await;
            return;
        }
        // Only bytes, sizes and finished files still count from a cancelled run.
        if cancelled
            && matches!(
                event,
                WorkerEvent::FileStarted { .. }
                    | WorkerEvent::FileFailed { .. }
                    | WorkerEvent::Interrupted { .. }
            )
        {
            debug!("Ignoring report from cancelled worker {run_id} for batch {batch_id}");
            return;
        }
        let Some(entry) = self.entries.get_mut(&batch_id) else {
            return;
        };

        let before = entry.batch.status();
        let file_done = matches!(event, WorkerEvent::FileFinished { .. });
        let changed = match event {
            WorkerEvent::Exited => false,
            WorkerEvent::FileStarted { file_id, on_disk } => {
                let reconciled = entry.batch.reconcile_downloaded(&file_id, on_disk);
                let started = entry.batch.begin_file(&file_id);
                entry.speed = Some(SpeedTracker::new(entry.batch.bytes_downloaded()));
                reconciled || started
            }
            WorkerEvent::SizeKnown { file_id, total } => {
                entry.batch.set_total_bytes(&file_id, total)
            }
            WorkerEvent::Progress {
                file_id,
                downloaded,
            } => {
                let updated = entry.batch.update_downloaded(&file_id, downloaded);
                if updated && let Some(speed) = entry.speed.as_mut() {
                    speed.record(entry.batch.bytes_downloaded());
                }
                updated
            }
            WorkerEvent::FileFinished { file_id } => {
                let finished = entry.batch.finish_file(&file_id);
                // The worker moves straight on to the next file.
                if finished
                    && !cancelled
                    && let Some(next) = entry.batch.next_pending_file().map(|f| f.id.clone())
                {
                    entry.batch.begin_file(&next);
                }
                finished
            }
            WorkerEvent::FileFailed { file_id, kind } => {
                warn!("File {file_id} of batch {batch_id} failed: {kind}");
                entry.batch.fail_file(&file_id, kind)
            }
            WorkerEvent::Interrupted { reason } => {
                info!("Batch {batch_id} interrupted: {reason}");
                entry.batch.pause(PauseReason::Network)
            }
        };
        if !changed {
            return;
        }

        let after = entry.batch.status();
        let eta = entry.eta();
        if after != before {
            info!("Batch {batch_id} is now {after}");
            self.persistence.record_transition(&entry.batch, eta).await;
            if after.is_terminal() || after == DownloadBatchStatus::Paused {
                entry.cancel_worker();
                entry.speed = None;
            }
        } else if file_done {
            self.persistence.record_transition(&entry.batch, eta).await;
        } else if after == DownloadBatchStatus::Downloading {
            self.persistence.record(&entry.batch, eta).await;
        }
    }

    async fn on_worker_exited(&mut self, batch_id: &BatchId) {
        let Some(entry) = self.entries.get_mut(batch_id) else {
            return;
        };
        entry.worker = None;
        entry.speed = None;
        if entry.batch.status() == DownloadBatchStatus::Deletion {
            self.finish_delete(batch_id).await;
        } else if let Err(e) = self.persistence.persist(&entry.batch).await {
            warn!("Failed to persist batch {batch_id}: {e}");
        }
        self.schedule().await;
    }

    /// Starts workers for eligible batches, oldest first, up to the limit.
    async fn schedule(&mut self) {
        let mut running = self
            .entries
            .values()
            .filter(|e| e.worker.is_some())
            .count();
        let candidates: Vec<BatchId> = self
            .order
            .iter()
            .filter(|id| self.entries.get(*id).is_some_and(Entry::is_eligible))
            .cloned()
            .collect();
        for id in candidates {
            if running >= self.max_concurrent {
                break;
            }
            if self.start_worker(&id).await {
                running += 1;
            }
        }
    }

    async fn start_worker(&mut self, batch_id: &BatchId) -> bool {
        let Some(events) = self.commands.upgrade() else {
            return false;
        };
        let allowed = self.checker.is_allowed_connection_available();
        let Some(entry) = self.entries.get_mut(batch_id) else {
            return false;
        };

        if !allowed {
            if entry.batch.pause(PauseReason::Network) {
                info!("Batch {batch_id} waiting for an allowed connection");
                self.persistence.record_transition(&entry.batch, None).await;
            }
            return false;
        }

        let Some(first) = entry.batch.next_pending_file().map(|f| f.id.clone()) else {
            return false;
        };
        let before = entry.batch.status();
        entry.batch.begin_file(&first);
        if entry.batch.status() != before {
            info!("Batch {batch_id} is now {}", entry.batch.status());
            self.persistence.record_transition(&entry.batch, None).await;
        }

        let files = entry
            .batch
            .files()
            .iter()
            .filter(|f| !f.status.is_completed())
            .map(|f| PlannedFile {
                id: f.id.clone(),
                uri: f.uri.clone(),
                path: self.ops.file_persistence.resolve(batch_id, &f.relative_path),
                total_bytes: f.total_bytes,
            })
            .collect();

        self.next_run_id += 1;
        let run_id = self.next_run_id;
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker::run(WorkerContext {
            batch_id: batch_id.clone(),
            run_id,
            files,
            ops: self.ops.clone(),
            checker: self.checker.clone(),
            token: token.clone(),
            events,
        }));
        entry.worker = Some(RunningWorker {
            run_id,
            token,
            handle,
        });
        entry.speed = Some(SpeedTracker::new(entry.batch.bytes_downloaded()));
        true
    }

    /// Cancels every worker, waits for them and writes the final byte
    /// counts. Batches still marked downloading are paused on next start.
    async fn shutdown(&mut self) {
        let workers: Vec<RunningWorker> = self
            .entries
            .values_mut()
            .filter_map(|e| e.worker.take())
            .collect();
        for worker in &workers {
            worker.token.cancel();
        }
        for worker in workers {
            let _ = worker.handle.await;
        }
        for entry in self.entries.values() {
            if let Err(e) = self.persistence.persist(&entry.batch).await {
                warn!("Failed to persist batch {} on shutdown: {e}", entry.batch.id());
            }
        }
        info!("Download engine stopped");
    }
}
