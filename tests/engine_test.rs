//! End-to-end behaviour of the engine, driven through `DownloadManager` with
//! in-process collaborators: a scripted remote that hands out chunks only
//! when the test releases them, a store that can be switched off, and
//! manually controlled connectivity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use lite_dl::persistence::PersistedBatch;
use lite_dl::{
    Batch, BatchId, BatchSnapshot, ByteStream, ConnectionType, DownloadBatchStatus,
    DownloadErrorKind, DownloadManager, DownloadsPersistence, EngineConfig, Error,
    FileDownloader, FileSizeRequester, FileStatus, FileStorage, InMemoryDownloadsPersistence,
    ManualConnectivity, Migration, MigrationKind, NetworkState, PauseReason, SizeQueryError,
    ThrottleConfig, TransferError,
};

const CHUNK: usize = 4;

/// Serves registered bodies in `CHUNK`-sized pieces. A gated remote releases
/// one piece per semaphore permit.
#[derive(Default)]
struct Remote {
    files: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    gate: Option<Arc<Semaphore>>,
    starts: Mutex<Vec<(String, u64)>>,
}

impl Remote {
    fn open() -> Self {
        Self::default()
    }

    fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    fn serve(&self, uri: &str, body: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(uri.to_string(), Arc::new(body.to_vec()));
    }

    fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    fn starts(&self) -> Vec<(String, u64)> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileSizeRequester for Remote {
    async fn request_file_size(&self, uri: &str) -> Result<u64, SizeQueryError> {
        self.files
            .lock()
            .unwrap()
            .get(uri)
            .map(|body| body.len() as u64)
            .ok_or(SizeQueryError::Status(404))
    }
}

#[async_trait]
impl FileDownloader for Remote {
    async fn start_download(&self, uri: &str, offset: u64) -> Result<ByteStream, TransferError> {
        let body = self
            .files
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| TransferError::Permanent(format!("{uri}: 404")))?;
        self.starts.lock().unwrap().push((uri.to_string(), offset));

        let start = usize::try_from(offset).unwrap();
        let stream = futures::stream::unfold(
            (body, start, self.gate.clone()),
            |(body, pos, gate)| async move {
                if pos >= body.len() {
                    return None;
                }
                if let Some(gate) = &gate {
                    gate.acquire().await.ok()?.forget();
                }
                let end = (pos + CHUNK).min(body.len());
                let chunk = Bytes::copy_from_slice(&body[pos..end]);
                Some((Ok(chunk), (body, end, gate)))
            },
        );
        Ok(Box::pin(stream))
    }
}

#[derive(Default)]
struct FlakyStore {
    inner: InMemoryDownloadsPersistence,
    failing: AtomicBool,
}

impl FlakyStore {
    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> lite_dl::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Persistence("store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DownloadsPersistence for FlakyStore {
    async fn load_all(&self) -> lite_dl::Result<Vec<PersistedBatch>> {
        self.check()?;
        self.inner.load_all().await
    }

    async fn upsert_batch(&self, batch: &PersistedBatch) -> lite_dl::Result<()> {
        self.check()?;
        self.inner.upsert_batch(batch).await
    }

    async fn delete_batch(&self, batch_id: &BatchId) -> lite_dl::Result<()> {
        self.check()?;
        self.inner.delete_batch(batch_id).await
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<FlakyStore>,
    remote: Arc<Remote>,
    network: ManualConnectivity,
    seen: Arc<Mutex<Vec<BatchSnapshot>>>,
}

impl Harness {
    fn new(remote: Remote) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            store: Arc::new(FlakyStore::default()),
            remote: Arc::new(remote),
            network: ManualConnectivity::new(NetworkState::UNMETERED),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_state_dir(self.dir.path().join("state"))
            .with_download_dir(self.dir.path().join("files"))
            .with_file_storage(FileStorage::External)
    }

    async fn start(&self, config: EngineConfig) -> DownloadManager {
        let seen = Arc::clone(&self.seen);
        DownloadManager::builder(config)
            .with_downloads_persistence(self.store.clone())
            .with_file_operations(self.remote.clone(), self.remote.clone())
            .with_connectivity_monitor(Arc::new(self.network.clone()))
            .with_callback(move |snapshot: &BatchSnapshot| {
                seen.lock().unwrap().push(snapshot.clone());
            })
            .build()
            .await
            .unwrap()
    }

    fn file(&self, batch: &str, name: &str) -> PathBuf {
        self.dir.path().join("files").join(batch).join(name)
    }

    async fn stored(&self, batch: &str) -> Option<PersistedBatch> {
        self.store
            .inner
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .find(|b| b.id.as_str() == batch)
    }

    fn seen_for(&self, batch: &str) -> Vec<BatchSnapshot> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.batch_id.as_str() == batch)
            .cloned()
            .collect()
    }
}

fn body(len: u8) -> Vec<u8> {
    (0..len).collect()
}

async fn wait_for(
    manager: &DownloadManager,
    id: &BatchId,
    what: &str,
    done: impl Fn(&BatchSnapshot) -> bool,
) -> BatchSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(snapshot) = manager.get_batch_status(id).await.unwrap() {
                if done(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn is(status: DownloadBatchStatus) -> impl Fn(&BatchSnapshot) -> bool {
    move |s| s.status == status
}

#[tokio::test]
async fn completes_a_multi_file_batch() {
    let remote = Remote::open();
    remote.serve("https://cdn.test/a.bin", &body(10));
    remote.serve("https://cdn.test/b.bin", &body(7));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(
            Batch::with("two", "Two files")
                .add_file("https://cdn.test/a.bin")
                .add_file("https://cdn.test/b.bin")
                .build(),
        )
        .await
        .unwrap();
    let done = wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    assert_eq!(done.bytes_downloaded, 17);
    assert_eq!(done.bytes_total, Some(17));
    assert_eq!(done.percentage, Some(100));
    assert_eq!(std::fs::read(h.file("two", "a.bin")).unwrap(), body(10));
    assert_eq!(std::fs::read(h.file("two", "b.bin")).unwrap(), body(7));

    let stored = h.stored("two").await.unwrap();
    assert_eq!(stored.status, DownloadBatchStatus::Completed);
    assert!(stored.files.iter().all(|f| f.status == FileStatus::Completed));

    let seen = h.seen_for("two");
    assert_eq!(seen.first().map(|s| s.status), Some(DownloadBatchStatus::Queued));
    assert_eq!(seen.last().map(|s| s.status), Some(DownloadBatchStatus::Completed));
    let started = seen
        .iter()
        .position(|s| s.status == DownloadBatchStatus::Downloading)
        .unwrap();
    assert!(
        seen[started..]
            .iter()
            .all(|s| s.status != DownloadBatchStatus::Queued)
    );
    assert!(
        seen.windows(2)
            .all(|w| w[0].percentage_or_zero() <= w[1].percentage_or_zero())
    );
}

#[tokio::test]
async fn progress_is_reported_while_the_first_file_downloads() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/one.bin", &body(40));
    remote.serve("https://cdn.test/two.bin", &body(40));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(
            Batch::with("pair", "")
                .add_file("https://cdn.test/one.bin")
                .add_file("https://cdn.test/two.bin")
                .build(),
        )
        .await
        .unwrap();
    h.remote.release(5);
    eventually("a quarter of the batch reported", || {
        h.seen_for("pair")
            .iter()
            .any(|s| s.bytes_downloaded == 20 && s.percentage == Some(25))
    })
    .await;

    let progress: Vec<BatchSnapshot> = h
        .seen_for("pair")
        .into_iter()
        .filter(|s| s.bytes_downloaded > 0)
        .collect();
    assert!(progress.len() >= 2);
    assert!(progress.iter().all(|s| s.bytes_total == Some(80)));
    assert!(
        progress
            .iter()
            .all(|s| s.status == DownloadBatchStatus::Downloading)
    );

    h.remote.release(20);
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn resubmitting_the_same_batch_is_idempotent() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/same.bin", &body(12));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let batch = Batch::with("same", "Same")
        .add_file("https://cdn.test/same.bin")
        .build();
    let first = manager.submit(batch.clone()).await.unwrap();
    let second = manager.submit(batch).await.unwrap();
    assert_eq!(first, second);

    eventually("transfer start", || h.remote.starts().len() == 1).await;
    assert_eq!(h.store.inner.load_all().await.unwrap().len(), 1);

    let conflicting = Batch::with("same", "Same")
        .add_file("https://cdn.test/other.bin")
        .build();
    assert!(matches!(
        manager.submit(conflicting).await,
        Err(Error::InvalidRequest(_))
    ));

    h.remote.release(10);
    wait_for(&manager, &first, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;
    assert_eq!(h.remote.starts().len(), 1);
}

#[tokio::test]
async fn malformed_batches_are_rejected_before_storage() {
    let h = Harness::new(Remote::open());
    let manager = h.start(h.config()).await;

    let empty = Batch::with("empty", "").build();
    assert!(matches!(
        manager.submit(empty).await,
        Err(Error::InvalidRequest(_))
    ));
    let bad_uri = Batch::with("bad", "").add_file("not a uri").build();
    assert!(matches!(
        manager.submit(bad_uri).await,
        Err(Error::InvalidRequest(_))
    ));

    assert!(manager.get_all_batch_statuses().await.unwrap().is_empty());
    assert!(h.store.inner.load_all().await.unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn pause_then_resume_continues_from_retained_bytes() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/big.bin", &body(20));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(Batch::with("big", "").add_file("https://cdn.test/big.bin").build())
        .await
        .unwrap();
    h.remote.release(2);
    wait_for(&manager, &id, "8 bytes", |s| s.bytes_downloaded == 8).await;

    manager.pause(&id).await.unwrap();
    let paused = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(paused.status, DownloadBatchStatus::Paused);
    assert_eq!(paused.pause_reason, Some(PauseReason::User));
    assert_eq!(paused.bytes_downloaded, 8);
    let stored = h.stored("big").await.unwrap();
    assert_eq!(stored.files[0].downloaded_bytes, 8);

    h.remote.release(10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let still = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(still.status, DownloadBatchStatus::Paused);
    assert_eq!(still.bytes_downloaded, 8);

    manager.resume(&id).await.unwrap();
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    assert_eq!(
        h.remote.starts(),
        vec![
            ("https://cdn.test/big.bin".to_string(), 0),
            ("https://cdn.test/big.bin".to_string(), 8),
        ]
    );
    assert_eq!(std::fs::read(h.file("big", "big.bin")).unwrap(), body(20));
}

#[tokio::test]
async fn failed_file_fails_the_batch_until_retried() {
    let remote = Remote::open();
    remote.serve("https://cdn.test/ok.bin", &body(6));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(
            Batch::with("mixed", "")
                .add_file("https://cdn.test/ok.bin")
                .add_file("https://cdn.test/missing.bin")
                .build(),
        )
        .await
        .unwrap();
    let failed = wait_for(&manager, &id, "error", is(DownloadBatchStatus::Error)).await;
    assert_eq!(failed.error, Some(DownloadErrorKind::SizeQueryFailed));

    let stored = h.stored("mixed").await.unwrap();
    assert_eq!(stored.status, DownloadBatchStatus::Error);
    assert_eq!(stored.files[0].status, FileStatus::Queued);
    assert_eq!(
        stored.files[1].status,
        FileStatus::Error(DownloadErrorKind::SizeQueryFailed)
    );
    assert!(h.remote.starts().is_empty());

    h.remote.serve("https://cdn.test/missing.bin", &body(3));
    manager.resume(&id).await.unwrap();
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    let seen = h.seen_for("mixed");
    assert!(seen.iter().any(|s| s.status == DownloadBatchStatus::Error));
    assert_eq!(seen.last().map(|s| s.status), Some(DownloadBatchStatus::Completed));
}

#[tokio::test]
async fn metered_network_pauses_and_recovery_resumes() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/video.bin", &body(16));
    let h = Harness::new(remote);
    let config = h
        .config()
        .with_connection_type(ConnectionType::UnmeteredOnly);
    let manager = h.start(config).await;

    let id = manager
        .submit(Batch::with("video", "").add_file("https://cdn.test/video.bin").build())
        .await
        .unwrap();
    h.remote.release(1);
    wait_for(&manager, &id, "4 bytes", |s| s.bytes_downloaded == 4).await;

    h.network.set(NetworkState::METERED);
    let paused = wait_for(&manager, &id, "network pause", |s| {
        s.pause_reason == Some(PauseReason::Network)
    })
    .await;
    assert_eq!(paused.status, DownloadBatchStatus::Paused);
    assert_eq!(paused.bytes_downloaded, 4);

    h.remote.release(10);
    h.network.set(NetworkState::UNMETERED);
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    let offsets: Vec<u64> = h.remote.starts().into_iter().map(|(_, o)| o).collect();
    assert_eq!(offsets, vec![0, 4]);
    assert_eq!(std::fs::read(h.file("video", "video.bin")).unwrap(), body(16));
}

#[tokio::test]
async fn without_recovery_a_reconnect_needs_an_explicit_resume() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/video.bin", &body(16));
    let h = Harness::new(remote);
    let config = h
        .config()
        .with_connection_type(ConnectionType::UnmeteredOnly)
        .with_network_recovery(false);
    let manager = h.start(config).await;

    let id = manager
        .submit(Batch::with("manual", "").add_file("https://cdn.test/video.bin").build())
        .await
        .unwrap();
    h.remote.release(1);
    wait_for(&manager, &id, "4 bytes", |s| s.bytes_downloaded == 4).await;

    h.network.set(NetworkState::METERED);
    wait_for(&manager, &id, "network pause", is(DownloadBatchStatus::Paused)).await;

    h.remote.release(10);
    h.network.set(NetworkState::UNMETERED);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let waiting = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(waiting.status, DownloadBatchStatus::Paused);
    assert_eq!(waiting.bytes_downloaded, 4);

    manager.resume(&id).await.unwrap();
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn offline_submission_waits_for_a_connection() {
    let remote = Remote::open();
    remote.serve("https://cdn.test/later.bin", &body(9));
    let h = Harness::new(remote);
    h.network.set(NetworkState::OFFLINE);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(Batch::with("later", "").add_file("https://cdn.test/later.bin").build())
        .await
        .unwrap();
    let waiting = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(waiting.status, DownloadBatchStatus::Paused);
    assert_eq!(waiting.pause_reason, Some(PauseReason::Network));

    // An explicit resume while offline stays deferred.
    manager.resume(&id).await.unwrap();
    assert!(h.remote.starts().is_empty());

    h.network.set(NetworkState::METERED);
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn deleting_an_active_batch_removes_it_everywhere() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/doomed.bin", &body(20));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let id = manager
        .submit(Batch::with("doomed", "").add_file("https://cdn.test/doomed.bin").build())
        .await
        .unwrap();
    h.remote.release(1);
    wait_for(&manager, &id, "4 bytes", |s| s.bytes_downloaded == 4).await;

    manager.delete(&id).await.unwrap();
    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while manager.get_batch_status(&id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "batch still present after delete");

    h.remote.release(10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.stored("doomed").await.is_none());
    assert!(!h.dir.path().join("files").join("doomed").exists());

    manager.delete(&id).await.unwrap();
    manager.delete(&BatchId::from("never-existed")).await.unwrap();
    manager.shutdown().await;

    let seen = h.seen_for("doomed");
    assert_eq!(seen.last().map(|s| s.status), Some(DownloadBatchStatus::Deletion));
    assert_eq!(
        seen.iter()
            .filter(|s| s.status == DownloadBatchStatus::Deletion)
            .count(),
        1
    );
}

async fn interrupt_with_shutdown(h: &Harness) -> BatchId {
    let manager = h.start(h.config()).await;
    let id = manager
        .submit(Batch::with("restart", "").add_file("https://cdn.test/restart.bin").build())
        .await
        .unwrap();
    h.remote.release(1);
    wait_for(&manager, &id, "4 bytes", |s| s.bytes_downloaded == 4).await;
    manager.shutdown().await;
    id
}

#[tokio::test]
async fn interrupted_batches_come_back_paused() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/restart.bin", &body(16));
    let h = Harness::new(remote);
    let id = interrupt_with_shutdown(&h).await;

    let stored = h.stored("restart").await.unwrap();
    assert_eq!(stored.status, DownloadBatchStatus::Downloading);
    assert_eq!(stored.files[0].downloaded_bytes, 4);

    let manager = h.start(h.config().with_network_recovery(false)).await;
    let restored = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(restored.status, DownloadBatchStatus::Paused);
    assert_eq!(restored.bytes_downloaded, 4);
    assert_eq!(
        h.stored("restart").await.unwrap().status,
        DownloadBatchStatus::Paused
    );

    h.remote.release(10);
    manager.resume(&id).await.unwrap();
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    let offsets: Vec<u64> = h.remote.starts().into_iter().map(|(_, o)| o).collect();
    assert_eq!(offsets, vec![0, 4]);
    assert_eq!(std::fs::read(h.file("restart", "restart.bin")).unwrap(), body(16));
}

#[tokio::test]
async fn recovery_resumes_restored_batches_at_startup() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/restart.bin", &body(16));
    let h = Harness::new(remote);
    let id = interrupt_with_shutdown(&h).await;

    h.remote.release(10);
    let manager = h.start(h.config()).await;
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn extra_batches_wait_for_a_free_slot() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/first.bin", &body(8));
    remote.serve("https://cdn.test/second.bin", &body(8));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    let first = manager
        .submit(Batch::with("first", "").add_file("https://cdn.test/first.bin").build())
        .await
        .unwrap();
    let second = manager
        .submit(Batch::with("second", "").add_file("https://cdn.test/second.bin").build())
        .await
        .unwrap();
    eventually("first transfer", || h.remote.starts().len() == 1).await;

    let queued = manager.get_batch_status(&second).await.unwrap().unwrap();
    assert_eq!(queued.status, DownloadBatchStatus::Queued);
    let running = manager.get_batch_status(&first).await.unwrap().unwrap();
    assert_eq!(running.status, DownloadBatchStatus::Downloading);

    h.remote.release(100);
    wait_for(&manager, &second, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    let uris: Vec<String> = h.remote.starts().into_iter().map(|(u, _)| u).collect();
    assert_eq!(uris, vec!["https://cdn.test/first.bin", "https://cdn.test/second.bin"]);
}

#[tokio::test]
async fn concurrency_limit_allows_parallel_batches() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/first.bin", &body(8));
    remote.serve("https://cdn.test/second.bin", &body(8));
    let h = Harness::new(remote);
    let manager = h.start(h.config().with_max_concurrent_batches(2)).await;

    for name in ["first", "second"] {
        manager
            .submit(
                Batch::with(name, "")
                    .add_file(format!("https://cdn.test/{name}.bin"))
                    .build(),
            )
            .await
            .unwrap();
    }
    eventually("both transfers", || h.remote.starts().len() == 2).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_writes_leave_state_untouched() {
    let remote = Remote::gated();
    remote.serve("https://cdn.test/file.bin", &body(12));
    let h = Harness::new(remote);
    let manager = h.start(h.config()).await;

    h.store.set_failing(true);
    let rejected = manager
        .submit(Batch::with("nope", "").add_file("https://cdn.test/file.bin").build())
        .await;
    assert!(matches!(rejected, Err(Error::Persistence(_))));
    assert!(manager
        .get_batch_status(&BatchId::from("nope"))
        .await
        .unwrap()
        .is_none());

    h.store.set_failing(false);
    let id = manager
        .submit(Batch::with("file", "").add_file("https://cdn.test/file.bin").build())
        .await
        .unwrap();
    eventually("transfer start", || h.remote.starts().len() == 1).await;

    h.store.set_failing(true);
    assert!(matches!(
        manager.pause(&id).await,
        Err(Error::Persistence(_))
    ));
    let unchanged = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, DownloadBatchStatus::Downloading);

    h.store.set_failing(false);
    manager.pause(&id).await.unwrap();
    let paused = manager.get_batch_status(&id).await.unwrap().unwrap();
    assert_eq!(paused.status, DownloadBatchStatus::Paused);
    manager.shutdown().await;
}

#[tokio::test]
async fn legacy_downloads_are_imported_once() {
    let remote = Remote::open();
    remote.serve("https://cdn.test/partial.bin", &body(12));
    let h = Harness::new(remote);
    let legacy = h.dir.path().join("legacy");
    std::fs::create_dir_all(&legacy).unwrap();
    std::fs::write(legacy.join("done.bin"), body(6)).unwrap();
    std::fs::write(legacy.join("partial.bin"), &body(12)[..5]).unwrap();
    let manager = h.start(h.config()).await;

    let migrations = vec![
        Migration::new(
            Batch::with("old-done", "Done")
                .add_file("https://cdn.test/done.bin")
                .build(),
            MigrationKind::Complete,
        )
        .with_file("0", legacy.join("done.bin")),
        Migration::new(
            Batch::with("old-partial", "Partial")
                .add_file("https://cdn.test/partial.bin")
                .build(),
            MigrationKind::Partial,
        )
        .with_file("0", legacy.join("partial.bin")),
    ];
    let imported = manager.import_migrations(migrations.clone()).await.unwrap();
    assert_eq!(
        imported,
        vec![BatchId::from("old-done"), BatchId::from("old-partial")]
    );

    let done = manager
        .get_batch_status(&BatchId::from("old-done"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, DownloadBatchStatus::Completed);
    assert_eq!(done.bytes_downloaded, 6);
    assert!(!legacy.join("done.bin").exists());
    assert_eq!(std::fs::read(h.file("old-done", "done.bin")).unwrap(), body(6));

    wait_for(
        &manager,
        &BatchId::from("old-partial"),
        "completion",
        is(DownloadBatchStatus::Completed),
    )
    .await;
    assert_eq!(
        h.remote.starts(),
        vec![("https://cdn.test/partial.bin".to_string(), 5)]
    );
    assert_eq!(
        std::fs::read(h.file("old-partial", "partial.bin")).unwrap(),
        body(12)
    );

    assert!(manager.import_migrations(migrations).await.unwrap().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn imported_batches_keep_their_legacy_order() {
    let h = Harness::new(Remote::open());
    let legacy = h.dir.path().join("legacy");
    std::fs::create_dir_all(&legacy).unwrap();
    std::fs::write(legacy.join("new.bin"), body(3)).unwrap();
    std::fs::write(legacy.join("old.bin"), body(4)).unwrap();
    let manager = h.start(h.config()).await;

    let older = Utc.with_ymd_and_hms(2021, 3, 1, 8, 0, 0).unwrap();
    let newer = Utc.with_ymd_and_hms(2022, 7, 9, 17, 30, 0).unwrap();
    let migrations = vec![
        Migration::new(
            Batch::with("newer", "").add_file("https://cdn.test/new.bin").build(),
            MigrationKind::Complete,
        )
        .with_file("0", legacy.join("new.bin"))
        .with_last_modified(newer),
        Migration::new(
            Batch::with("older", "").add_file("https://cdn.test/old.bin").build(),
            MigrationKind::Complete,
        )
        .with_file("0", legacy.join("old.bin"))
        .with_last_modified(older),
    ];
    manager.import_migrations(migrations).await.unwrap();
    manager.shutdown().await;

    assert_eq!(h.stored("older").await.unwrap().last_modified, older);
    assert_eq!(h.stored("newer").await.unwrap().last_modified, newer);

    let manager = h.start(h.config()).await;
    let order: Vec<String> = manager
        .get_all_batch_statuses()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.batch_id.to_string())
        .collect();
    manager.shutdown().await;
    assert_eq!(order, vec!["older", "newer"]);
}

#[tokio::test]
async fn time_throttle_still_delivers_every_status_change() {
    let remote = Remote::open();
    remote.serve("https://cdn.test/t.bin", &body(40));
    let h = Harness::new(remote);
    let config = h.config().with_throttle(ThrottleConfig::ByTime {
        interval_ms: 3_600_000,
    });
    let manager = h.start(config).await;

    let id = manager
        .submit(Batch::with("timed", "").add_file("https://cdn.test/t.bin").build())
        .await
        .unwrap();
    wait_for(&manager, &id, "completion", is(DownloadBatchStatus::Completed)).await;
    manager.shutdown().await;

    let statuses: Vec<_> = h.seen_for("timed").iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            DownloadBatchStatus::Queued,
            DownloadBatchStatus::Downloading,
            DownloadBatchStatus::Completed,
        ]
    );
}
