//! lite-dl - resumable batch downloads with persisted state.
//!
//! A batch groups several files that are downloaded, paused, resumed and
//! deleted together. The engine stores every batch so it survives process
//! restarts, pauses transfers when the allowed connection type goes away,
//! resumes them when it comes back, and reports throttled progress to
//! registered callbacks.
//!
//! # Example
//!
//! ```no_run
//! use lite_dl::{Batch, BatchSnapshot, DownloadManager, EngineConfig};
//!
//! # async fn example() -> lite_dl::Result<()> {
//! let manager = DownloadManager::builder(EngineConfig::default())
//!     .with_callback(|snapshot: &BatchSnapshot| {
//!         println!("{}: {} {:?}%", snapshot.batch_id, snapshot.status, snapshot.percentage);
//!     })
//!     .build()
//!     .await?;
//!
//! let batch = Batch::titled("Holiday photos")
//!     .add_file("https://example.com/photos/1.jpg")
//!     .add_file("https://example.com/photos/2.jpg")
//!     .build();
//! let id = manager.submit(batch).await?;
//!
//! manager.pause(&id).await?;
//! manager.resume(&id).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod batch;
pub mod batch_persistence;
pub mod callbacks;
pub mod config;
pub mod connection;
mod downloader;
pub mod download_batch;
pub mod error;
pub mod file_ops;
pub mod fs;
pub mod manager;
pub mod migration;
pub mod network;
pub mod persistence;
pub mod recovery;
pub mod stats;
pub mod status;
pub mod throttle;
mod worker;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export main types for convenience
pub use batch::{Batch, BatchBuilder, BatchFile, BatchId, FileId};
pub use callbacks::{CallbackId, DownloadBatchStatusCallback};
pub use config::{ConnectionType, EngineConfig, FileStorage, ThrottleConfig};
pub use connection::{ConnectivityMonitor, ManualConnectivity, NetworkState};
pub use download_batch::{DownloadBatch, DownloadFile};
pub use error::{DownloadErrorKind, Error, Result, SizeQueryError, TransferError};
pub use file_ops::{ByteStream, FileDownloader, FileSizeRequester};
pub use fs::{FilePersistence, LocalFilePersistence};
pub use manager::{DownloadManager, DownloadManagerBuilder};
pub use migration::{MigratedFile, Migration, MigrationKind};
pub use persistence::{DownloadsPersistence, InMemoryDownloadsPersistence, TomlDownloadsPersistence};
pub use status::{BatchSnapshot, DownloadBatchStatus, FileStatus, PauseReason};
pub use throttle::{CallbackThrottle, CallbackThrottleCreator, ThrottleByProgressIncrease, ThrottleByTime};
