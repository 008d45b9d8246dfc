//! Automatic resume of network-paused batches.

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionChecker;
use crate::downloader::Command;

/// Watches connectivity changes and asks the downloader to resume
/// network-paused batches whenever the allowed connection type is available.
///
/// Resume requests go through the downloader's command queue, so repeated
/// signals never race each other for the same batch.
pub struct NetworkRecovery {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl NetworkRecovery {
    /// A recovery that never resumes anything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Starts watching connectivity.
    #[must_use]
    pub(crate) fn spawn(checker: ConnectionChecker, commands: mpsc::UnboundedSender<Command>) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(watch_connectivity(checker, commands, token.clone()));
        Self {
            token,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops watching and waits for the task to end.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for NetworkRecovery {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn watch_connectivity(
    checker: ConnectionChecker,
    commands: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
) {
    let mut rx = checker.subscribe();
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!("Connectivity monitor closed, network recovery stopping");
                    break;
                }
                let state = *rx.borrow_and_update();
                if !checker.allows(state) {
                    debug!("Connectivity changed to {state:?}, not allowed by policy");
                    continue;
                }
                info!("Allowed connection available, resuming network-paused batches");
                if commands.send(Command::ResumeNetworkPaused).is_err() {
                    break;
                }
            }
        }
    }
}
