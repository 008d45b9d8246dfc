//! Connectivity state and the allowed-connection predicate.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::ConnectionType;

/// What the host environment reports about the current network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub connected: bool,
    pub metered: bool,
}

impl NetworkState {
    /// Connected over an unmetered network.
    pub const UNMETERED: Self = Self {
        connected: true,
        metered: false,
    };

    /// Connected over a metered network.
    pub const METERED: Self = Self {
        connected: true,
        metered: true,
    };

    /// No network at all.
    pub const OFFLINE: Self = Self {
        connected: false,
        metered: false,
    };
}

/// Source of connectivity information and change signals.
pub trait ConnectivityMonitor: Send + Sync {
    /// The network state right now.
    fn current(&self) -> NetworkState;

    /// A receiver that observes every later change.
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// Connectivity set explicitly by the embedding application.
///
/// Hosts without a platform network API (and tests) push state changes with
/// [`set`](Self::set).
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a new network state to every subscriber.
    pub fn set(&self, state: NetworkState) {
        self.tx.send_replace(state);
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(NetworkState::UNMETERED)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Evaluates current connectivity against the configured policy.
///
/// Nothing is cached: every call reads the monitor afresh.
#[derive(Clone)]
pub struct ConnectionChecker {
    monitor: Arc<dyn ConnectivityMonitor>,
    connection_type: ConnectionType,
}

impl ConnectionChecker {
    #[must_use]
    pub fn new(monitor: Arc<dyn ConnectivityMonitor>, connection_type: ConnectionType) -> Self {
        Self {
            monitor,
            connection_type,
        }
    }

    #[must_use]
    pub const fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// True iff a network is present and, under
    /// [`ConnectionType::UnmeteredOnly`], it is not metered.
    #[must_use]
    pub fn is_allowed_connection_available(&self) -> bool {
        self.allows(self.monitor.current())
    }

    /// Applies the policy to a given state.
    #[must_use]
    pub const fn allows(&self, state: NetworkState) -> bool {
        match self.connection_type {
            ConnectionType::All => state.connected,
            ConnectionType::UnmeteredOnly => state.connected && !state.metered,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.monitor.subscribe()
    }
}
