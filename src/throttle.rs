//! Callback throttling.
//!
//! Every snapshot the engine wants to publish passes through a
//! [`ThrottleGate`], which asks the configured [`CallbackThrottle`] whether
//! to deliver it. The gate itself guarantees that terminal statuses are
//! never suppressed, whatever the strategy says.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::batch::BatchId;
use crate::config::ThrottleConfig;
use crate::status::{BatchSnapshot, DownloadBatchStatus};

/// The last update actually delivered for a batch.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub snapshot: BatchSnapshot,
    pub at: Instant,
}

/// Decides whether a progress update is delivered now or suppressed.
///
/// Implementations must be a pure function of their arguments; the gate
/// keeps the per-batch history.
pub trait CallbackThrottle: Send + Sync {
    fn should_deliver(
        &self,
        batch_id: &BatchId,
        previous: Option<&Delivered>,
        next: &BatchSnapshot,
        now: Instant,
    ) -> bool;
}

/// At most one update per `interval` per batch. The first update and any
/// status change are delivered immediately.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleByTime {
    interval: Duration,
}

impl ThrottleByTime {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl CallbackThrottle for ThrottleByTime {
    fn should_deliver(
        &self,
        _batch_id: &BatchId,
        previous: Option<&Delivered>,
        next: &BatchSnapshot,
        now: Instant,
    ) -> bool {
        previous.is_none_or(|prev| {
            prev.snapshot.status != next.status
                || now.saturating_duration_since(prev.at) >= self.interval
        })
    }
}

/// Delivers only when the integer percentage strictly increases, counting
/// from zero. Status changes are delivered regardless of percentage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleByProgressIncrease;

impl CallbackThrottle for ThrottleByProgressIncrease {
    fn should_deliver(
        &self,
        _batch_id: &BatchId,
        previous: Option<&Delivered>,
        next: &BatchSnapshot,
        _now: Instant,
    ) -> bool {
        match previous {
            None => {
                next.status != DownloadBatchStatus::Downloading || next.percentage_or_zero() > 0
            }
            Some(prev) => {
                prev.snapshot.status != next.status
                    || next.percentage_or_zero() > prev.snapshot.percentage_or_zero()
            }
        }
    }
}

/// Strategy selected once at engine construction.
#[derive(Clone)]
pub enum CallbackThrottleCreator {
    ByTime(Duration),
    ByProgressIncrease,
    Custom(Arc<dyn CallbackThrottle>),
}

impl fmt::Debug for CallbackThrottleCreator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByTime(interval) => f.debug_tuple("ByTime").field(interval).finish(),
            Self::ByProgressIncrease => f.write_str("ByProgressIncrease"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl CallbackThrottleCreator {
    #[must_use]
    pub const fn by_time(interval: Duration) -> Self {
        Self::ByTime(interval)
    }

    #[must_use]
    pub const fn by_progress_increase() -> Self {
        Self::ByProgressIncrease
    }

    #[must_use]
    pub fn by_custom(throttle: impl CallbackThrottle + 'static) -> Self {
        Self::Custom(Arc::new(throttle))
    }

    /// Creates the gate that applies this strategy.
    #[must_use]
    pub fn create(&self) -> ThrottleGate {
        let strategy: Arc<dyn CallbackThrottle> = match self {
            Self::ByTime(interval) => Arc::new(ThrottleByTime::new(*interval)),
            Self::ByProgressIncrease => Arc::new(ThrottleByProgressIncrease),
            Self::Custom(throttle) => Arc::clone(throttle),
        };
        ThrottleGate {
            strategy,
            delivered: HashMap::new(),
        }
    }
}

impl From<&ThrottleConfig> for CallbackThrottleCreator {
    fn from(config: &ThrottleConfig) -> Self {
        match config {
            ThrottleConfig::ByTime { interval_ms } => {
                Self::ByTime(Duration::from_millis(*interval_ms))
            }
            ThrottleConfig::ByProgressIncrease => Self::ByProgressIncrease,
        }
    }
}

/// Applies a throttle strategy and remembers what was delivered per batch.
pub struct ThrottleGate {
    strategy: Arc<dyn CallbackThrottle>,
    delivered: HashMap<BatchId, Delivered>,
}

impl ThrottleGate {
    /// Returns true if `snapshot` should be delivered now, recording it as
    /// the last delivered update when it is.
    pub fn offer(&mut self, snapshot: &BatchSnapshot, now: Instant) -> bool {
        let previous = self.delivered.get(&snapshot.batch_id);
        if let Some(prev) = previous
            && prev.snapshot == *snapshot
        {
            return false;
        }
        let deliver = snapshot.status.is_terminal()
            || self
                .strategy
                .should_deliver(&snapshot.batch_id, previous, snapshot, now);
        if deliver {
            self.delivered.insert(
                snapshot.batch_id.clone(),
                Delivered {
                    snapshot: snapshot.clone(),
                    at: now,
                },
            );
        }
        deliver
    }

    /// Drops the history of a batch that no longer exists.
    pub fn forget(&mut self, batch_id: &BatchId) {
        self.delivered.remove(batch_id);
    }
}
