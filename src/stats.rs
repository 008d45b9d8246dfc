//! Transfer speed and ETA estimation.

use std::time::{Duration, Instant};

/// Tracks the transfer rate of one running batch.
///
/// Speeds are averaged since the worker started, so the estimate only covers
/// bytes moved in this run, not bytes retained from earlier runs.
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    start_time: Instant,
    start_bytes: u64,
    latest_bytes: u64,
    peak_speed: u64,
}

impl SpeedTracker {
    /// Starts tracking at `bytes_already_downloaded`.
    #[must_use]
    pub fn new(bytes_already_downloaded: u64) -> Self {
        Self::starting_at(bytes_already_downloaded, Instant::now())
    }

    #[must_use]
    pub const fn starting_at(bytes_already_downloaded: u64, start_time: Instant) -> Self {
        Self {
            start_time,
            start_bytes: bytes_already_downloaded,
            latest_bytes: bytes_already_downloaded,
            peak_speed: 0,
        }
    }

    /// Records the batch's current byte count and returns the average speed.
    pub fn record(&mut self, bytes_downloaded: u64) -> u64 {
        self.record_at(bytes_downloaded, Instant::now())
    }

    /// Like [`record`](Self::record) at an explicit instant.
    pub fn record_at(&mut self, bytes_downloaded: u64, now: Instant) -> u64 {
        self.latest_bytes = self.latest_bytes.max(bytes_downloaded);
        let speed = self.average_speed_at(now);
        self.peak_speed = self.peak_speed.max(speed);
        speed
    }

    /// Average speed in bytes per second.
    #[must_use]
    pub fn average_speed(&self) -> u64 {
        self.average_speed_at(Instant::now())
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn average_speed_at(&self, now: Instant) -> u64 {
        let secs = now.saturating_duration_since(self.start_time).as_secs_f64();
        let moved = self.latest_bytes - self.start_bytes;
        if secs > 0.0 {
            (moved as f64 / secs) as u64
        } else {
            0
        }
    }

    #[must_use]
    pub const fn peak_speed(&self) -> u64 {
        self.peak_speed
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Estimated time to move `remaining` more bytes, `None` before any
    /// bytes have moved.
    #[must_use]
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        self.eta_at(remaining, Instant::now())
    }

    #[must_use]
    pub fn eta_at(&self, remaining: u64, now: Instant) -> Option<Duration> {
        let speed = self.average_speed_at(now);
        if speed == 0 {
            return None;
        }
        Some(Duration::from_secs(remaining.div_ceil(speed)))
    }
}
