//! Progress accounting shared by the downloader and the uploader
//!
//! A [`ProgressMeter`] counts bytes, derives throughput, and decides (via
//! [`ThrottlePolicy`]) whether a snapshot is worth reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Point-in-time view of a running byte transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Bytes moved so far
    pub bytes: u64,
    /// Expected total, when the other side declared one
    pub total: Option<u64>,
    /// Average rate since the transfer started
    pub bytes_per_sec: f64,
}

impl Progress {
    /// Progress of a transfer that has not moved any bytes yet
    pub fn start(total: Option<u64>) -> Self {
        Self {
            bytes: 0,
            total,
            bytes_per_sec: 0.0,
        }
    }

    /// Whole percent, clamped to 100; `None` when the total is unknown
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => Some(((self.bytes.saturating_mul(100)) / total).min(100) as u8),
            None => None,
        }
    }
}

/// Progress callback function type
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// How often a progress snapshot may be emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    /// Emit once the percentage advanced by at least this much
    pub min_step_percent: u8,
    /// Emit once this much time passed since the last emission
    pub min_interval: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            min_step_percent: 10,
            min_interval: Duration::from_secs(5),
        }
    }
}

/// Counts bytes for one transfer and throttles what gets reported
#[derive(Debug)]
pub struct ProgressMeter {
    policy: ThrottlePolicy,
    started: Instant,
    bytes: u64,
    total: Option<u64>,
    last_percent: Option<u8>,
    last_emit: Instant,
}

impl ProgressMeter {
    pub fn new(total: Option<u64>, policy: ThrottlePolicy) -> Self {
        Self::starting_at(total, policy, Instant::now())
    }

    /// Meter whose clock starts at `now`
    pub fn starting_at(total: Option<u64>, policy: ThrottlePolicy, now: Instant) -> Self {
        Self {
            policy,
            started: now,
            bytes: 0,
            total,
            last_percent: Some(0).filter(|_| total.is_some()),
            last_emit: now,
        }
    }

    /// Bytes recorded so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Current snapshot, regardless of throttling
    pub fn snapshot_at(&self, now: Instant) -> Progress {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let bytes_per_sec = if elapsed > 0.0 {
            self.bytes as f64 / elapsed
        } else {
            0.0
        };
        Progress {
            bytes: self.bytes,
            total: self.total,
            bytes_per_sec,
        }
    }

    pub fn snapshot(&self) -> Progress {
        self.snapshot_at(Instant::now())
    }

    /// Records `n` more bytes; returns a snapshot when one is due
    pub fn record(&mut self, n: u64) -> Option<Progress> {
        self.record_at(n, Instant::now())
    }

    pub fn record_at(&mut self, n: u64, now: Instant) -> Option<Progress> {
        self.bytes = self.bytes.saturating_add(n);
        let progress = self.snapshot_at(now);

        let step_due = match (progress.percent(), self.last_percent) {
            (Some(current), Some(last)) => {
                current >= last.saturating_add(self.policy.min_step_percent)
                    || (current == 100 && last < 100)
            }
            (Some(_), None) => true,
            _ => false,
        };
        let time_due = now.saturating_duration_since(self.last_emit) >= self.policy.min_interval;

        if step_due || time_due {
            self.last_emit = now;
            if let Some(current) = progress.percent() {
                self.last_percent = Some(current);
            }
            Some(progress)
        } else {
            None
        }
    }
}
