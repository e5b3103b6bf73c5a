//! Rolling window of call outcomes
//!
//! The window divides a trailing duration into a fixed number of buckets.
//! Buckets are addressed by epoch (elapsed time since the window was created,
//! divided by the bucket span), so rotation happens lazily on access and no
//! background thread is needed. A slot whose epoch has fallen out of the
//! window is reset when it is reused and skipped by snapshots.

use crate::OutcomeKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome counters for one time slice of the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
    epoch: u64,
}

impl Bucket {
    fn claim(&mut self, epoch: u64) {
        if self.epoch != epoch {
            *self = Bucket {
                epoch,
                ..Bucket::default()
            };
        }
    }
}

/// Aggregated view of the live buckets
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Successes plus failures (timeouts included); rejections are not calls
    pub total_calls: u64,
    pub successes: u64,
    /// Failures, timeouts included
    pub total_failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub failure_percentage: f64,
    #[serde(skip)]
    pub window_start: Instant,
    #[serde(skip)]
    pub window_end: Instant,
}

/// Thread-safe bucketed rolling window
#[derive(Debug)]
pub struct RollingWindow {
    buckets: Mutex<Vec<Bucket>>,
    bucket_span: Duration,
    /// Monotonic anchor for epoch numbering
    origin: Instant,
}

impl RollingWindow {
    /// Create a window covering `window` split into `buckets` slices
    ///
    /// `buckets` must be non-zero; `Config::validate` enforces it.
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let bucket_span = (window / buckets as u32).max(Duration::from_nanos(1));

        Self {
            buckets: Mutex::new(vec![Bucket::default(); buckets]),
            bucket_span,
            origin: Instant::now(),
        }
    }

    /// Record an outcome in the current bucket
    pub fn record(&self, outcome: OutcomeKind) {
        self.record_at(outcome, Instant::now());
    }

    /// Record a call turned away without reaching the operation
    pub fn record_rejection(&self) {
        self.with_current_bucket(Instant::now(), |bucket| bucket.rejections += 1);
    }

    /// Sum the live buckets
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Zero every bucket
    pub fn reset(&self) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            *bucket = Bucket::default();
        }
    }

    fn epoch_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_span.as_nanos()) as u64
    }

    /// Start of the bucket numbered `epoch`; `None` past `Instant`'s range
    fn epoch_start(&self, epoch: u64) -> Option<Instant> {
        let offset = self.bucket_span.as_nanos().checked_mul(u128::from(epoch))?;
        let offset = Duration::from_nanos(u64::try_from(offset).ok()?);
        self.origin.checked_add(offset)
    }

    fn with_current_bucket(&self, now: Instant, f: impl FnOnce(&mut Bucket)) {
        let epoch = self.epoch_at(now);
        let mut buckets = self.buckets.lock();
        let len = buckets.len() as u64;
        let bucket = &mut buckets[(epoch % len) as usize];
        bucket.claim(epoch);
        f(bucket);
    }

    fn record_at(&self, outcome: OutcomeKind, now: Instant) {
        self.with_current_bucket(now, |bucket| match outcome {
            outcome if outcome.is_failure() => {
                bucket.failures += 1;
                if outcome == OutcomeKind::Timeout {
                    bucket.timeouts += 1;
                }
            }
            _ => bucket.successes += 1,
        });
    }

    fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let current = self.epoch_at(now);
        let buckets = self.buckets.lock();
        let oldest = current.saturating_sub(buckets.len() as u64 - 1);

        let mut snapshot = StatsSnapshot {
            total_calls: 0,
            successes: 0,
            total_failures: 0,
            timeouts: 0,
            rejections: 0,
            failure_percentage: 0.0,
            window_start: self.epoch_start(oldest).unwrap_or(now),
            window_end: now,
        };

        for bucket in buckets
            .iter()
            .filter(|b| b.epoch >= oldest && b.epoch <= current)
        {
            snapshot.successes += bucket.successes;
            snapshot.total_failures += bucket.failures;
            snapshot.timeouts += bucket.timeouts;
            snapshot.rejections += bucket.rejections;
        }

        snapshot.total_calls = snapshot.successes + snapshot.total_failures;
        if snapshot.total_calls > 0 {
            snapshot.failure_percentage =
                snapshot.total_failures as f64 / snapshot.total_calls as f64 * 100.0;
        }

        snapshot
    }
}
