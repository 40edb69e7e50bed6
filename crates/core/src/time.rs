//! Clock abstraction for stamping and evaluating jobs.
//!
//! Every timestamp the job store writes (`created`, `run`, `received`) and
//! every eligibility check it performs reads the time from a [`Clock`].
//! Production code uses [`SystemClock`]; tests inject a [`ManualClock`] and
//! move time forward explicitly to exercise leases and delayed jobs.
//!
//! Timestamps are kept at millisecond resolution, which is what the store
//! persists.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + core::fmt::Debug {
    /// Current time, truncated to milliseconds.
    fn now(&self) -> DateTime<Utc>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_millis(Utc::now())
    }
}

/// Clock that only moves when told to.
///
/// Cloning shares the underlying time, so a test can hand one clone to a store
/// and keep another to advance it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start at the given instant (sub-millisecond precision is dropped).
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::at(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::AcqRel);
    }

    /// Jump to an absolute instant, forwards or backwards.
    pub fn set(&self, to: DateTime<Utc>) {
        self.millis.store(to.timestamp_millis(), Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = self.millis.load(Ordering::Acquire);
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Drop sub-millisecond precision.
pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// Convert a std duration into a chrono one, `None` if it does not fit.
pub fn to_time_delta(d: Duration) -> Option<chrono::Duration> {
    chrono::Duration::from_std(d).ok()
}
