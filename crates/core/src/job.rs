//! The job record and its derived state.
//!
//! A job row is the only state a job has. Whether it can be claimed is always
//! re-derived from `run`, `received` and `timeout`; there is no status column,
//! attempt counter or dead-letter flag. A job that fails simply stays leased
//! until `received + timeout`, after which any runner may claim it again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::payload::{JobPayload, PayloadError, PayloadMap};
use crate::time::to_time_delta;

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Handler selector; opaque to the store.
    pub name: String,
    pub payload: PayloadMap,
    /// How long a claim is honoured before the job may be claimed again.
    pub timeout: Duration,
    /// Earliest time the job may be claimed.
    pub run: DateTime<Utc>,
    /// Insertion time; claims are served oldest first.
    pub created: DateTime<Utc>,
    /// Time of the most recent claim.
    pub received: Option<DateTime<Utc>>,
}

/// State derived from a job's timestamps at a point in time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobState {
    /// `run` is still in the future.
    Scheduled { run: DateTime<Utc> },
    /// Claimable now.
    Ready,
    /// Claimed and the lease has not expired.
    Leased { until: Option<DateTime<Utc>> },
}

impl Job {
    /// When the current claim stops being honoured.
    ///
    /// `None` when the job has never been claimed, or when the lease is too
    /// long to represent (such a lease never expires).
    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        let received = self.received?;
        received.checked_add_signed(to_time_delta(self.timeout)?)
    }

    /// `run <= now` and the job is either unclaimed or its lease has expired.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state(now), JobState::Ready)
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.run > now {
            return JobState::Scheduled { run: self.run };
        }
        match (self.received, self.lease_expires_at()) {
            (None, _) => JobState::Ready,
            (Some(_), Some(until)) if until <= now => JobState::Ready,
            (Some(_), until) => JobState::Leased { until },
        }
    }

    /// Decode the payload as the typed payload registered for this job.
    pub fn decode<P: JobPayload>(&self) -> Result<P, PayloadError> {
        P::from_map(&self.payload)
    }
}
