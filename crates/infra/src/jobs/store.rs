//! Job storage abstraction and the in-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use courier_core::{Clock, Job, JobId, PayloadError, PayloadMap, SystemClock};

/// Durable queue of named jobs.
///
/// Delivery is at-least-once: a claimed job stays in the store until it is
/// deleted, and becomes claimable again once `received + timeout` has passed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a job that may be claimed immediately.
    async fn enqueue(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
    ) -> Result<(), JobStoreError> {
        self.enqueue_for_later(name, payload, timeout, Duration::ZERO)
            .await
    }

    /// Enqueue a job that may not be claimed until `after` has elapsed.
    async fn enqueue_for_later(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
        after: Duration,
    ) -> Result<(), JobStoreError>;

    /// Lease the oldest claimable job, if any.
    async fn claim(&self) -> Result<Option<Job>, JobStoreError>;

    /// Remove a job. Deleting a missing id is not an error.
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn enqueue(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
    ) -> Result<(), JobStoreError> {
        (**self).enqueue(name, payload, timeout).await
    }

    async fn enqueue_for_later(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
        after: Duration,
    ) -> Result<(), JobStoreError> {
        (**self)
            .enqueue_for_later(name, payload, timeout, after)
            .await
    }

    async fn claim(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim().await
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(id).await
    }
}

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("job {id} is corrupt: {reason}")]
    Corrupt { id: JobId, reason: String },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Checked form of an enqueue request, shared by every store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnqueueTimes {
    pub timeout_nanos: i64,
    pub after: chrono::Duration,
}

pub(crate) fn validate_enqueue(
    name: &str,
    timeout: Duration,
    after: Duration,
) -> Result<EnqueueTimes, JobStoreError> {
    if name.is_empty() {
        return Err(JobStoreError::InvalidJob("job name must not be empty".into()));
    }
    let timeout_nanos = i64::try_from(timeout.as_nanos())
        .map_err(|_| JobStoreError::InvalidJob(format!("timeout {timeout:?} is too large")))?;
    // Rounded up so a job never becomes claimable before the requested delay.
    let after = i64::try_from(after.as_nanos().div_ceil(1_000_000))
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .ok_or_else(|| JobStoreError::InvalidJob(format!("delay {after:?} is too large")))?;
    Ok(EnqueueTimes {
        timeout_nanos,
        after,
    })
}

/// In-memory job store for tests and single-process development.
#[derive(Debug)]
pub struct InMemoryJobStore<C: Clock = SystemClock> {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    next_id: AtomicI64,
    clock: C,
}

impl InMemoryJobStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> InMemoryJobStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }

    /// Snapshot of a stored job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    /// All stored jobs in id order.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<JobId, Job>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<C: Clock> JobStore for InMemoryJobStore<C> {
    async fn enqueue_for_later(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
        after: Duration,
    ) -> Result<(), JobStoreError> {
        let times = validate_enqueue(name, timeout, after)?;
        let now = self.clock.now();
        let run = now
            .checked_add_signed(times.after)
            .ok_or_else(|| JobStoreError::InvalidJob(format!("delay {after:?} is too large")))?;

        let id = JobId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Job {
            id,
            name: name.to_string(),
            payload: payload.clone(),
            timeout,
            run,
            created: now,
            received: None,
        };
        self.lock().insert(id, job);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.lock();

        let next = jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .min_by_key(|job| (job.created, job.id))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.received = Some(now);
            Some(job.clone())
        }))
    }

    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        self.lock().remove(&id);
        Ok(())
    }
}
