//! Job runner: polls a [`JobStore`] and runs claimed jobs with bounded
//! concurrency.
//!
//! On every poll tick the runner claims jobs until either the store has
//! nothing claimable or all `job_limit` worker slots are busy. Each claimed job
//! runs on its own task under the job's timeout. Success deletes the job; any
//! failure leaves it in the store, so it is retried once its lease expires.
//!
//! Shutdown stops polling, then waits up to `shutdown_timeout` for in-flight
//! jobs. Jobs still running after that are cancelled; their rows are reclaimed
//! by a later runner when their leases run out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use courier_core::Job;
use courier_observability::metrics::{
    JOB_CLAIM_ERRORS, JOB_DURATION, JOBS_CLAIMED, JOBS_FAILED,
    JOBS_SUCCEEDED, LABEL_JOB_NAME,
};

use super::registry::{HandlerError, JobContext, Registry};
use super::store::JobStore;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum jobs running at once
    pub job_limit: usize,
    /// How often to poll for claimable jobs
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "job-runner".to_string(),
            job_limit: 5,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_job_limit(mut self, limit: usize) -> Self {
        self.job_limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Live runner counters.
#[derive(Debug, Default)]
pub struct RunnerStats {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    claim_errors: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Point-in-time copy of [`RunnerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStatsSnapshot {
    pub claimed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub claim_errors: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl RunnerStats {
    pub fn snapshot(&self) -> RunnerStatsSnapshot {
        RunnerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    fn enter(self: &Arc<Self>) -> InFlight {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        InFlight(self.clone())
    }
}

/// Decrements `in_flight` when a job task ends, including when it is aborted.
struct InFlight(Arc<RunnerStats>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to control a spawned runner.
#[derive(Debug)]
pub struct RunnerHandle {
    shutdown: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<RunnerStats>,
}

impl RunnerHandle {
    /// Stop polling and wait for the runner to drain.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "job runner task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> RunnerStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Background job runner.
pub struct Runner<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<Registry>,
    config: RunnerConfig,
    stats: Arc<RunnerStats>,
}

impl<S: JobStore + ?Sized + 'static> Runner<S> {
    pub fn new(store: Arc<S>, registry: Arc<Registry>, config: RunnerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    /// Run on a background task until [`RunnerHandle::shutdown`].
    pub fn spawn(self) -> RunnerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let join = tokio::spawn(self.run(shutdown.clone()));
        RunnerHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }

    /// Poll until `shutdown` is cancelled, then drain in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) {
        let job_limit = if self.config.job_limit == 0 {
            warn!(runner = %self.config.name, "job_limit of 0 would never run a job; using 1");
            1
        } else {
            self.config.job_limit
        };

        info!(
            runner = %self.config.name,
            job_limit,
            poll_interval = ?self.config.poll_interval,
            handlers = ?self.registry,
            "job runner started"
        );

        let slots = Arc::new(Semaphore::new(job_limit));
        let abandon = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.on_joined(joined);
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.claim_available(&slots, &mut tasks, &shutdown, &abandon)
                .await;
        }

        self.drain(tasks, abandon).await;
        info!(runner = %self.config.name, stats = ?self.stats.snapshot(), "job runner stopped");
    }

    async fn claim_available(
        &self,
        slots: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
        abandon: &CancellationToken,
    ) {
        while !shutdown.is_cancelled() {
            let Ok(permit) = slots.clone().try_acquire_owned() else {
                debug!(runner = %self.config.name, "all worker slots busy");
                return;
            };

            match self.store.claim().await {
                Ok(Some(job)) => self.start(job, permit, tasks, abandon),
                Ok(None) => return,
                Err(e) => {
                    self.stats.claim_errors.fetch_add(1, Ordering::Relaxed);
                    counter!(JOB_CLAIM_ERRORS).increment(1);
                    error!(runner = %self.config.name, error = %e, "failed to claim job");
                    return;
                }
            }
        }
    }

    fn start(
        &self,
        job: Job,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<()>,
        abandon: &CancellationToken,
    ) {
        self.stats.claimed.fetch_add(1, Ordering::Relaxed);
        counter!(JOBS_CLAIMED, LABEL_JOB_NAME => job.name.clone()).increment(1);
        debug!(
            runner = %self.config.name,
            job_id = %job.id,
            job_name = %job.name,
            "claimed job"
        );

        let span = info_span!("job", runner = %self.config.name, job_id = %job.id, job_name = %job.name);
        let worker = Worker {
            store: self.store.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            cancel: abandon.child_token(),
        };
        tasks.spawn(worker.execute(job, permit).instrument(span));
    }

    async fn drain(&self, mut tasks: JoinSet<()>, abandon: CancellationToken) {
        if tasks.is_empty() {
            return;
        }
        info!(
            runner = %self.config.name,
            in_flight = tasks.len(),
            timeout = ?self.config.shutdown_timeout,
            "waiting for in-flight jobs"
        );

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                self.on_joined(joined);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                runner = %self.config.name,
                abandoned = tasks.len(),
                "shutdown timeout elapsed; abandoning in-flight jobs until their leases expire"
            );
            abandon.cancel();
            tasks.shutdown().await;
        }
    }

    fn on_joined(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(runner = %self.config.name, error = %e, "job task panicked outside its handler");
            }
        }
    }
}

/// Everything a job task needs, detached from the runner.
struct Worker<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<Registry>,
    stats: Arc<RunnerStats>,
    cancel: CancellationToken,
}

impl<S: JobStore + ?Sized> Worker<S> {
    async fn execute(self, job: Job, _permit: OwnedSemaphorePermit) {
        let _in_flight = self.stats.enter();
        let ctx = JobContext::new(job.id, &job.name, job.timeout, self.cancel.clone());

        let started = Instant::now();
        let outcome = self.run_handler(ctx, &job).await;
        let elapsed = started.elapsed();
        histogram!(JOB_DURATION, LABEL_JOB_NAME => job.name.clone())
            .record(elapsed.as_secs_f64());

        match outcome {
            Ok(()) => match self.store.delete(job.id).await {
                Ok(()) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    counter!(JOBS_SUCCEEDED, LABEL_JOB_NAME => job.name.clone())
                        .increment(1);
                    info!(elapsed_ms = elapsed.as_millis() as u64, "job succeeded");
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!(JOBS_FAILED, LABEL_JOB_NAME => job.name.clone()).increment(1);
                    error!(
                        error = %e,
                        "job succeeded but could not be deleted; it will run again after its lease expires"
                    );
                }
            },
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                counter!(JOBS_FAILED, LABEL_JOB_NAME => job.name.clone()).increment(1);
                error!(
                    error = %e,
                    permanent = e.is_permanent(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    retry_after = ?job.timeout,
                    "job failed; it stays queued and is retried when its lease expires"
                );
            }
        }
    }

    async fn run_handler(&self, ctx: JobContext, job: &Job) -> Result<(), HandlerError> {
        let handler = AssertUnwindSafe(self.registry.dispatch(ctx, job)).catch_unwind();

        tokio::select! {
            res = tokio::time::timeout(job.timeout, handler) => match res {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
                Err(_) => Err(HandlerError::TimedOut(job.timeout)),
            },
            () = self.cancel.cancelled() => Err(HandlerError::Cancelled),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    use courier_core::PayloadMap;

    use crate::jobs::store::{InMemoryJobStore, JobStoreError};

    fn config() -> RunnerConfig {
        RunnerConfig::default()
            .with_name("test-runner")
            .with_poll_interval(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn enqueue(store: &InMemoryJobStore, name: &str, timeout: Duration) {
        store
            .enqueue(name, &PayloadMap::new(), timeout)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn successful_job_is_deleted() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("ok", |_ctx, _payload| async { Ok(()) });
        enqueue(&store, "ok", Duration::from_secs(10)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| store.is_empty()).await;
        handle.shutdown_and_check(|s| {
            assert_eq!(s.claimed, 1);
            assert_eq!(s.succeeded, 1);
            assert_eq!(s.failed, 0);
        })
        .await;
    }

    #[tokio::test]
    async fn failed_job_stays_leased() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("boom", |_ctx, _payload| async {
            Err(HandlerError::failed("boom"))
        });
        enqueue(&store, "boom", Duration::from_secs(60)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| handle.stats().failed == 1).await;

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].received.is_some());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unregistered_job_is_kept_for_retry() {
        let store = InMemoryJobStore::arc();
        enqueue(&store, "nobody-handles-this", Duration::from_secs(60)).await;

        let handle = Runner::new(store.clone(), Arc::new(Registry::new()), config()).spawn();
        wait_for(|| handle.stats().failed == 1).await;
        assert_eq!(store.len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_runner() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("panic", |_ctx, _payload| async {
            panic!("handler blew up");
        });
        registry.register_fn("ok", |_ctx, _payload| async { Ok(()) });
        enqueue(&store, "panic", Duration::from_secs(60)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| handle.stats().failed == 1).await;

        enqueue(&store, "ok", Duration::from_secs(60)).await;
        wait_for(|| handle.stats().succeeded == 1).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.jobs()[0].name, "panic");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn slow_handler_times_out_and_is_retried() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("slow", |_ctx, _payload| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        enqueue(&store, "slow", Duration::from_millis(20)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| handle.stats().failed >= 2).await;
        assert!(handle.stats().claimed >= 2);
        assert_eq!(store.len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn respects_job_limit() {
        let store = InMemoryJobStore::arc();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut registry = Registry::new();
        let (r, p) = (running.clone(), peak.clone());
        registry.register_fn("work", move |_ctx, _payload| {
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for _ in 0..6 {
            enqueue(&store, "work", Duration::from_secs(60)).await;
        }

        let handle = Runner::new(
            store.clone(),
            Arc::new(registry),
            config().with_job_limit(2),
        )
        .spawn();
        wait_for(|| store.is_empty()).await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        handle.shutdown_and_check(|s| {
            assert_eq!(s.claimed, 6);
            assert_eq!(s.succeeded, 6);
            assert!(s.peak_in_flight <= 2);
        })
        .await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_jobs() {
        let store = InMemoryJobStore::arc();
        let finished = Arc::new(AtomicBool::new(false));

        let mut registry = Registry::new();
        let f = finished.clone();
        registry.register_fn("work", move |_ctx, _payload| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                f.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        enqueue(&store, "work", Duration::from_secs(60)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| handle.stats().in_flight == 1).await;
        handle.shutdown().await;

        assert!(finished.load(Ordering::SeqCst));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn shutdown_timeout_abandons_stuck_jobs() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("stuck", |_ctx, _payload| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        enqueue(&store, "stuck", Duration::from_secs(120)).await;

        let runner = Runner::new(
            store.clone(),
            Arc::new(registry),
            config().with_shutdown_timeout(Duration::from_millis(50)),
        );
        let stats = runner.stats();
        let handle = runner.spawn();
        wait_for(|| stats.snapshot().in_flight == 1).await;

        let started = Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.snapshot().in_flight, 0);
        assert_eq!(store.len(), 1);
    }

    /// Store whose first `failures` claims hit a storage error.
    struct FlakyStore {
        inner: InMemoryJobStore,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JobStore for FlakyStore {
        async fn enqueue_for_later(
            &self,
            name: &str,
            payload: &PayloadMap,
            timeout: Duration,
            after: Duration,
        ) -> Result<(), JobStoreError> {
            self.inner
                .enqueue_for_later(name, payload, timeout, after)
                .await
        }

        async fn claim(&self) -> Result<Option<Job>, JobStoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(JobStoreError::Storage(sqlx::Error::PoolTimedOut));
            }
            self.inner.claim().await
        }

        async fn delete(&self, id: courier_core::JobId) -> Result<(), JobStoreError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn claim_errors_are_counted_and_polling_continues() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryJobStore::new(),
            failures: AtomicUsize::new(3),
        });
        let mut registry = Registry::new();
        registry.register_fn("ok", |_ctx, _payload| async { Ok(()) });
        enqueue(&store.inner, "ok", Duration::from_secs(60)).await;

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| store.inner.is_empty()).await;
        handle
            .shutdown_and_check(|s| {
                assert_eq!(s.claim_errors, 3);
                assert_eq!(s.claimed, 1);
                assert_eq!(s.succeeded, 1);
            })
            .await;
    }

    #[tokio::test]
    async fn failed_job_keeps_everything_but_its_received_stamp() {
        let store = InMemoryJobStore::arc();
        let mut registry = Registry::new();
        registry.register_fn("boom", |_ctx, _payload| async {
            Err(HandlerError::failed("boom"))
        });
        store
            .enqueue_for_later(
                "boom",
                &PayloadMap::new().with("k", "v"),
                Duration::from_secs(60),
                Duration::ZERO,
            )
            .await
            .unwrap();
        let before = store.jobs().remove(0);
        assert!(before.received.is_none());

        let handle = Runner::new(store.clone(), Arc::new(registry), config()).spawn();
        wait_for(|| handle.stats().failed == 1).await;
        handle.shutdown().await;

        let after = store.get(before.id).expect("job retained");
        assert!(after.received.is_some());
        assert_eq!(Job { received: None, ..after }, before);
    }

    impl RunnerHandle {
        async fn shutdown_and_check(self, check: impl FnOnce(RunnerStatsSnapshot)) {
            let stats = self.stats.clone();
            self.shutdown().await;
            check(stats.snapshot());
        }
    }
}
