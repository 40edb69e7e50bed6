//! Job handlers and the name-to-handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use courier_core::{Job, JobId, JobPayload, PayloadError, PayloadMap};

/// Why a handler run did not succeed. Every variant leaves the job in the
/// store to be claimed again once its lease expires.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for job name {0:?}")]
    NotRegistered(String),

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("handler did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler cancelled by runner shutdown")]
    Cancelled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(anyhow::Error::msg(msg.into()))
    }

    /// Retrying cannot help: the job will fail the same way on every claim.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NotRegistered(_) | Self::Payload(_))
    }
}

/// Per-run context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    name: Arc<str>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, name: &str, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            name: Arc::from(name),
            deadline: Instant::now().checked_add(timeout),
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the runner stops waiting for this handler. `None` for timeouts
    /// too long to represent.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the runner abandons this job during shutdown.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Something that can run a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: PayloadMap) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, PayloadMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: PayloadMap) -> Result<(), HandlerError> {
        (self.0)(ctx, payload).await
    }
}

struct PayloadHandler<P, F> {
    f: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for PayloadHandler<P, F>
where
    P: JobPayload,
    F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: PayloadMap) -> Result<(), HandlerError> {
        let payload = P::from_map(&payload)?;
        (self.f)(ctx, payload).await
    }
}

/// Maps job names to handlers.
///
/// Built once at startup and shared read-only with the runner.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for `name`.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(job_name = %name, "replacing previously registered job handler");
        }
        self
    }

    /// Register an async closure over the raw payload map.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JobContext, PayloadMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(name, FnHandler(f))
    }

    /// Register an async closure under `P::NAME`, decoding the payload as `P`
    /// before the closure runs.
    pub fn register_payload<P, F, Fut>(&mut self, f: F) -> &mut Self
    where
        P: JobPayload,
        F: Fn(JobContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(
            P::NAME,
            PayloadHandler {
                f,
                _payload: PhantomData,
            },
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler registered for `job.name`.
    pub async fn dispatch(&self, ctx: JobContext, job: &Job) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(&job.name)
            .ok_or_else(|| HandlerError::NotRegistered(job.name.clone()))?;
        handler.handle(ctx, job.payload.clone()).await
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Registry").field("handlers", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use courier_core::{SendEmail, Token};

    fn job(name: &str, payload: PayloadMap) -> Job {
        Job {
            id: JobId::new(7),
            name: name.to_string(),
            payload,
            timeout: Duration::from_secs(1),
            run: Utc::now(),
            created: Utc::now(),
            received: None,
        }
    }

    fn ctx(job: &Job) -> JobContext {
        JobContext::new(job.id, &job.name, job.timeout, CancellationToken::new())
    }

    #[tokio::test]
    async fn dispatches_by_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        let seen = calls.clone();
        registry.register_fn("count", move |ctx, payload| {
            let seen = seen.clone();
            async move {
                assert_eq!(ctx.name(), "count");
                assert_eq!(payload.get("k"), Some("v"));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let j = job("count", PayloadMap::new().with("k", "v"));
        registry.dispatch(ctx(&j), &j).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_name_is_not_registered() {
        let registry = Registry::new();
        let j = job("nope", PayloadMap::new());
        let err = registry.dispatch(ctx(&j), &j).await.unwrap_err();
        assert!(matches!(err, HandlerError::NotRegistered(ref n) if n == "nope"));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let mut registry = Registry::new();
        registry.register_payload(|_ctx, email: SendEmail| async move {
            assert_eq!(email.token.as_str(), "t_abc");
            Ok(())
        });
        assert!(registry.contains("send-email"));

        let good = job(
            "send-email",
            SendEmail::login(Token::new("t_abc")).to_map(),
        );
        registry.dispatch(ctx(&good), &good).await.unwrap();

        let bad = job(
            "send-email",
            PayloadMap::new().with("type", "newsletter").with("token", "t_abc"),
        );
        let err = registry.dispatch(ctx(&bad), &bad).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Payload(PayloadError::UnknownEmailType(_))
        ));
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let mut registry = Registry::new();
        registry.register_fn("x", |_ctx, _p| async { Err(HandlerError::failed("old")) });
        registry.register_fn("x", |_ctx, _p| async { Ok(()) });
        assert_eq!(registry.len(), 1);

        let j = job("x", PayloadMap::new());
        registry.dispatch(ctx(&j), &j).await.unwrap();
    }

    #[test]
    fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(JobId::new(1), "x", Duration::from_secs(5), token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.remaining().is_some());
    }
}
