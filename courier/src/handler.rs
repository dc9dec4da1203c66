use std::{future::Future, marker::PhantomData};

use crate::{
    job_envelope::{JobId, JobMeta},
    retry::FailureKind,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler returns when an attempt fails.
///
/// `Retryable` failures are attempted again with backoff until the job runs out
/// of attempts. `Fatal` failures go to the dead set right away.
///
/// Does not implement [`std::error::Error`] itself, so that any error converts into
/// it with `?`.
#[derive(Debug)]
pub enum JobError {
    Retryable(BoxError),
    Fatal(BoxError),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Retryable(e) | JobError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl JobError {
    pub fn retryable(error: impl Into<BoxError>) -> Self {
        JobError::Retryable(error.into())
    }

    pub fn fatal(error: impl Into<BoxError>) -> Self {
        JobError::Fatal(error.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Retryable(_) => FailureKind::Retryable,
            JobError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Any error converts into a retryable failure, so `?` works inside handlers.
impl<E> From<E> for JobError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        JobError::Retryable(Box::new(error))
    }
}

/// What a handler sees besides the job itself.
///
/// Leases, retries and the store stay out of reach: a handler only learns which
/// attempt it is running.
#[derive(Debug, Clone)]
pub struct Context<C> {
    pub ctx: C,
    pub job_id: JobId,
    pub queue: String,
    pub meta: JobMeta,
}

impl<C> Context<C> {
    /// 1 on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.meta.attempts + 1
    }
}

/// Business logic for the jobs of one queue.
#[async_trait::async_trait]
pub trait Handler<J, C>: Send + Sync + 'static
where
    J: Send + 'static,
    C: Send + Sync + 'static,
{
    async fn handle(&self, job: J, ctx: &Context<C>) -> Result<(), JobError>;
}

/// Wraps an async closure as a [`Handler`].
///
/// ```rust
/// use courier::{Context, JobError, handler_fn};
///
/// let handler = handler_fn(|job: String, _ctx: &Context<()>| {
///     let len = job.len();
///     async move {
///         if len == 0 {
///             return Err(JobError::fatal("empty"));
///         }
///         Ok(())
///     }
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<J, C, F, Fut>(f: F) -> FnHandler<J, C, F>
where
    F: Fn(J, &Context<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

pub struct FnHandler<J, C, F> {
    f: F,
    _marker: PhantomData<fn(J, C)>,
}

#[async_trait::async_trait]
impl<J, C, F, Fut> Handler<J, C> for FnHandler<J, C, F>
where
    J: Send + 'static,
    C: Send + Sync + 'static,
    F: Fn(J, &Context<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: J, ctx: &Context<C>) -> Result<(), JobError> {
        (self.f)(job, ctx).await
    }
}
