//! Resource schedulers for the fetch and decode pipelines.
//!
//! A scheduler owns a fixed pool of opaque resources (fetch slots, decode
//! worker handles) and decides which pending job gets the next free one.
//! Two interchangeable strategies implement the same contract:
//!
//! - [`LifoScheduler`]: no priority; free resources are reused
//!   most-recently-freed first, pending jobs run in FIFO order.
//! - [`PriorityScheduler`]: admission ordered by a pluggable
//!   [`Prioritizer`], with a reserved-capacity guarantee for high-priority
//!   work and cooperative yield of running jobs.
//!
//! # Contract
//!
//! A job admitted through [`ResourceScheduler::enqueue_job`] receives
//! ownership of one pool resource and must hand it back exactly once,
//! either via [`ResourceScheduler::job_done`] or by losing it through a
//! successful [`ResourceScheduler::try_yield`]. The pool invariant
//! `free + in_use == jobs_limit` holds after every transition.
//!
//! Jobs never block: a running job polls
//! [`ResourceScheduler::should_yield_or_abort`] at its own safe points and
//! cooperates by yielding. Preemption is never forced.

mod lifo;
mod priority;

pub use lifo::LifoScheduler;
pub use priority::{PriorityScheduler, PrioritySchedulerOptions};

use std::sync::Arc;

/// Scores pending work; negative means the job must be aborted, never run.
pub trait Prioritizer<C>: Send + Sync {
    /// Returns the current priority of the job owning `ctx`.
    ///
    /// Priorities are viewport-dependent and drift over time; schedulers
    /// re-invoke this lazily and during rerank passes.
    fn priority(&self, ctx: &C) -> i32;
}

/// Blanket impl so closures can serve as prioritizers in tests and simple
/// configurations.
impl<C, F> Prioritizer<C> for F
where
    F: Fn(&C) -> i32 + Send + Sync,
{
    fn priority(&self, ctx: &C) -> i32 {
        self(ctx)
    }
}

/// Callback invoked with an admitted resource and the job's context.
pub type JobFn<R, C> = Box<dyn FnOnce(R, Arc<C>) + Send>;

/// Callback invoked when the scheduler aborts a job before running it.
pub type AbortFn<C> = Box<dyn FnOnce(Arc<C>) + Send>;

/// A job submitted to a scheduler: run/abort callbacks plus its context.
pub struct ScheduledJob<R, C> {
    run: JobFn<R, C>,
    on_abort: AbortFn<C>,
    ctx: Arc<C>,
}

impl<R, C> ScheduledJob<R, C> {
    /// Creates a job from its callbacks and context.
    pub fn new(ctx: Arc<C>, run: JobFn<R, C>, on_abort: AbortFn<C>) -> Self {
        Self { run, on_abort, ctx }
    }

    /// Returns the job's context.
    pub fn ctx(&self) -> &Arc<C> {
        &self.ctx
    }

    pub(crate) fn run(self, resource: R) {
        (self.run)(resource, self.ctx);
    }

    pub(crate) fn abort(self) {
        (self.on_abort)(self.ctx);
    }
}

impl<R, C> std::fmt::Debug for ScheduledJob<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob").finish_non_exhaustive()
    }
}

/// A running job offering to give up its resource to higher-priority work.
pub struct YieldRequest<R, C> {
    /// Continuation re-enqueued as a fresh job if the yield is accepted.
    pub resume: JobFn<R, C>,
    /// Abort callback for the re-enqueued continuation.
    pub on_abort: AbortFn<C>,
    /// Invoked before the resource is handed over, so the caller can
    /// release transient state tied to it.
    pub on_yielded: Box<dyn FnOnce() + Send>,
    /// The yielding job's context.
    pub ctx: Arc<C>,
    /// The resource being offered.
    pub resource: R,
}

/// Outcome of [`ResourceScheduler::try_yield`].
pub enum TryYieldOutcome<R> {
    /// The resource went to a higher-priority job; the continuation was
    /// re-enqueued and `on_yielded` was invoked.
    Yielded,
    /// Nothing strictly higher-priority is waiting; the caller keeps the
    /// resource and resumes in place.
    Refused(R),
}

impl<R> TryYieldOutcome<R> {
    /// Returns true if the yield was accepted.
    pub fn is_yielded(&self) -> bool {
        matches!(self, Self::Yielded)
    }
}

/// Common contract of the LIFO and priority schedulers.
pub trait ResourceScheduler<R, C>: Send + Sync
where
    R: Send + 'static,
    C: Send + Sync + 'static,
{
    /// Admits a job immediately if a resource is free (and, for the
    /// priority variant, its priority clears the current threshold),
    /// otherwise queues it. Aborted jobs get `on_abort` exactly once and
    /// their run callback never fires.
    fn enqueue_job(&self, job: ScheduledJob<R, C>);

    /// Returns a resource after the job owning it finished.
    fn job_done(&self, resource: R, ctx: &Arc<C>);

    /// Polled by running jobs at safe points: should this job give up its
    /// resource (either to yield or because it is now aborted)?
    fn should_yield_or_abort(&self, ctx: &Arc<C>) -> bool;

    /// Offers the resource to a strictly higher-priority pending job.
    fn try_yield(&self, request: YieldRequest<R, C>) -> TryYieldOutcome<R>;

    /// Total pool size.
    fn jobs_limit(&self) -> usize;

    /// Currently free resources.
    fn free_count(&self) -> usize;

    /// Resources held by running jobs.
    fn in_use_count(&self) -> usize;

    /// Jobs waiting for admission.
    fn pending_count(&self) -> usize;
}
