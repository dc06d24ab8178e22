//! LIFO scheduler: a fixed pool with no priority and no yielding.
//!
//! Free resources are reused most-recently-freed first, which keeps a hot
//! resource (e.g. a decode worker with warm caches) busy instead of
//! round-robining across the pool. Pending jobs are served strictly FIFO
//! on the next [`LifoScheduler::job_done`].

use super::{ResourceScheduler, ScheduledJob, TryYieldOutcome, YieldRequest};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, trace};

/// Fixed-pool scheduler with LIFO resource reuse and FIFO job admission.
pub struct LifoScheduler<R, C> {
    inner: Mutex<Inner<R, C>>,
    jobs_limit: usize,
}

struct Inner<R, C> {
    /// Free resources; the top of the stack is the most recently freed.
    free: Vec<R>,
    /// Jobs waiting for a resource, oldest first.
    pending: VecDeque<ScheduledJob<R, C>>,
    in_use: usize,
}

impl<R, C> LifoScheduler<R, C>
where
    R: Send + 'static,
    C: Send + Sync + 'static,
{
    /// Creates a scheduler owning the given resources.
    ///
    /// The pool size is fixed at `resources.len()` for the scheduler's
    /// lifetime.
    pub fn new(resources: Vec<R>) -> Self {
        let jobs_limit = resources.len();
        Self {
            inner: Mutex::new(Inner {
                free: resources,
                pending: VecDeque::new(),
                in_use: 0,
            }),
            jobs_limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<R, C>> {
        // Callbacks always run outside the lock, so the only way to poison
        // it is a panic inside the scheduler itself.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<R, C> ResourceScheduler<R, C> for LifoScheduler<R, C>
where
    R: Send + 'static,
    C: Send + Sync + 'static,
{
    fn enqueue_job(&self, job: ScheduledJob<R, C>) {
        let admitted = {
            let mut inner = self.lock();
            match inner.free.pop() {
                Some(resource) => {
                    inner.in_use += 1;
                    Some(resource)
                }
                None => {
                    inner.pending.push_back(job);
                    trace!(pending = inner.pending.len(), "job queued, pool exhausted");
                    return;
                }
            }
        };
        if let Some(resource) = admitted {
            job.run(resource);
        }
    }

    fn job_done(&self, resource: R, _ctx: &Arc<C>) {
        let next = {
            let mut inner = self.lock();
            if inner.in_use == 0 {
                error!("job_done called with no job admitted; dropping resource return");
                inner.free.push(resource);
                return;
            }
            match inner.pending.pop_front() {
                // Hand the just-freed resource straight to the oldest waiter.
                Some(job) => Some((job, resource)),
                None => {
                    inner.in_use -= 1;
                    inner.free.push(resource);
                    None
                }
            }
        };
        if let Some((job, resource)) = next {
            job.run(resource);
        }
    }

    fn should_yield_or_abort(&self, _ctx: &Arc<C>) -> bool {
        false
    }

    fn try_yield(&self, request: YieldRequest<R, C>) -> TryYieldOutcome<R> {
        TryYieldOutcome::Refused(request.resource)
    }

    fn jobs_limit(&self) -> usize {
        self.jobs_limit
    }

    fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    fn in_use_count(&self) -> usize {
        self.lock().in_use
    }

    fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
