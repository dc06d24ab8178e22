//! Priority scheduler with reserved capacity, aged buckets and yield.
//!
//! Admission is ordered by a pluggable [`Prioritizer`]. Because priorities
//! are viewport-dependent and drift while jobs wait, pending work lives in
//! two tiers:
//!
//! - a bounded **recent** list holding the most recently enqueued jobs,
//!   re-scored lazily on every admission attempt;
//! - **aged** buckets indexed by the score a job had when it left the
//!   recent list, re-validated lazily as buckets are scanned and fully
//!   re-scored every `num_jobs_before_rerank_old_priorities` schedules.
//!
//! A slice of the pool can be reserved for high-priority work: when free
//! resources drop to `resources_guaranteed_for_high_priority`, only jobs
//! scoring at least `high_priority_to_guarantee_resource` are admitted.
//! Low-priority admission starves temporarily, which is the point - the
//! viewport's tiles keep low latency under load.
//!
//! Running jobs cooperate via the yield protocol: they poll
//! [`ResourceScheduler::should_yield_or_abort`] and offer their resource
//! with [`ResourceScheduler::try_yield`]; the scheduler hands it to a
//! strictly higher-priority pending job and re-enqueues the yielder's
//! continuation.

use super::{Prioritizer, ResourceScheduler, ScheduledJob, TryYieldOutcome, YieldRequest};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace};

/// Tuning knobs for [`PriorityScheduler`].
#[derive(Debug, Clone)]
pub struct PrioritySchedulerOptions {
    /// Capacity of the recent pending list before jobs age out into the
    /// priority buckets.
    pub num_new_jobs: usize,

    /// Number of admissions between full reranks of all pending jobs.
    pub num_jobs_before_rerank_old_priorities: usize,

    /// Free resources kept in reserve for high-priority jobs.
    pub resources_guaranteed_for_high_priority: usize,

    /// Minimum priority allowed to consume the reserved resources.
    pub high_priority_to_guarantee_resource: i32,
}

impl Default for PrioritySchedulerOptions {
    fn default() -> Self {
        Self {
            num_new_jobs: 20,
            num_jobs_before_rerank_old_priorities: 20,
            resources_guaranteed_for_high_priority: 0,
            high_priority_to_guarantee_resource: 0,
        }
    }
}

/// An aged pending job with the score it was bucketed under.
struct AgedJob<R, C> {
    job: ScheduledJob<R, C>,
    bucket_priority: i32,
}

struct Inner<R, C> {
    free: Vec<R>,
    in_use: usize,
    /// Most recently enqueued pending jobs, oldest at the front.
    recent: VecDeque<ScheduledJob<R, C>>,
    /// Aged pending jobs bucketed by recorded priority.
    aged: Vec<Vec<AgedJob<R, C>>>,
    pending_count: usize,
    schedules_since_rerank: usize,
}

/// Deferred callback work, executed after the scheduler lock is released
/// so user callbacks may re-enter the scheduler freely.
enum Action<R, C> {
    Run(ScheduledJob<R, C>, R),
    Abort(ScheduledJob<R, C>),
}

/// Scheduler admitting jobs by priority under a fixed resource pool.
pub struct PriorityScheduler<R, C> {
    prioritizer: Arc<dyn Prioritizer<C>>,
    options: PrioritySchedulerOptions,
    jobs_limit: usize,
    inner: Mutex<Inner<R, C>>,
}

impl<R, C> PriorityScheduler<R, C>
where
    R: Send + 'static,
    C: Send + Sync + 'static,
{
    /// Creates a scheduler owning `resources`, scored by `prioritizer`.
    pub fn new(
        resources: Vec<R>,
        prioritizer: Arc<dyn Prioritizer<C>>,
        options: PrioritySchedulerOptions,
    ) -> Self {
        let jobs_limit = resources.len();
        Self {
            prioritizer,
            options,
            jobs_limit,
            inner: Mutex::new(Inner {
                free: resources,
                in_use: 0,
                recent: VecDeque::new(),
                aged: Vec::new(),
                pending_count: 0,
                schedules_since_rerank: 0,
            }),
        }
    }

    /// Creates a scheduler with default options.
    pub fn with_defaults(resources: Vec<R>, prioritizer: Arc<dyn Prioritizer<C>>) -> Self {
        Self::new(resources, prioritizer, PrioritySchedulerOptions::default())
    }

    /// Jobs currently waiting in the recent tier.
    pub fn recent_pending_count(&self) -> usize {
        self.lock().recent.len()
    }

    /// Jobs currently waiting in the aged buckets.
    pub fn aged_pending_count(&self) -> usize {
        self.lock().aged.iter().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<R, C>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn score(&self, ctx: &Arc<C>) -> i32 {
        self.prioritizer.priority(ctx)
    }

    /// Priority floor for taking a free resource given the current free
    /// count: the last reserved resources only go to high-priority work.
    fn min_priority_to_schedule(&self, free_count: usize) -> i32 {
        if free_count <= self.options.resources_guaranteed_for_high_priority {
            self.options.high_priority_to_guarantee_resource
        } else {
            0
        }
    }

    fn push_aged(inner: &mut Inner<R, C>, priority: i32, job: ScheduledJob<R, C>) {
        let idx = priority.max(0) as usize;
        if inner.aged.len() <= idx {
            inner.aged.resize_with(idx + 1, Vec::new);
        }
        inner.aged[idx].push(AgedJob {
            job,
            bucket_priority: priority,
        });
    }

    /// Queues a job in the recent tier, demoting the oldest recent job
    /// into the aged buckets on overflow.
    fn push_pending(&self, inner: &mut Inner<R, C>, job: ScheduledJob<R, C>, actions: &mut Vec<Action<R, C>>) {
        inner.recent.push_back(job);
        inner.pending_count += 1;
        if inner.recent.len() > self.options.num_new_jobs {
            if let Some(oldest) = inner.recent.pop_front() {
                let priority = self.score(oldest.ctx());
                if priority < 0 {
                    inner.pending_count -= 1;
                    actions.push(Action::Abort(oldest));
                } else {
                    Self::push_aged(inner, priority, oldest);
                }
            }
        }
    }

    /// Records one admission; triggers a full rerank when due.
    fn record_schedule(&self, inner: &mut Inner<R, C>, actions: &mut Vec<Action<R, C>>) {
        inner.schedules_since_rerank += 1;
        if inner.schedules_since_rerank >= self.options.num_jobs_before_rerank_old_priorities {
            self.rerank(inner, actions);
        }
    }

    /// Re-scores every pending job and rebuilds the aged buckets.
    ///
    /// The recent list is folded into the buckets as well; its jobs have
    /// been waiting long enough that freshness no longer matters.
    fn rerank(&self, inner: &mut Inner<R, C>, actions: &mut Vec<Action<R, C>>) {
        inner.schedules_since_rerank = 0;
        let mut all: Vec<ScheduledJob<R, C>> = inner.recent.drain(..).collect();
        for bucket in inner.aged.iter_mut() {
            all.extend(bucket.drain(..).map(|aged| aged.job));
        }
        let reranked = all.len();
        for job in all {
            let priority = self.score(job.ctx());
            if priority < 0 {
                inner.pending_count -= 1;
                actions.push(Action::Abort(job));
            } else {
                Self::push_aged(inner, priority, job);
            }
        }
        debug!(reranked, pending = inner.pending_count, "reranked pending jobs");
    }

    /// Takes the best pending job scoring at least `threshold`.
    ///
    /// Recent jobs are preferred over aged ones of equal score. Negative
    /// re-scores are aborted on the spot; aged entries whose score drifted
    /// are moved to their current bucket (lazy re-validation).
    fn take_next_job(
        &self,
        inner: &mut Inner<R, C>,
        threshold: i32,
        actions: &mut Vec<Action<R, C>>,
    ) -> Option<ScheduledJob<R, C>> {
        // Recent tier: re-score lazily, drop negatives, pick the best.
        let mut best: Option<(usize, i32)> = None;
        let mut i = 0;
        while i < inner.recent.len() {
            let priority = self.score(inner.recent[i].ctx());
            if priority < 0 {
                if let Some(job) = inner.recent.remove(i) {
                    inner.pending_count -= 1;
                    actions.push(Action::Abort(job));
                }
                continue;
            }
            if priority >= threshold && best.map_or(true, |(_, b)| priority > b) {
                best = Some((i, priority));
            }
            i += 1;
        }
        if let Some((idx, priority)) = best {
            let job = inner.recent.remove(idx)?;
            inner.pending_count -= 1;
            trace!(priority, tier = "recent", "admitting pending job");
            return Some(job);
        }

        // Aged tier: scan from the highest bucket down, newest entries
        // first, re-validating scores as we go.
        let mut requeue: Vec<(i32, ScheduledJob<R, C>)> = Vec::new();
        let mut found = None;
        'buckets: for bucket_idx in (0..inner.aged.len()).rev() {
            while let Some(aged) = inner.aged[bucket_idx].pop() {
                let priority = self.score(aged.job.ctx());
                if priority < 0 {
                    inner.pending_count -= 1;
                    actions.push(Action::Abort(aged.job));
                    continue;
                }
                if priority >= threshold {
                    inner.pending_count -= 1;
                    trace!(
                        priority,
                        recorded = aged.bucket_priority,
                        tier = "aged",
                        "admitting pending job"
                    );
                    found = Some(aged.job);
                    break 'buckets;
                }
                // Below threshold; keep it, re-bucketed at its fresh score.
                requeue.push((priority, aged.job));
            }
        }
        for (priority, job) in requeue {
            Self::push_aged(inner, priority, job);
        }
        found
    }

    /// Admits pending jobs onto free resources until the pool or the
    /// eligible work runs out.
    fn admit_pending(&self, inner: &mut Inner<R, C>, actions: &mut Vec<Action<R, C>>) {
        while !inner.free.is_empty() {
            let threshold = self.min_priority_to_schedule(inner.free.len());
            match self.take_next_job(inner, threshold, actions) {
                Some(job) => {
                    let Some(resource) = inner.free.pop() else {
                        break;
                    };
                    inner.in_use += 1;
                    self.record_schedule(inner, actions);
                    actions.push(Action::Run(job, resource));
                }
                None => break,
            }
        }
    }

    /// Highest score among pending jobs: recent jobs re-scored, aged jobs
    /// judged by their recorded bucket (cheap poll path).
    fn max_pending_priority(&self, inner: &Inner<R, C>) -> Option<i32> {
        let recent_max = inner
            .recent
            .iter()
            .map(|job| self.score(job.ctx()))
            .filter(|p| *p >= 0)
            .max();
        let aged_max = inner
            .aged
            .iter()
            .enumerate()
            .rev()
            .find(|(_, bucket)| !bucket.is_empty())
            .map(|(idx, _)| idx as i32);
        match (recent_max, aged_max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn run_actions(actions: Vec<Action<R, C>>) {
        for action in actions {
            match action {
                Action::Run(job, resource) => job.run(resource),
                Action::Abort(job) => job.abort(),
            }
        }
    }
}

impl<R, C> ResourceScheduler<R, C> for PriorityScheduler<R, C>
where
    R: Send + 'static,
    C: Send + Sync + 'static,
{
    fn enqueue_job(&self, job: ScheduledJob<R, C>) {
        let priority = self.score(job.ctx());
        if priority < 0 {
            debug!(priority, "job aborted on enqueue");
            job.abort();
            return;
        }

        let mut actions = Vec::new();
        {
            let mut inner = self.lock();
            let threshold = self.min_priority_to_schedule(inner.free.len());
            if let Some(resource) = (priority >= threshold)
                .then(|| inner.free.pop())
                .flatten()
            {
                inner.in_use += 1;
                self.record_schedule(&mut inner, &mut actions);
                actions.push(Action::Run(job, resource));
            } else {
                self.push_pending(&mut inner, job, &mut actions);
            }
        }
        Self::run_actions(actions);
    }

    fn job_done(&self, resource: R, _ctx: &Arc<C>) {
        let mut actions = Vec::new();
        {
            let mut inner = self.lock();
            if inner.in_use == 0 {
                error!("job_done called with no job admitted");
                inner.free.push(resource);
                return;
            }
            inner.in_use -= 1;
            inner.free.push(resource);
            self.admit_pending(&mut inner, &mut actions);
        }
        Self::run_actions(actions);
    }

    fn should_yield_or_abort(&self, ctx: &Arc<C>) -> bool {
        let priority = self.score(ctx);
        if priority < 0 {
            return true;
        }
        let inner = self.lock();
        self.max_pending_priority(&inner)
            .is_some_and(|pending| pending > priority)
    }

    fn try_yield(&self, request: YieldRequest<R, C>) -> TryYieldOutcome<R> {
        let YieldRequest {
            resume,
            on_abort,
            on_yielded,
            ctx,
            resource,
        } = request;
        let priority = self.score(&ctx);

        let mut actions = Vec::new();
        let outcome = {
            let mut inner = self.lock();
            if priority < 0 {
                // The yielding job is now aborted: reclaim its resource for
                // pending work and abort the continuation.
                inner.in_use -= 1;
                inner.free.push(resource);
                self.admit_pending(&mut inner, &mut actions);
                actions.push(Action::Abort(ScheduledJob::new(ctx, resume, on_abort)));
                TryYieldOutcome::Yielded
            } else {
                match self.take_next_job(&mut inner, priority.saturating_add(1), &mut actions) {
                    Some(higher) => {
                        // Resource moves job-to-job; in_use is unchanged.
                        self.record_schedule(&mut inner, &mut actions);
                        actions.push(Action::Run(higher, resource));
                        let continuation = ScheduledJob::new(ctx, resume, on_abort);
                        self.push_pending(&mut inner, continuation, &mut actions);
                        TryYieldOutcome::Yielded
                    }
                    None => TryYieldOutcome::Refused(resource),
                }
            }
        };

        if outcome.is_yielded() {
            on_yielded();
        }
        Self::run_actions(actions);
        outcome
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
        self.lock().pending_count
    }
}
