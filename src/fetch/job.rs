//! Per-request fetch state machine.
//!
//! A [`FetchJob`] drives one request (or one long-lived channel) through
//! the scheduler and the injected fetcher:
//!
//! ```text
//! WaitForFetchCall ─▶ WaitForSchedule ─▶ Active ─▶ Terminated
//!                                          │  ▲
//!                                 poll says yield
//!                                          ▼  │
//!                                   AboutToYield ─▶ Yielded
//! ```
//!
//! A non-channel job is scheduled once and runs to completion or abort. A
//! channel job keeps its underlying movable fetch alive across retargets:
//! `fetch` on a live channel moves the connection to the new region, and
//! retargets issued before the fetch ever started collapse into a single
//! fetch of the newest target.
//!
//! While a fetch is paused for a yield offer, arriving data is only
//! flagged (`pending_data`) and drained when the job regains its
//! resource, so no chunk is ever lost across a yield.

use super::fetcher::{DataContext, FetchError, FetchHandle, FetchedData, Fetcher};
use crate::region::{ImagePartParams, JobContext, RequestPriorityData};
use crate::scheduler::{ResourceScheduler, ScheduledJob, TryYieldOutcome, YieldRequest};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace};

/// Receives every data chunk delivered for the request.
pub type DataListener = Box<dyn FnMut(&FetchedData) + Send>;

/// Receives the terminal notification, exactly once; `true` = aborted.
pub type TerminatedListener = Box<dyn FnOnce(bool) + Send>;

/// Observable lifecycle phase of a fetch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchJobState {
    /// Created, no target yet.
    WaitForFetchCall,
    /// Target known, waiting for scheduler admission.
    WaitForSchedule,
    /// Holding a resource, fetch in flight (or channel idle).
    Active,
    /// Pausing the fetch before offering the resource away.
    AboutToYield { pending_data: bool },
    /// Resource given up; continuation pending re-admission.
    Yielded { pending_data: bool },
    /// Manual abort in progress.
    AboutToAbort,
    /// Terminal, listeners notified.
    Terminated,
    /// Terminal after an internal invariant violation.
    UnexpectedFailure,
}

/// Construction parameters for a [`FetchJob`].
pub struct FetchJobOptions<R: Send + 'static> {
    pub fetcher: Arc<dyn Fetcher>,
    /// `None` runs the fetch immediately without a resource pool.
    pub scheduler: Option<Arc<dyn ResourceScheduler<R, JobContext>>>,
    pub is_channel: bool,
    /// Terminate successfully after the first delivered chunk.
    pub only_wait_for_data: bool,
    /// Count delivered chunks as progressive stages on the job context.
    pub is_progressive: bool,
    pub on_data: DataListener,
    pub on_terminated: TerminatedListener,
}

struct State<R> {
    phase: FetchJobState,
    ctx: Option<Arc<JobContext>>,
    context: Option<Box<dyn DataContext>>,
    handle: Option<Box<dyn FetchHandle>>,
    resource: Option<R>,
    /// Latest requested target not yet handed to the fetcher. Successive
    /// retargets before the fetch starts overwrite it.
    pending_target: Option<ImagePartParams>,
    movable_started: bool,
    manually_aborted: bool,
    is_progressive: bool,
    delivered_any: bool,
}

struct Shared<R: Send + 'static> {
    fetcher: Arc<dyn Fetcher>,
    scheduler: Option<Arc<dyn ResourceScheduler<R, JobContext>>>,
    is_channel: bool,
    only_wait_for_data: bool,
    on_data: Mutex<DataListener>,
    on_terminated: Mutex<Option<TerminatedListener>>,
    state: Mutex<State<R>>,
}

/// One request's fetch lifecycle. Cheap to clone; clones share state.
pub struct FetchJob<R: Send + 'static> {
    shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> Clone for FetchJob<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Send + 'static> FetchJob<R> {
    pub fn new(options: FetchJobOptions<R>) -> Self {
        Self {
            shared: Arc::new(Shared {
                fetcher: options.fetcher,
                scheduler: options.scheduler,
                is_channel: options.is_channel,
                only_wait_for_data: options.only_wait_for_data,
                on_data: Mutex::new(options.on_data),
                on_terminated: Mutex::new(Some(options.on_terminated)),
                state: Mutex::new(State {
                    phase: FetchJobState::WaitForFetchCall,
                    ctx: None,
                    context: None,
                    handle: None,
                    resource: None,
                    pending_target: None,
                    movable_started: false,
                    manually_aborted: false,
                    is_progressive: options.is_progressive,
                    delivered_any: false,
                }),
            }),
        }
    }

    /// Starts the fetch, or retargets a channel.
    pub fn fetch(&self, params: ImagePartParams) -> Result<(), FetchError> {
        enum After<R: Send + 'static> {
            Enqueue(Arc<dyn ResourceScheduler<R, JobContext>>, Arc<JobContext>),
            Pump,
            Nothing,
        }

        let after = {
            let mut st = Shared::lock(&self.shared);
            match st.phase {
                FetchJobState::WaitForFetchCall => {
                    let ctx = Arc::new(JobContext::new(params));
                    st.ctx = Some(Arc::clone(&ctx));
                    st.pending_target = Some(params);
                    match &self.shared.scheduler {
                        Some(scheduler) => {
                            st.phase = FetchJobState::WaitForSchedule;
                            After::Enqueue(Arc::clone(scheduler), ctx)
                        }
                        None => {
                            st.phase = FetchJobState::Active;
                            let target = st.pending_target.take().unwrap_or(params);
                            if let Err(err) =
                                Shared::start_fetch_locked(&self.shared, &mut st, target)
                            {
                                st.phase = FetchJobState::UnexpectedFailure;
                                return Err(err);
                            }
                            After::Pump
                        }
                    }
                }
                FetchJobState::Terminated
                | FetchJobState::UnexpectedFailure
                | FetchJobState::AboutToAbort => {
                    if st.manually_aborted {
                        // Tolerated race: a retarget landed after the
                        // caller already abandoned the request.
                        After::Nothing
                    } else {
                        return Err(FetchError::RequestTerminated);
                    }
                }
                _ if self.shared.is_channel => {
                    if st.movable_started && matches!(st.phase, FetchJobState::Active) {
                        Shared::retarget_locked(&self.shared, &mut st, params)?;
                        After::Pump
                    } else {
                        // Not started (or paused): collapse into the
                        // newest target, no fetch for superseded ones.
                        st.pending_target = Some(params);
                        After::Nothing
                    }
                }
                _ => return Err(FetchError::AlreadyFetching),
            }
        };

        match after {
            After::Enqueue(scheduler, ctx) => {
                let run_shared = Arc::clone(&self.shared);
                let abort_shared = Arc::clone(&self.shared);
                scheduler.enqueue_job(ScheduledJob::new(
                    ctx,
                    Box::new(move |resource, ctx| {
                        Shared::on_scheduled(&run_shared, resource, &ctx);
                    }),
                    Box::new(move |_ctx| Shared::finish(&abort_shared, true)),
                ));
            }
            After::Pump => Shared::pump(&self.shared),
            After::Nothing => {}
        }
        Ok(())
    }

    /// Aborts the request; the terminated listener fires with `true`.
    ///
    /// Idempotent. A scheduler admission arriving afterwards returns its
    /// resource immediately.
    pub fn manual_abort(&self) {
        let (resource, ctx) = {
            let mut st = Shared::lock(&self.shared);
            if matches!(
                st.phase,
                FetchJobState::Terminated | FetchJobState::UnexpectedFailure
            ) || st.manually_aborted
            {
                return;
            }
            st.manually_aborted = true;
            st.phase = FetchJobState::AboutToAbort;
            if let Some(context) = st.context.as_mut() {
                context.dispose();
            }
            st.context = None;
            if let Some(handle) = st.handle.as_mut() {
                handle.stop(Box::new(|| {}));
            }
            st.handle = None;
            (st.resource.take(), st.ctx.clone())
        };

        if let (Some(resource), Some(ctx), Some(scheduler)) =
            (resource, ctx.as_ref(), &self.shared.scheduler)
        {
            scheduler.job_done(resource, ctx);
        }

        Shared::lock(&self.shared).phase = FetchJobState::Terminated;
        let terminated = Shared::take_terminated(&self.shared);
        if let Some(terminated) = terminated {
            terminated(true);
        }
    }

    /// Toggles progressive-stage counting for prioritization.
    pub fn set_is_progressive(&self, is_progressive: bool) {
        Shared::lock(&self.shared).is_progressive = is_progressive;
    }

    /// Replaces the request's priority data.
    pub fn set_priority_data(&self, data: RequestPriorityData) {
        if let Some(ctx) = Shared::lock(&self.shared).ctx.as_ref() {
            ctx.set_priority_data(data);
        }
    }

    /// The scheduling context, once a target is known.
    pub fn job_context(&self) -> Option<Arc<JobContext>> {
        Shared::lock(&self.shared).ctx.clone()
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> FetchJobState {
        Shared::lock(&self.shared).phase
    }
}

impl<R: Send + 'static> Shared<R> {
    fn lock(shared: &Arc<Self>) -> MutexGuard<'_, State<R>> {
        match shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn take_terminated(shared: &Arc<Self>) -> Option<TerminatedListener> {
        match shared.on_terminated.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Creates the data context for `params` and starts the transfer.
    /// Caller holds the state lock; capability calls are safe under it
    /// because data events and stop acks are never raised re-entrantly.
    fn start_fetch_locked(
        shared: &Arc<Self>,
        st: &mut State<R>,
        params: ImagePartParams,
    ) -> Result<(), FetchError> {
        let mut context = shared.fetcher.create_data_context(&params)?;
        let weak = Arc::downgrade(shared);
        context.set_data_listener(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                Shared::pump(&shared);
            }
        }));
        let handle = if shared.is_channel {
            st.movable_started = true;
            shared.fetcher.start_movable_fetch(context.as_mut())?
        } else {
            shared.fetcher.fetch(context.as_mut())?
        };
        st.context = Some(context);
        st.handle = Some(handle);
        Ok(())
    }

    /// Moves a live channel fetch onto a new target region.
    fn retarget_locked(
        shared: &Arc<Self>,
        st: &mut State<R>,
        params: ImagePartParams,
    ) -> Result<(), FetchError> {
        let Some(handle) = st.handle.as_mut() else {
            st.pending_target = Some(params);
            return Ok(());
        };
        let mut context = shared.fetcher.create_data_context(&params)?;
        let weak = Arc::downgrade(shared);
        context.set_data_listener(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                Shared::pump(&shared);
            }
        }));
        shared.fetcher.move_fetch(handle.as_mut(), context.as_mut())?;
        if let Some(old) = st.context.as_mut() {
            old.dispose();
        }
        st.context = Some(context);
        Ok(())
    }

    /// Scheduler admission: start fetching the newest target.
    fn on_scheduled(shared: &Arc<Self>, resource: R, ctx: &Arc<JobContext>) {
        {
            let mut st = Shared::lock(shared);
            if st.manually_aborted
                || matches!(
                    st.phase,
                    FetchJobState::Terminated
                        | FetchJobState::AboutToAbort
                        | FetchJobState::UnexpectedFailure
                )
            {
                drop(st);
                if let Some(scheduler) = &shared.scheduler {
                    scheduler.job_done(resource, ctx);
                }
                return;
            }
            st.phase = FetchJobState::Active;
            st.resource = Some(resource);
            let target = st.pending_target.take().unwrap_or(ctx.image_part_params);
            if let Err(err) = Shared::start_fetch_locked(shared, &mut st, target) {
                drop(st);
                Shared::unexpected_failure(shared, &err);
                return;
            }
        }
        Shared::pump(shared);
    }

    /// Drains available data, delivering chunks and polling the yield
    /// protocol after each one.
    fn pump(shared: &Arc<Self>) {
        loop {
            let (chunk, finish_now) = {
                let mut st = Shared::lock(shared);
                match &mut st.phase {
                    FetchJobState::Active => {}
                    FetchJobState::AboutToYield { pending_data }
                    | FetchJobState::Yielded { pending_data } => {
                        *pending_data = true;
                        return;
                    }
                    _ => return,
                }
                let Some(ctx) = st.ctx.clone() else { return };
                let quality = ctx.image_part_params.quality;
                let Some(context) = st.context.as_mut() else {
                    return;
                };
                let chunk = context.fetched_data(quality);
                let done = context.is_done();
                if chunk.is_some() {
                    st.delivered_any = true;
                    if st.is_progressive {
                        ctx.record_stage_done();
                    }
                }
                let finish_now = done || (shared.only_wait_for_data && st.delivered_any);

                if !finish_now && chunk.is_some() {
                    if let Some(scheduler) = &shared.scheduler {
                        if scheduler.should_yield_or_abort(&ctx) {
                            st.phase = FetchJobState::AboutToYield {
                                pending_data: false,
                            };
                            if let Some(handle) = st.handle.as_mut() {
                                let weak = Arc::downgrade(shared);
                                handle.stop(Box::new(move || {
                                    if let Some(shared) = weak.upgrade() {
                                        Shared::on_fetch_stopped(&shared);
                                    }
                                }));
                            }
                        }
                    }
                }
                (chunk, finish_now)
            };

            if let Some(chunk) = &chunk {
                trace!(bytes = chunk.data.len(), "fetch data delivered");
                let mut on_data = match shared.on_data.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                (on_data)(chunk);
            }

            if finish_now {
                if shared.is_channel && !shared.only_wait_for_data {
                    Shared::on_channel_target_done(shared);
                } else {
                    Shared::finish(shared, false);
                }
                return;
            }
            if chunk.is_none() {
                return;
            }
            if !matches!(Shared::lock(shared).phase, FetchJobState::Active) {
                return;
            }
        }
    }

    /// A channel's current target finished: apply any queued retarget,
    /// otherwise stay active (and keep the slot) awaiting the next move.
    fn on_channel_target_done(shared: &Arc<Self>) {
        let retargeted = {
            let mut st = Shared::lock(shared);
            if !matches!(st.phase, FetchJobState::Active) {
                return;
            }
            match st.pending_target.take() {
                Some(target) => match Shared::retarget_locked(shared, &mut st, target) {
                    Ok(()) => true,
                    Err(err) => {
                        drop(st);
                        Shared::unexpected_failure(shared, &err);
                        return;
                    }
                },
                None => {
                    debug!("channel target complete, awaiting retarget");
                    false
                }
            }
        };
        if retargeted {
            Shared::pump(shared);
        }
    }

    /// The fetcher confirmed the pause: offer the resource away.
    fn on_fetch_stopped(shared: &Arc<Self>) {
        let request = {
            let mut st = Shared::lock(shared);
            match st.phase {
                FetchJobState::AboutToYield { .. } => {
                    let (Some(resource), Some(ctx), Some(scheduler)) = (
                        st.resource.take(),
                        st.ctx.clone(),
                        shared.scheduler.clone(),
                    ) else {
                        drop(st);
                        Shared::unexpected_failure(
                            shared,
                            &FetchError::Connection("yield without resource".into()),
                        );
                        return;
                    };

                    let resume_shared = Arc::clone(shared);
                    let abort_shared = Arc::clone(shared);
                    let yielded_weak = Arc::downgrade(shared);
                    Some((
                        scheduler,
                        YieldRequest {
                            resume: Box::new(move |resource, ctx| {
                                Shared::on_resume(&resume_shared, resource, &ctx);
                            }),
                            on_abort: Box::new(move |_ctx| {
                                Shared::finish(&abort_shared, true);
                            }),
                            on_yielded: Box::new(move || {
                                if let Some(shared) = yielded_weak.upgrade() {
                                    let mut st = Shared::lock(&shared);
                                    if let FetchJobState::AboutToYield { pending_data } = st.phase {
                                        st.phase = FetchJobState::Yielded { pending_data };
                                    }
                                }
                            }),
                            ctx,
                            resource,
                        },
                    ))
                }
                // An abort raced the stop acknowledgment.
                _ => None,
            }
        };

        let Some((scheduler, request)) = request else {
            return;
        };
        match scheduler.try_yield(request) {
            TryYieldOutcome::Yielded => {
                debug!("fetch yielded its resource");
            }
            TryYieldOutcome::Refused(resource) => {
                let pending = {
                    let mut st = Shared::lock(shared);
                    let pending = matches!(
                        st.phase,
                        FetchJobState::AboutToYield { pending_data: true }
                    );
                    st.resource = Some(resource);
                    st.phase = FetchJobState::Active;
                    if let Some(handle) = st.handle.as_mut() {
                        handle.resume();
                    }
                    pending
                };
                if pending {
                    Shared::pump(shared);
                }
            }
        }
    }

    /// The yielded continuation regained a resource.
    fn on_resume(shared: &Arc<Self>, resource: R, ctx: &Arc<JobContext>) {
        let pending = {
            let mut st = Shared::lock(shared);
            if st.manually_aborted
                || matches!(
                    st.phase,
                    FetchJobState::Terminated
                        | FetchJobState::AboutToAbort
                        | FetchJobState::UnexpectedFailure
                )
            {
                drop(st);
                if let Some(scheduler) = &shared.scheduler {
                    scheduler.job_done(resource, ctx);
                }
                return;
            }
            let pending = matches!(st.phase, FetchJobState::Yielded { pending_data: true });
            st.resource = Some(resource);
            st.phase = FetchJobState::Active;
            if let Some(handle) = st.handle.as_mut() {
                handle.resume();
            }
            pending
        };
        if pending {
            Shared::pump(shared);
        }
    }

    /// Terminal transition: release the resource, dispose the context and
    /// fire the terminated listener exactly once.
    fn finish(shared: &Arc<Self>, aborted: bool) {
        let (resource, ctx) = {
            let mut st = Shared::lock(shared);
            if matches!(
                st.phase,
                FetchJobState::Terminated | FetchJobState::UnexpectedFailure
            ) {
                return;
            }
            let held_resource_expected = matches!(
                st.phase,
                FetchJobState::Active | FetchJobState::AboutToYield { .. }
            );
            if let Some(context) = st.context.as_mut() {
                context.dispose();
            }
            st.context = None;
            st.handle = None;
            let resource = st.resource.take();

            if !aborted
                && shared.scheduler.is_some()
                && held_resource_expected
                && resource.is_none()
            {
                // A scheduled job completed without the resource it must
                // have been holding: internal corruption.
                error!("fetch job terminated without its scheduled resource");
                st.phase = FetchJobState::UnexpectedFailure;
            } else {
                st.phase = FetchJobState::Terminated;
            }
            (resource, st.ctx.clone())
        };

        if let (Some(resource), Some(ctx), Some(scheduler)) =
            (resource, ctx.as_ref(), &shared.scheduler)
        {
            scheduler.job_done(resource, ctx);
        }
        if let Some(terminated) = Shared::take_terminated(shared) {
            terminated(aborted);
        }
    }

    fn unexpected_failure(shared: &Arc<Self>, err: &FetchError) {
        error!(error = %err, "fetch job failed unexpectedly");
        let (resource, ctx) = {
            let mut st = Shared::lock(shared);
            st.phase = FetchJobState::UnexpectedFailure;
            if let Some(context) = st.context.as_mut() {
                context.dispose();
            }
            st.context = None;
            st.handle = None;
            (st.resource.take(), st.ctx.clone())
        };
        if let (Some(resource), Some(ctx), Some(scheduler)) =
            (resource, ctx.as_ref(), &shared.scheduler)
        {
            scheduler.job_done(resource, ctx);
        }
        if let Some(terminated) = Shared::take_terminated(shared) {
            terminated(true);
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for FetchJob<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchJob")
            .field("state", &self.state())
            .finish()
    }
}
