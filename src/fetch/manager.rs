//! Per-connection fetch façade.
//!
//! A [`FetchManager`] owns one fetcher connection and every request and
//! channel riding on it. It hands each request a [`FetchJob`], tracks
//! them by caller-chosen id, and applies the retry-once workaround: a
//! known server defect can fail the very first highest-priority request
//! on a fresh connection, so a request that terminates aborted while
//! carrying `override_highest_priority` — and was not aborted by the
//! caller — is re-issued exactly once.

use super::fetcher::{FetchError, FetchedData, Fetcher};
use super::frustum::{FrustumData, FrustumRequestsPrioritizer};
use super::job::{DataListener, FetchJob, FetchJobOptions, TerminatedListener};
use crate::region::{ImagePartParams, JobContext, RequestPriorityData};
use crate::scheduler::ResourceScheduler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

/// Identifies a request within its manager; chosen by the caller.
pub type RequestId = u64;

/// Identifies a channel within its manager.
pub type ChannelHandle = u64;

/// Construction parameters for a [`FetchManager`].
pub struct FetchManagerOptions<R: Send + 'static> {
    pub fetcher: Arc<dyn Fetcher>,
    /// `None` runs fetches unscheduled, without a resource pool.
    pub scheduler: Option<Arc<dyn ResourceScheduler<R, JobContext>>>,
    /// The prioritizer fed by [`FetchManager::set_prioritizer_data`];
    /// `None` if viewport data is pushed to the prioritizer directly.
    pub prioritizer: Option<Arc<FrustumRequestsPrioritizer>>,
}

struct ManagerState<R: Send + 'static> {
    open: bool,
    url: Option<String>,
    requests: HashMap<RequestId, RequestEntry<R>>,
    channels: HashMap<ChannelHandle, FetchJob<R>>,
    next_channel_handle: ChannelHandle,
    next_request_id: RequestId,
}

struct RequestEntry<R: Send + 'static> {
    job: FetchJob<R>,
    /// Set by [`FetchManager::manual_abort_request`] before the abort so
    /// the terminated hook can tell a caller abort from a scheduler one.
    manually_aborted: bool,
    retried: bool,
}

struct Inner<R: Send + 'static> {
    fetcher: Arc<dyn Fetcher>,
    scheduler: Option<Arc<dyn ResourceScheduler<R, JobContext>>>,
    prioritizer: Option<Arc<FrustumRequestsPrioritizer>>,
    state: Mutex<ManagerState<R>>,
}

/// Owns every request and channel on one fetcher connection.
pub struct FetchManager<R: Send + 'static> {
    inner: Arc<Inner<R>>,
}

impl<R: Send + 'static> Clone for FetchManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> FetchManager<R> {
    pub fn new(options: FetchManagerOptions<R>) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher: options.fetcher,
                scheduler: options.scheduler,
                prioritizer: options.prioritizer,
                state: Mutex::new(ManagerState {
                    open: false,
                    url: None,
                    requests: HashMap::new(),
                    channels: HashMap::new(),
                    next_channel_handle: 0,
                    next_request_id: 0,
                }),
            }),
        }
    }

    /// Opens the underlying connection.
    pub fn open(&self, url: &str) -> Result<(), FetchError> {
        {
            let st = self.inner.lock();
            if st.open {
                return Err(FetchError::AlreadyOpen);
            }
        }
        self.inner.fetcher.open(url)?;
        let mut st = self.inner.lock();
        st.open = true;
        st.url = Some(url.to_owned());
        info!(url, "fetch connection opened");
        Ok(())
    }

    /// Aborts everything and closes the connection.
    pub fn close(&self) {
        let (requests, channels) = {
            let mut st = self.inner.lock();
            if !st.open {
                return;
            }
            st.open = false;
            for entry in st.requests.values_mut() {
                entry.manually_aborted = true;
            }
            (
                st.requests.drain().collect::<Vec<_>>(),
                st.channels.drain().collect::<Vec<_>>(),
            )
        };
        for (_, entry) in requests {
            entry.job.manual_abort();
        }
        for (_, channel) in channels {
            channel.manual_abort();
        }
        self.inner.fetcher.close();
        info!("fetch connection closed");
    }

    /// Reserves a request id that no other caller of this manager holds.
    pub fn allocate_request_id(&self) -> RequestId {
        let mut st = self.inner.lock();
        let id = st.next_request_id;
        st.next_request_id += 1;
        id
    }

    /// Creates and starts a request under `request_id`.
    pub fn create_request(
        &self,
        request_id: RequestId,
        params: ImagePartParams,
        on_data: DataListener,
        on_terminated: TerminatedListener,
        only_wait_for_data: bool,
    ) -> Result<(), FetchError> {
        // Shared so a retry can re-attach the same data listener.
        let on_data = Arc::new(Mutex::new(on_data));
        Inner::start_request(
            &self.inner,
            request_id,
            params,
            on_data,
            on_terminated,
            only_wait_for_data,
            false,
        )
    }

    /// Aborts a request; its terminated listener fires with `true`.
    pub fn manual_abort_request(&self, request_id: RequestId) -> Result<(), FetchError> {
        let job = {
            let mut st = self.inner.lock();
            let entry = st
                .requests
                .get_mut(&request_id)
                .ok_or(FetchError::UnknownRequest(request_id))?;
            entry.manually_aborted = true;
            entry.job.clone()
        };
        job.manual_abort();
        Ok(())
    }

    /// Toggles progressive-stage counting for a request.
    pub fn set_is_progressive_request(
        &self,
        request_id: RequestId,
        is_progressive: bool,
    ) -> Result<(), FetchError> {
        let st = self.inner.lock();
        let entry = st
            .requests
            .get(&request_id)
            .ok_or(FetchError::UnknownRequest(request_id))?;
        entry.job.set_is_progressive(is_progressive);
        Ok(())
    }

    /// Replaces a request's priority data.
    pub fn set_request_priority_data(
        &self,
        request_id: RequestId,
        data: RequestPriorityData,
    ) -> Result<(), FetchError> {
        let st = self.inner.lock();
        let entry = st
            .requests
            .get(&request_id)
            .ok_or(FetchError::UnknownRequest(request_id))?;
        entry.job.set_priority_data(data);
        Ok(())
    }

    /// Replaces the viewport the attached prioritizer scores against.
    /// No-op when the manager was built without one.
    pub fn set_prioritizer_data(&self, data: Option<FrustumData>) {
        if let Some(prioritizer) = &self.inner.prioritizer {
            prioritizer.set_frustum_data(data);
        }
    }

    /// Forwards viewport data to the server so it can order its replies.
    pub fn set_server_request_prioritizer_data(&self, data: Option<FrustumData>) {
        self.inner.fetcher.set_prioritizer_data(data);
    }

    /// Creates a long-lived retargetable fetch slot.
    ///
    /// The channel fetches nothing until the first
    /// [`move_channel`](FetchManager::move_channel).
    pub fn create_channel(
        &self,
        on_data: DataListener,
        on_terminated: TerminatedListener,
    ) -> Result<ChannelHandle, FetchError> {
        let mut st = self.inner.lock();
        if !st.open {
            return Err(FetchError::NotOpen);
        }
        let handle = st.next_channel_handle;
        st.next_channel_handle += 1;
        let job = FetchJob::new(FetchJobOptions {
            fetcher: Arc::clone(&self.inner.fetcher),
            scheduler: self.inner.scheduler.clone(),
            is_channel: true,
            only_wait_for_data: false,
            is_progressive: true,
            on_data,
            on_terminated,
        });
        st.channels.insert(handle, job);
        debug!(handle, "channel created");
        Ok(handle)
    }

    /// Retargets a channel onto a new region. Retargets issued before
    /// the channel's fetch starts collapse into the newest one.
    pub fn move_channel(
        &self,
        handle: ChannelHandle,
        params: ImagePartParams,
    ) -> Result<(), FetchError> {
        let job = {
            let st = self.inner.lock();
            st.channels
                .get(&handle)
                .ok_or(FetchError::UnknownChannel(handle))?
                .clone()
        };
        job.fetch(params)
    }

    /// Releases a channel and its slot.
    pub fn close_channel(&self, handle: ChannelHandle) -> Result<(), FetchError> {
        let job = self
            .inner
            .lock()
            .channels
            .remove(&handle)
            .ok_or(FetchError::UnknownChannel(handle))?;
        job.manual_abort();
        Ok(())
    }

    /// Live (non-terminated) requests.
    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Live channels.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

impl<R: Send + 'static> Inner<R> {
    fn lock(&self) -> MutexGuard<'_, ManagerState<R>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Builds, registers and starts one request attempt.
    #[allow(clippy::too_many_arguments)]
    fn start_request(
        inner: &Arc<Self>,
        request_id: RequestId,
        params: ImagePartParams,
        on_data: Arc<Mutex<DataListener>>,
        on_terminated: TerminatedListener,
        only_wait_for_data: bool,
        is_retry: bool,
    ) -> Result<(), FetchError> {
        let job_on_data: DataListener = {
            let on_data = Arc::clone(&on_data);
            Box::new(move |chunk: &FetchedData| {
                let mut listener = match on_data.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                (listener)(chunk);
            })
        };

        let weak = Arc::downgrade(inner);
        let job_on_terminated: TerminatedListener = Box::new(move |aborted| {
            Inner::on_request_terminated(
                &weak,
                request_id,
                params,
                on_data,
                on_terminated,
                only_wait_for_data,
                aborted,
            );
        });

        let job = FetchJob::new(FetchJobOptions {
            fetcher: Arc::clone(&inner.fetcher),
            scheduler: inner.scheduler.clone(),
            is_channel: false,
            only_wait_for_data,
            is_progressive: true,
            on_data: job_on_data,
            on_terminated: job_on_terminated,
        });

        {
            let mut st = inner.lock();
            if !st.open {
                return Err(FetchError::NotOpen);
            }
            if !is_retry && st.requests.contains_key(&request_id) {
                return Err(FetchError::DuplicateRequest(request_id));
            }
            st.requests.insert(
                request_id,
                RequestEntry {
                    job: job.clone(),
                    manually_aborted: false,
                    retried: is_retry,
                },
            );
        }
        if let Err(err) = job.fetch(params) {
            inner.lock().requests.remove(&request_id);
            return Err(err);
        }
        Ok(())
    }

    /// Terminated hook for every request attempt: decides between
    /// delivering the terminal notification and the one retry.
    fn on_request_terminated(
        weak: &Weak<Self>,
        request_id: RequestId,
        params: ImagePartParams,
        on_data: Arc<Mutex<DataListener>>,
        on_terminated: TerminatedListener,
        only_wait_for_data: bool,
        aborted: bool,
    ) {
        let Some(inner) = weak.upgrade() else {
            on_terminated(aborted);
            return;
        };

        let retry = {
            let mut st = inner.lock();
            let eligible = match st.requests.get(&request_id) {
                Some(entry) => {
                    aborted
                        && !entry.manually_aborted
                        && !entry.retried
                        && params.request_priority_data.override_highest_priority
                }
                None => false,
            };
            if !eligible {
                st.requests.remove(&request_id);
            }
            eligible && st.open
        };

        if retry {
            // First highest-priority request on a fresh connection can be
            // failed by the server; re-issue it once.
            warn!(request_id, "highest-priority request aborted, retrying once");
            let result = Inner::start_request(
                &inner,
                request_id,
                params,
                on_data,
                on_terminated,
                only_wait_for_data,
                true,
            );
            if let Err(err) = result {
                warn!(request_id, error = %err, "retry failed to start");
            }
        } else {
            on_terminated(aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fetcher::{DataContext, FetchHandle};
    use crate::scheduler::{LifoScheduler, PriorityScheduler, PrioritySchedulerOptions};
    use bytes::Bytes;
    use std::collections::VecDeque;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    #[derive(Default)]
    struct NetState {
        contexts: Vec<Arc<Mutex<CtxState>>>,
        created_params: Vec<ImagePartParams>,
        opened: Option<String>,
        closed: bool,
        server_frustum: Option<FrustumData>,
    }

    #[derive(Default)]
    struct CtxState {
        chunks: VecDeque<FetchedData>,
        done: bool,
        listener: Option<Box<dyn FnMut() + Send>>,
        disposed: bool,
    }

    #[derive(Clone, Default)]
    struct MockNet {
        state: Arc<Mutex<NetState>>,
    }

    struct MockContext {
        state: Arc<Mutex<CtxState>>,
    }

    impl DataContext for MockContext {
        fn has_data(&self) -> bool {
            !self.state.lock().unwrap().chunks.is_empty()
        }

        fn is_done(&self) -> bool {
            let st = self.state.lock().unwrap();
            st.done && st.chunks.is_empty()
        }

        fn set_data_listener(&mut self, listener: Box<dyn FnMut() + Send>) {
            self.state.lock().unwrap().listener = Some(listener);
        }

        fn fetched_data(&mut self, _quality: Option<u16>) -> Option<FetchedData> {
            self.state.lock().unwrap().chunks.pop_front()
        }

        fn dispose(&mut self) {
            let mut st = self.state.lock().unwrap();
            st.disposed = true;
            st.listener = None;
        }
    }

    struct NopHandle;

    impl FetchHandle for NopHandle {
        fn stop(&mut self, on_stopped: Box<dyn FnOnce() + Send>) {
            on_stopped();
        }

        fn resume(&mut self) {}
    }

    impl Fetcher for MockNet {
        fn open(&self, url: &str) -> Result<(), FetchError> {
            self.state.lock().unwrap().opened = Some(url.to_owned());
            Ok(())
        }

        fn close(&self) {
            self.state.lock().unwrap().closed = true;
        }

        fn create_data_context(
            &self,
            params: &ImagePartParams,
        ) -> Result<Box<dyn DataContext>, FetchError> {
            let ctx = Arc::new(Mutex::new(CtxState::default()));
            let mut st = self.state.lock().unwrap();
            st.contexts.push(Arc::clone(&ctx));
            st.created_params.push(*params);
            Ok(Box::new(MockContext { state: ctx }))
        }

        fn fetch(&self, _context: &mut dyn DataContext) -> Result<Box<dyn FetchHandle>, FetchError> {
            Ok(Box::new(NopHandle))
        }

        fn start_movable_fetch(
            &self,
            _context: &mut dyn DataContext,
        ) -> Result<Box<dyn FetchHandle>, FetchError> {
            Ok(Box::new(NopHandle))
        }

        fn move_fetch(
            &self,
            _handle: &mut dyn FetchHandle,
            _context: &mut dyn DataContext,
        ) -> Result<(), FetchError> {
            Ok(())
        }

        fn set_prioritizer_data(&self, data: Option<FrustumData>) {
            self.state.lock().unwrap().server_frustum = data;
        }
    }

    impl MockNet {
        fn push_data(&self, idx: usize, bytes: &'static [u8], done: bool) {
            let ctx = self.state.lock().unwrap().contexts[idx].clone();
            let listener = {
                let mut st = ctx.lock().unwrap();
                st.chunks.push_back(FetchedData {
                    data: Bytes::from_static(bytes),
                    quality: None,
                });
                st.done = done;
                st.listener.take()
            };
            if let Some(mut listener) = listener {
                listener();
                let mut st = ctx.lock().unwrap();
                if st.listener.is_none() && !st.disposed {
                    st.listener = Some(listener);
                }
            }
        }
    }

    fn open_manager(net: &MockNet) -> FetchManager<u32> {
        let manager = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: None,
            prioritizer: None,
        });
        manager.open("wss://imagery.example/stream").unwrap();
        manager
    }

    fn collecting_listeners() -> (
        Arc<Mutex<Vec<Bytes>>>,
        Arc<Mutex<Vec<bool>>>,
        DataListener,
        TerminatedListener,
    ) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let terms = Arc::new(Mutex::new(Vec::new()));
        let data_cb = {
            let data = Arc::clone(&data);
            Box::new(move |chunk: &FetchedData| data.lock().unwrap().push(chunk.data.clone()))
                as DataListener
        };
        let term_cb = {
            let terms = Arc::clone(&terms);
            Box::new(move |aborted: bool| terms.lock().unwrap().push(aborted))
                as TerminatedListener
        };
        (data, terms, data_cb, term_cb)
    }

    fn params(min_x: u32) -> ImagePartParams {
        ImagePartParams::new(min_x, 0, min_x + 256, 256, 0)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[test]
    fn test_open_rejects_double_open() {
        let net = MockNet::default();
        let manager = open_manager(&net);
        assert_eq!(
            manager.open("wss://elsewhere"),
            Err(FetchError::AlreadyOpen)
        );
        assert_eq!(
            net.state.lock().unwrap().opened.as_deref(),
            Some("wss://imagery.example/stream")
        );
    }

    #[test]
    fn test_request_requires_open() {
        let net = MockNet::default();
        let manager: FetchManager<u32> = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: None,
            prioritizer: None,
        });
        let (_, _, data_cb, term_cb) = collecting_listeners();
        assert_eq!(
            manager.create_request(1, params(0), data_cb, term_cb, false),
            Err(FetchError::NotOpen)
        );
    }

    #[test]
    fn test_request_round_trip() {
        let net = MockNet::default();
        let manager = open_manager(&net);
        let (data, terms, data_cb, term_cb) = collecting_listeners();

        manager
            .create_request(1, params(0), data_cb, term_cb, false)
            .unwrap();
        net.push_data(0, b"pixels", true);

        assert_eq!(data.lock().unwrap().len(), 1);
        assert_eq!(*terms.lock().unwrap(), vec![false]);
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn test_manual_abort_notifies_and_unregisters() {
        let net = MockNet::default();
        let manager = open_manager(&net);
        let (_, terms, data_cb, term_cb) = collecting_listeners();

        manager
            .create_request(1, params(0), data_cb, term_cb, false)
            .unwrap();
        manager.manual_abort_request(1).unwrap();

        assert_eq!(*terms.lock().unwrap(), vec![true]);
        assert_eq!(manager.request_count(), 0);
        assert!(matches!(
            manager.manual_abort_request(1),
            Err(FetchError::UnknownRequest(1))
        ));
    }

    #[test]
    fn test_close_aborts_everything() {
        let net = MockNet::default();
        let manager = open_manager(&net);
        let (_, terms, data_cb, term_cb) = collecting_listeners();
        let (_, ch_terms, ch_data_cb, ch_term_cb) = collecting_listeners();

        manager
            .create_request(1, params(0), data_cb, term_cb, false)
            .unwrap();
        let channel = manager.create_channel(ch_data_cb, ch_term_cb).unwrap();
        manager.move_channel(channel, params(512)).unwrap();

        manager.close();
        assert_eq!(*terms.lock().unwrap(), vec![true]);
        assert_eq!(*ch_terms.lock().unwrap(), vec![true]);
        assert!(net.state.lock().unwrap().closed);
        assert_eq!(manager.request_count(), 0);
        assert_eq!(manager.channel_count(), 0);
    }

    #[test]
    fn test_channel_handles_are_distinct() {
        let net = MockNet::default();
        let manager = open_manager(&net);
        let (_, _, a_data, a_term) = collecting_listeners();
        let (_, _, b_data, b_term) = collecting_listeners();
        let a = manager.create_channel(a_data, a_term).unwrap();
        let b = manager.create_channel(b_data, b_term).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.channel_count(), 2);
    }

    // ========================================================================
    // Prioritizer data
    // ========================================================================

    #[test]
    fn test_prioritizer_data_reaches_attached_prioritizer() {
        use super::super::frustum::FrustumPrioritizerOptions;
        use crate::region::Rect;
        use crate::scheduler::Prioritizer;

        let net = MockNet::default();
        let prioritizer = Arc::new(FrustumRequestsPrioritizer::new(
            FrustumPrioritizerOptions::default(),
        ));
        let manager: FetchManager<u32> = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: None,
            prioritizer: Some(Arc::clone(&prioritizer)),
        });

        let inside = JobContext::new(params(0));
        let before = prioritizer.priority(&inside);
        manager.set_prioritizer_data(Some(FrustumData {
            frustum_rect: Rect::new(0, 0, 256, 256),
            resolution_level: 0,
        }));
        assert!(prioritizer.priority(&inside) > before);
    }

    #[test]
    fn test_server_prioritizer_data_reaches_fetcher() {
        use crate::region::Rect;

        let net = MockNet::default();
        let manager = open_manager(&net);
        let frustum = FrustumData {
            frustum_rect: Rect::new(0, 0, 512, 512),
            resolution_level: 1,
        };
        manager.set_server_request_prioritizer_data(Some(frustum));
        assert_eq!(net.state.lock().unwrap().server_frustum, Some(frustum));
    }

    // ========================================================================
    // Retry-once workaround
    // ========================================================================

    /// Drives a highest-priority request through a scheduler abort, which
    /// must trigger exactly one transparent retry.
    #[test]
    fn test_highest_priority_abort_retries_once() {
        let net = MockNet::default();
        // Prioritizer aborts everything: every admission attempt kills
        // the pending job, standing in for the server-side failure.
        let prioritizer = |_ctx: &JobContext| -1;
        let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> =
            Arc::new(PriorityScheduler::new(
                Vec::new(),
                Arc::new(prioritizer),
                PrioritySchedulerOptions::default(),
            ));
        let manager = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: Some(scheduler),
            prioritizer: None,
        });
        manager.open("wss://imagery.example/stream").unwrap();

        let (_, terms, data_cb, term_cb) = collecting_listeners();
        let overview = params(0).with_priority_data(RequestPriorityData::highest());
        manager
            .create_request(1, overview, data_cb, term_cb, false)
            .unwrap();

        // Both the original and the retry were aborted by the scheduler,
        // but the caller hears about it exactly once.
        assert_eq!(*terms.lock().unwrap(), vec![true]);
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn test_plain_abort_does_not_retry() {
        let net = MockNet::default();
        let prioritizer = |_ctx: &JobContext| -1;
        let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> =
            Arc::new(PriorityScheduler::new(
                Vec::new(),
                Arc::new(prioritizer),
                PrioritySchedulerOptions::default(),
            ));
        let manager = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: Some(scheduler),
            prioritizer: None,
        });
        manager.open("wss://imagery.example/stream").unwrap();

        let (_, terms, data_cb, term_cb) = collecting_listeners();
        manager
            .create_request(1, params(0), data_cb, term_cb, false)
            .unwrap();

        assert_eq!(*terms.lock().unwrap(), vec![true]);
        // No second context was ever requested.
        assert!(net.state.lock().unwrap().created_params.is_empty());
    }

    #[test]
    fn test_manual_abort_of_highest_priority_does_not_retry() {
        let net = MockNet::default();
        let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> =
            Arc::new(LifoScheduler::new(Vec::new()));
        let manager = FetchManager::new(FetchManagerOptions {
            fetcher: Arc::new(net.clone()),
            scheduler: Some(scheduler),
            prioritizer: None,
        });
        manager.open("wss://imagery.example/stream").unwrap();

        let (_, terms, data_cb, term_cb) = collecting_listeners();
        let overview = params(0).with_priority_data(RequestPriorityData::highest());
        manager
            .create_request(1, overview, data_cb, term_cb, false)
            .unwrap();
        manager.manual_abort_request(1).unwrap();

        assert_eq!(*terms.lock().unwrap(), vec![true]);
        assert_eq!(manager.request_count(), 0);
    }
}
