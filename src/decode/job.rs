//! Per-tile decode state machine.
//!
//! A [`DecodeJob`] owns the fetch for one tile plus at most one decode
//! in flight at a time. Compressed chunks arrive progressively; decode
//! is expensive, so inputs are **coalesced**: the very first chunk is
//! always decoded (cheap, puts something on screen), while later chunks
//! overwrite a single pending slot so only the newest data is decoded
//! next. Every started decode gets a sequence id; a completion at or
//! below the last delivered id is stale and silently discarded, so
//! listeners observe results in non-decreasing sequence order.
//!
//! Several overlapping region requests can share one tile. Each holds a
//! listener registration; results are offset into each listener's region
//! and fetched-byte counts are delta-propagated per listener. When the
//! last listener unregisters, the tile's fetch is aborted.

use super::decoder::{DataForDecode, DecodeError, DecodedPixels, PixelDecoder};
use crate::fetch::{FetchManager, FetchedData, RequestId};
use crate::region::{ImagePartParams, JobContext, Rect, TileKey};
use crate::scheduler::{ResourceScheduler, ScheduledJob};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace};

/// A pooled decoder handle: the decode scheduler's resource type.
pub type DecoderResource = Arc<dyn PixelDecoder>;

/// Scheduler of the bounded decoder pool.
pub type DecodeScheduler = Arc<dyn ResourceScheduler<DecoderResource, JobContext>>;

/// Receives decoded tiles for one registered region.
pub type RegionDataListener = Box<dyn FnMut(&DecodedTile) + Send>;

/// Terminal notification for one registered region; `true` = aborted.
pub type RegionTerminatedListener = Box<dyn FnOnce(bool) + Send>;

/// A decoded tile positioned inside a listener's region.
#[derive(Debug, Clone)]
pub struct DecodedTile {
    /// The tile that was decoded.
    pub tile_params: ImagePartParams,
    /// Tile origin relative to the listener's region origin.
    pub offset_x: u32,
    pub offset_y: u32,
    /// The progressive tier this result reaches.
    pub quality: Option<u16>,
    /// Decode ordering witness, strictly increasing per delivery.
    pub sequence_id: u64,
    pub pixels: DecodedPixels,
}

// ============================================================================
// Listener core
// ============================================================================

/// Shared state behind one fork's listener handle.
///
/// Counts down tiles as they terminate and aggregates per-listener byte
/// accounting; fires the terminated listener exactly once, when the last
/// tile finishes.
pub struct ListenerCore {
    state: Mutex<ListenerState>,
}

struct ListenerState {
    remaining: usize,
    any_aborted: bool,
    bytes_loaded: u64,
    on_data: Option<RegionDataListener>,
    on_terminated: Option<RegionTerminatedListener>,
    unregistered: bool,
}

impl ListenerCore {
    pub(crate) fn new(
        remaining: usize,
        on_data: RegionDataListener,
        on_terminated: RegionTerminatedListener,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            state: Mutex::new(ListenerState {
                remaining,
                any_aborted: false,
                bytes_loaded: 0,
                on_data: Some(on_data),
                on_terminated: Some(on_terminated),
                unregistered: false,
            }),
        });
        if remaining == 0 {
            // Nothing to decode: the terminal notification still fires.
            core.fire_terminated();
        }
        core
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Total fetched bytes relevant to this listener's region.
    pub fn all_relevant_bytes_loaded(&self) -> u64 {
        self.lock().bytes_loaded
    }

    /// Tiles whose jobs have not terminated yet.
    pub fn remaining_decode_jobs(&self) -> usize {
        self.lock().remaining
    }

    pub(crate) fn mark_unregistered(&self) {
        self.lock().unregistered = true;
    }

    pub(crate) fn add_bytes(&self, delta: u64) {
        self.lock().bytes_loaded += delta;
    }

    /// Delivers one decoded tile. The callback runs outside the state
    /// lock so a listener may unregister from within it.
    pub(crate) fn deliver(&self, tile: &DecodedTile) {
        let callback = {
            let mut st = self.lock();
            if st.unregistered {
                return;
            }
            st.on_data.take()
        };
        if let Some(mut callback) = callback {
            callback(tile);
            let mut st = self.lock();
            if st.on_data.is_none() {
                st.on_data = Some(callback);
            }
        }
    }

    /// One of this listener's tiles terminated.
    pub(crate) fn tile_terminated(&self, aborted: bool) {
        let fire = {
            let mut st = self.lock();
            st.remaining = st.remaining.saturating_sub(1);
            st.any_aborted |= aborted;
            st.remaining == 0
        };
        if fire {
            self.fire_terminated();
        }
    }

    fn fire_terminated(&self) {
        let callback = {
            let mut st = self.lock();
            if st.unregistered {
                return;
            }
            st.on_terminated.take().map(|cb| (cb, st.any_aborted))
        };
        if let Some((callback, aborted)) = callback {
            callback(aborted);
        }
    }
}

// ============================================================================
// Decode job
// ============================================================================

struct Registration {
    core: Arc<ListenerCore>,
    region: Rect,
}

struct JobState {
    registrations: Vec<Registration>,
    /// Input waiting for a decoder; consumed when the sub-job is admitted.
    current_input: Option<DataForDecode>,
    /// Newest input superseding `current_input` while a decode runs.
    pending_input: Option<DataForDecode>,
    /// A decode sub-job is enqueued or running.
    decode_active: bool,
    next_sequence_id: u64,
    delivered_sequence_id: u64,
    /// Kept so a listener registering mid-flight still sees the newest
    /// result.
    last_result: Option<(u64, Option<u16>, DecodedPixels)>,
    bytes_loaded: u64,
    fetch_done: bool,
    terminated: bool,
}

struct JobShared<R: Send + 'static> {
    key: TileKey,
    tile_params: ImagePartParams,
    fetch_manager: FetchManager<R>,
    fetch_request_id: RequestId,
    decode_scheduler: DecodeScheduler,
    ctx: Arc<JobContext>,
    state: Mutex<JobState>,
    /// Notifies the owning pool so it can drop its map entry.
    on_removed: Mutex<Option<Box<dyn FnOnce(TileKey) + Send>>>,
}

/// Decode work for one tile; shared by every fork touching the tile.
pub struct DecodeJob<R: Send + 'static> {
    shared: Arc<JobShared<R>>,
}

impl<R: Send + 'static> Clone for DecodeJob<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: Send + 'static> DecodeJob<R> {
    pub(crate) fn new(
        key: TileKey,
        tile_params: ImagePartParams,
        fetch_manager: FetchManager<R>,
        decode_scheduler: DecodeScheduler,
        on_removed: Box<dyn FnOnce(TileKey) + Send>,
    ) -> Self {
        let fetch_request_id = fetch_manager.allocate_request_id();
        Self {
            shared: Arc::new(JobShared {
                key,
                tile_params,
                fetch_manager,
                fetch_request_id,
                decode_scheduler,
                ctx: Arc::new(JobContext::new(tile_params)),
                state: Mutex::new(JobState {
                    registrations: Vec::new(),
                    current_input: None,
                    pending_input: None,
                    decode_active: false,
                    next_sequence_id: 0,
                    delivered_sequence_id: 0,
                    last_result: None,
                    bytes_loaded: 0,
                    fetch_done: false,
                    terminated: false,
                }),
                on_removed: Mutex::new(Some(on_removed)),
            }),
        }
    }

    pub fn key(&self) -> TileKey {
        self.shared.key
    }

    /// Registered listeners; the dedup law exposes this.
    pub fn listener_count(&self) -> usize {
        JobShared::lock(&self.shared).registrations.len()
    }

    pub fn is_terminated(&self) -> bool {
        JobShared::lock(&self.shared).terminated
    }

    /// Attaches a listener. Fails if the job already terminated, in
    /// which case the caller must fork a fresh job.
    pub(crate) fn register_listener(&self, core: Arc<ListenerCore>, region: Rect) -> bool {
        let (bytes, replay) = {
            let mut st = JobShared::lock(&self.shared);
            if st.terminated {
                return false;
            }
            st.registrations.push(Registration {
                core: Arc::clone(&core),
                region,
            });
            (st.bytes_loaded, st.last_result.clone())
        };
        // Catch the late joiner up with what already happened.
        if bytes > 0 {
            core.add_bytes(bytes);
        }
        if let Some((sequence_id, quality, pixels)) = replay {
            let tile = Self::offset_tile(
                self.shared.tile_params,
                &region,
                quality,
                sequence_id,
                pixels,
            );
            core.deliver(&tile);
        }
        true
    }

    /// Detaches a listener; aborts the tile's fetch when the last one
    /// goes away.
    pub(crate) fn unregister_listener(&self, core: &Arc<ListenerCore>) {
        let abort = {
            let mut st = JobShared::lock(&self.shared);
            st.registrations
                .retain(|reg| !Arc::ptr_eq(&reg.core, core));
            st.registrations.is_empty() && !st.terminated
        };
        if abort {
            debug!(tile = %self.shared.key, "last listener gone, aborting tile fetch");
            let _ = self
                .shared
                .fetch_manager
                .manual_abort_request(self.shared.fetch_request_id);
        }
    }

    /// Starts the tile's fetch. Called once, after the first listener is
    /// registered, so a synchronous abort still notifies it.
    pub(crate) fn start(&self, is_progressive: bool) -> Result<(), crate::fetch::FetchError> {
        let shared = Arc::clone(&self.shared);
        let data_shared = Arc::clone(&self.shared);
        let started = self.shared.fetch_manager.create_request(
            self.shared.fetch_request_id,
            self.shared.tile_params,
            Box::new(move |chunk: &FetchedData| {
                JobShared::on_fetch_data(&data_shared, chunk);
            }),
            Box::new(move |aborted| {
                JobShared::on_fetch_terminated(&shared, aborted);
            }),
            false,
        );
        if let Err(err) = started {
            JobShared::terminate(&self.shared, true);
            return Err(err);
        }
        if !is_progressive {
            let _ = self
                .shared
                .fetch_manager
                .set_is_progressive_request(self.shared.fetch_request_id, false);
        }
        Ok(())
    }

    fn offset_tile(
        tile_params: ImagePartParams,
        region: &Rect,
        quality: Option<u16>,
        sequence_id: u64,
        pixels: DecodedPixels,
    ) -> DecodedTile {
        DecodedTile {
            tile_params,
            offset_x: tile_params.min_x.saturating_sub(region.min_x),
            offset_y: tile_params.min_y.saturating_sub(region.min_y),
            quality,
            sequence_id,
            pixels,
        }
    }
}

impl<R: Send + 'static> JobShared<R> {
    fn lock(shared: &Arc<Self>) -> MutexGuard<'_, JobState> {
        match shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A compressed chunk arrived for the tile.
    fn on_fetch_data(shared: &Arc<Self>, chunk: &FetchedData) {
        let (cores, enqueue) = {
            let mut st = Self::lock(shared);
            if st.terminated {
                return;
            }
            let delta = chunk.data.len() as u64;
            st.bytes_loaded += delta;
            let cores: Vec<Arc<ListenerCore>> = st
                .registrations
                .iter()
                .map(|reg| Arc::clone(&reg.core))
                .collect();

            let input = DataForDecode {
                params: shared.tile_params,
                quality: chunk.quality,
                data: chunk.data.clone(),
            };
            let enqueue = if st.decode_active {
                // Coalesce: only the newest input is worth decoding.
                if st.pending_input.replace(input).is_some() {
                    trace!(tile = %shared.key, "superseded decode input dropped");
                }
                false
            } else {
                st.decode_active = true;
                st.current_input = Some(input);
                true
            };
            (cores, enqueue)
        };

        let delta = chunk.data.len() as u64;
        for core in cores {
            core.add_bytes(delta);
        }
        if enqueue {
            Self::enqueue_decode(shared);
        }
    }

    /// Puts one decode sub-job into the decoder pool.
    fn enqueue_decode(shared: &Arc<Self>) {
        let run_shared = Arc::clone(shared);
        let abort_shared = Arc::clone(shared);
        shared.decode_scheduler.enqueue_job(ScheduledJob::new(
            Arc::clone(&shared.ctx),
            Box::new(move |decoder: DecoderResource, _ctx| {
                Self::on_decoder_admitted(&run_shared, decoder);
            }),
            Box::new(move |_ctx| {
                Self::terminate(&abort_shared, true);
            }),
        ));
    }

    /// The scheduler handed us a decoder: run the newest input.
    fn on_decoder_admitted(shared: &Arc<Self>, decoder: DecoderResource) {
        let input = {
            let mut st = Self::lock(shared);
            if st.terminated {
                None
            } else {
                st.current_input.take().map(|input| {
                    st.next_sequence_id += 1;
                    (input, st.next_sequence_id)
                })
            }
        };

        let Some((input, sequence_id)) = input else {
            let mut st = Self::lock(shared);
            st.decode_active = false;
            drop(st);
            shared
                .decode_scheduler
                .job_done(decoder, &shared.ctx);
            return;
        };

        let quality = input.quality;
        let done_shared = Arc::clone(shared);
        let done_decoder = Arc::clone(&decoder);
        decoder.decode(
            input,
            Box::new(move |result| {
                Self::on_decode_done(&done_shared, done_decoder, sequence_id, quality, result);
            }),
        );
    }

    fn on_decode_done(
        shared: &Arc<Self>,
        decoder: DecoderResource,
        sequence_id: u64,
        quality: Option<u16>,
        result: Result<DecodedPixels, DecodeError>,
    ) {
        shared.decode_scheduler.job_done(decoder, &shared.ctx);

        let pixels = match result {
            Ok(pixels) => pixels,
            Err(err) => {
                error!(tile = %shared.key, error = %err, "tile decode failed");
                Self::terminate(shared, true);
                return;
            }
        };

        enum Next {
            DecodePending,
            Complete,
            Wait,
        }

        let (deliveries, next) = {
            let mut st = Self::lock(shared);
            if st.terminated {
                return;
            }

            let deliveries = if sequence_id > st.delivered_sequence_id {
                st.delivered_sequence_id = sequence_id;
                st.last_result = Some((sequence_id, quality, pixels.clone()));
                shared.ctx.record_stage_done();
                st.registrations
                    .iter()
                    .map(|reg| {
                        (
                            Arc::clone(&reg.core),
                            DecodeJob::<R>::offset_tile(
                                shared.tile_params,
                                &reg.region,
                                quality,
                                sequence_id,
                                pixels.clone(),
                            ),
                        )
                    })
                    .collect()
            } else {
                trace!(tile = %shared.key, sequence_id, "stale decode result discarded");
                Vec::new()
            };

            let next = if let Some(input) = st.pending_input.take() {
                st.current_input = Some(input);
                Next::DecodePending
            } else {
                st.decode_active = false;
                if st.fetch_done {
                    Next::Complete
                } else {
                    Next::Wait
                }
            };
            (deliveries, next)
        };

        for (core, tile) in &deliveries {
            core.deliver(tile);
        }

        match next {
            // decode_active stayed set across the handoff.
            Next::DecodePending => Self::enqueue_decode(shared),
            Next::Complete => Self::terminate(shared, false),
            Next::Wait => {}
        }
    }

    fn on_fetch_terminated(shared: &Arc<Self>, aborted: bool) {
        if aborted {
            Self::terminate(shared, true);
            return;
        }
        let complete = {
            let mut st = Self::lock(shared);
            st.fetch_done = true;
            !st.decode_active && st.pending_input.is_none() && st.current_input.is_none()
        };
        if complete {
            Self::terminate(shared, false);
        }
    }

    /// Terminal transition: notify every listener once, release the
    /// fetch, tell the pool to forget this tile.
    fn terminate(shared: &Arc<Self>, aborted: bool) {
        let (registrations, abort_fetch) = {
            let mut st = Self::lock(shared);
            if st.terminated {
                return;
            }
            st.terminated = true;
            st.current_input = None;
            st.pending_input = None;
            (
                std::mem::take(&mut st.registrations),
                !st.fetch_done,
            )
        };

        if abort_fetch {
            let _ = shared
                .fetch_manager
                .manual_abort_request(shared.fetch_request_id);
        }
        for reg in &registrations {
            reg.core.tile_terminated(aborted);
        }

        let on_removed = {
            let mut slot = match shared.on_removed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(on_removed) = on_removed {
            on_removed(shared.key);
        }
    }
}
