//! Region-to-tile fan-out with per-tile job deduplication.
//!
//! `fork_decode_jobs` splits a requested region into tile-aligned parts
//! and attaches a listener to each tile's [`DecodeJob`]. The pool keeps
//! at most one live job per [`TileKey`]: overlapping regions share the
//! tile's fetch and decode work instead of repeating it. A job leaves
//! the pool when it terminates; the next fork of the same tile creates
//! a fresh one.

use super::job::{
    DecodeJob, DecodeScheduler, ListenerCore, RegionDataListener, RegionTerminatedListener,
};
use crate::fetch::FetchManager;
use crate::region::{ImagePartParams, Rect, RegionError, TileKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};

/// Configuration of a [`DecodeJobsPool`].
pub struct DecodeJobsPoolOptions<R: Send + 'static> {
    pub fetch_manager: FetchManager<R>,
    pub decode_scheduler: DecodeScheduler,
    /// Granularity of the tile grid; regions are split on these bounds.
    pub tile_width: u32,
    pub tile_height: u32,
}

/// Errors raised when forking a region into decode jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    #[error(transparent)]
    Region(#[from] RegionError),
}

struct Inner<R: Send + 'static> {
    fetch_manager: FetchManager<R>,
    decode_scheduler: DecodeScheduler,
    tile_width: u32,
    tile_height: u32,
    jobs: Mutex<HashMap<TileKey, DecodeJob<R>>>,
}

/// Shared pool of per-tile decode jobs.
pub struct DecodeJobsPool<R: Send + 'static> {
    inner: Arc<Inner<R>>,
}

impl<R: Send + 'static> Clone for DecodeJobsPool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One fork's registration across all of its tiles.
///
/// Dropping the handle does NOT unregister; call
/// [`unregister`](ListenerHandle::unregister) to stop receiving results
/// and release the fetches this fork keeps alive.
pub struct ListenerHandle<R: Send + 'static> {
    core: Arc<ListenerCore>,
    jobs: Vec<DecodeJob<R>>,
}

impl<R: Send + 'static> ListenerHandle<R> {
    /// Detaches this fork's listener from every tile it registered
    /// with. Tiles whose last listener goes away get their fetch
    /// aborted. No callbacks fire after this returns.
    pub fn unregister(&self) {
        self.core.mark_unregistered();
        for job in &self.jobs {
            job.unregister_listener(&self.core);
        }
    }

    /// Fetched bytes relevant to this fork's region so far.
    pub fn all_relevant_bytes_loaded(&self) -> u64 {
        self.core.all_relevant_bytes_loaded()
    }

    /// Tiles of this fork that have not terminated yet.
    pub fn remaining_decode_jobs(&self) -> usize {
        self.core.remaining_decode_jobs()
    }
}

impl<R: Send + 'static> DecodeJobsPool<R> {
    pub fn new(options: DecodeJobsPoolOptions<R>) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetch_manager: options.fetch_manager,
                decode_scheduler: options.decode_scheduler,
                tile_width: options.tile_width,
                tile_height: options.tile_height,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Live (non-terminated) jobs currently pooled.
    pub fn job_count(&self) -> usize {
        Inner::lock_jobs(&self.inner).len()
    }

    /// Splits `region` into tiles and attaches one listener per tile.
    ///
    /// Tiles fully covered by a rectangle in `regions_not_needed` are
    /// skipped. If every tile is skipped the terminated listener fires
    /// synchronously, before this returns. A tile whose fetch cannot be
    /// started counts as aborted rather than failing the whole fork.
    #[allow(clippy::too_many_arguments)]
    pub fn fork_decode_jobs(
        &self,
        region: ImagePartParams,
        on_data: RegionDataListener,
        on_terminated: RegionTerminatedListener,
        level_width: u32,
        level_height: u32,
        is_progressive: bool,
        regions_not_needed: &[Rect],
    ) -> Result<ListenerHandle<R>, ForkError> {
        region.validate(
            self.inner.tile_width,
            self.inner.tile_height,
            level_width,
            level_height,
        )?;

        let tiles = self.split_into_tiles(&region, level_width, level_height, regions_not_needed);
        let core = ListenerCore::new(tiles.len(), on_data, on_terminated);
        debug!(
            min_x = region.min_x,
            min_y = region.min_y,
            level = region.level,
            tiles = tiles.len(),
            "region forked into decode jobs"
        );

        let mut handle = ListenerHandle {
            core: Arc::clone(&core),
            jobs: Vec::with_capacity(tiles.len()),
        };
        for tile in tiles {
            let key = tile.tile_key(self.inner.tile_width, self.inner.tile_height);
            let (job, created) = self.attach(key, tile, &core, region.rect());
            if created {
                if let Err(err) = job.start(is_progressive) {
                    warn!(tile = %key, error = %err, "tile fetch failed to start");
                }
            }
            handle.jobs.push(job);
        }
        Ok(handle)
    }

    /// Finds or creates the tile's job and registers the listener on
    /// it, replacing a job that terminated racily.
    fn attach(
        &self,
        key: TileKey,
        tile: ImagePartParams,
        core: &Arc<ListenerCore>,
        region: Rect,
    ) -> (DecodeJob<R>, bool) {
        loop {
            let (job, created) = {
                let mut jobs = Inner::lock_jobs(&self.inner);
                match jobs.get(&key) {
                    Some(existing) if !existing.is_terminated() => (existing.clone(), false),
                    _ => {
                        let job = self.new_job(key, tile);
                        jobs.insert(key, job.clone());
                        (job, true)
                    }
                }
            };
            // Registration may lose a race against termination; fork a
            // replacement and try again.
            if job.register_listener(Arc::clone(core), region) {
                return (job, created);
            }
        }
    }

    fn new_job(&self, key: TileKey, tile: ImagePartParams) -> DecodeJob<R> {
        let weak = Arc::downgrade(&self.inner);
        DecodeJob::new(
            key,
            tile,
            self.inner.fetch_manager.clone(),
            Arc::clone(&self.inner.decode_scheduler),
            Box::new(move |key| {
                Inner::forget(&weak, key);
            }),
        )
    }

    /// Tile-aligned sub-regions of `region`, clamped to level bounds,
    /// minus the ones the caller already has.
    fn split_into_tiles(
        &self,
        region: &ImagePartParams,
        level_width: u32,
        level_height: u32,
        regions_not_needed: &[Rect],
    ) -> Vec<ImagePartParams> {
        let tw = self.inner.tile_width;
        let th = self.inner.tile_height;
        let mut tiles = Vec::new();

        let mut ty = (region.min_y / th) * th;
        while ty < region.max_y_exclusive {
            let mut tx = (region.min_x / tw) * tw;
            while tx < region.max_x_exclusive {
                let rect = Rect::new(
                    tx,
                    ty,
                    (tx + tw).min(level_width),
                    (ty + th).min(level_height),
                );
                let needed = !regions_not_needed
                    .iter()
                    .any(|skip| rect.is_covered_by(skip));
                if needed {
                    let mut tile = ImagePartParams::new(
                        rect.min_x,
                        rect.min_y,
                        rect.max_x_exclusive,
                        rect.max_y_exclusive,
                        region.level,
                    )
                    .with_priority_data(region.request_priority_data);
                    tile.quality = region.quality;
                    tiles.push(tile);
                }
                tx += tw;
            }
            ty += th;
        }
        tiles
    }
}

impl<R: Send + 'static> Inner<R> {
    fn lock_jobs(inner: &Arc<Self>) -> MutexGuard<'_, HashMap<TileKey, DecodeJob<R>>> {
        match inner.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drops the pooled entry for a terminated job. A replacement job
    /// under the same key is left alone.
    fn forget(weak: &Weak<Self>, key: TileKey) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut jobs = Self::lock_jobs(&inner);
        if let Some(job) = jobs.get(&key) {
            if job.is_terminated() {
                jobs.remove(&key);
            }
        }
    }
}
