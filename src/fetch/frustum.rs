//! Viewport-driven request prioritization.
//!
//! Scores a pending tile request by how much it matters to what is on
//! screen right now: resolution match first, then the fraction of the
//! tile intersecting the viewport rectangle, bucketed into coarse tiers.
//! The viewport changes with every pan and zoom, so the score of a
//! waiting job drifts; the priority scheduler re-reads it lazily and on
//! rerank rather than caching it.

use crate::region::{JobContext, Rect};
use crate::scheduler::Prioritizer;
use std::sync::RwLock;

/// Score for a request flagged `override_highest_priority`.
pub const PRIORITY_OVERRIDE_HIGHEST: i32 = 100;

/// Score while no viewport has been pushed yet.
///
/// Deliberately non-negative and distinct from an abort: "nothing to
/// prioritize by" must not kill requests made before the first render.
pub const PRIORITY_NO_FRUSTUM_DATA: i32 = 0;

/// Score for a tile finer than the viewport needs.
pub const PRIORITY_RESOLUTION_TOO_FINE: i32 = 1;

/// Score for a tile coarser than the viewport needs.
pub const PRIORITY_RESOLUTION_TOO_COARSE: i32 = 1;

/// Score for a tile not intersecting the viewport at all, when such
/// tiles are kept rather than aborted.
pub const PRIORITY_OUTSIDE_FRUSTUM: i32 = 0;

/// Abort sentinel for tiles outside the viewport in frustum-only mode.
pub const PRIORITY_ABORT: i32 = -1;

/// Intersection tiers, fraction of the tile inside the viewport.
const PRIORITY_FULLY_VISIBLE: i32 = 9; // > 99%
const PRIORITY_MOSTLY_VISIBLE: i32 = 7; // > 70%
const PRIORITY_PARTLY_VISIBLE: i32 = 5; // > 30%
const PRIORITY_SLIGHTLY_VISIBLE: i32 = 3;

/// Added to visible tiles that have not delivered a first stage yet.
const PRIORITY_PROGRESSIVE_BOOST: i32 = 2;

/// The current viewport: a rectangle at a target resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrustumData {
    pub frustum_rect: Rect,
    pub resolution_level: u8,
}

/// Tuning for [`FrustumRequestsPrioritizer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrustumPrioritizerOptions {
    /// Abort requests with zero viewport intersection instead of keeping
    /// them at the lowest score.
    pub abort_outside_frustum: bool,

    /// Boost visible tiles that have produced no progressive stage yet,
    /// so a first rough picture lands fast.
    pub boost_early_progressive: bool,
}

/// Scores requests against the viewport pushed by the renderer.
pub struct FrustumRequestsPrioritizer {
    options: FrustumPrioritizerOptions,
    data: RwLock<Option<FrustumData>>,
}

impl FrustumRequestsPrioritizer {
    pub fn new(options: FrustumPrioritizerOptions) -> Self {
        Self {
            options,
            data: RwLock::new(None),
        }
    }

    /// Replaces the viewport. `None` reverts to the no-data score.
    pub fn set_frustum_data(&self, data: Option<FrustumData>) {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = data;
    }

    fn current(&self) -> Option<FrustumData> {
        match self.data.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Prioritizer<JobContext> for FrustumRequestsPrioritizer {
    fn priority(&self, ctx: &JobContext) -> i32 {
        let params = &ctx.image_part_params;
        if ctx.overrides_highest_priority() {
            return PRIORITY_OVERRIDE_HIGHEST;
        }
        let Some(frustum) = self.current() else {
            return PRIORITY_NO_FRUSTUM_DATA;
        };

        if params.level < frustum.resolution_level {
            return PRIORITY_RESOLUTION_TOO_FINE;
        }
        if params.level > frustum.resolution_level {
            return PRIORITY_RESOLUTION_TOO_COARSE;
        }

        let fraction = params.rect().intersection_fraction(&frustum.frustum_rect);
        if fraction <= 0.0 {
            return if self.options.abort_outside_frustum {
                PRIORITY_ABORT
            } else {
                PRIORITY_OUTSIDE_FRUSTUM
            };
        }

        let tier = if fraction > 0.99 {
            PRIORITY_FULLY_VISIBLE
        } else if fraction > 0.70 {
            PRIORITY_MOSTLY_VISIBLE
        } else if fraction > 0.30 {
            PRIORITY_PARTLY_VISIBLE
        } else {
            PRIORITY_SLIGHTLY_VISIBLE
        };

        if self.options.boost_early_progressive && ctx.stages_done() == 0 {
            tier + PRIORITY_PROGRESSIVE_BOOST
        } else {
            tier
        }
    }
}
