//! Region and tile coordinate model.
//!
//! All requests into the engine are expressed as [`ImagePartParams`]: a
//! half-open, tile-aligned rectangle at a given resolution level and
//! progressive quality tier. A multi-tile request is split into per-tile
//! parts by the decode pool; each part maps to exactly one [`TileKey`],
//! the deduplication unit for decode work.

use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle with half-open bounds.
///
/// `max_x_exclusive`/`max_y_exclusive` are one past the last contained
/// coordinate, so an empty rectangle has `min == max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x_exclusive: u32,
    pub max_y_exclusive: u32,
}

impl Rect {
    /// Creates a rectangle from half-open bounds.
    pub fn new(min_x: u32, min_y: u32, max_x_exclusive: u32, max_y_exclusive: u32) -> Self {
        Self {
            min_x,
            min_y,
            max_x_exclusive,
            max_y_exclusive,
        }
    }

    /// Returns the width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.max_x_exclusive.saturating_sub(self.min_x)
    }

    /// Returns the height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.max_y_exclusive.saturating_sub(self.min_y)
    }

    /// Returns the area in pixels.
    #[inline]
    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Returns true if the rectangle contains no pixels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min_x >= self.max_x_exclusive || self.min_y >= self.max_y_exclusive
    }

    /// Returns the intersection with another rectangle, or `None` if disjoint.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let r = Rect {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x_exclusive: self.max_x_exclusive.min(other.max_x_exclusive),
            max_y_exclusive: self.max_y_exclusive.min(other.max_y_exclusive),
        };
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    /// Returns the fraction of this rectangle's area covered by `other`,
    /// in `0.0..=1.0`.
    pub fn intersection_fraction(&self, other: &Rect) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        match self.intersection(other) {
            Some(i) => i.area() as f64 / self.area() as f64,
            None => 0.0,
        }
    }

    /// Returns true if `other` completely covers this rectangle.
    pub fn is_covered_by(&self, other: &Rect) -> bool {
        !self.is_empty()
            && other.min_x <= self.min_x
            && other.min_y <= self.min_y
            && other.max_x_exclusive >= self.max_x_exclusive
            && other.max_y_exclusive >= self.max_y_exclusive
    }
}

/// Priority metadata attached to a request by the caller.
///
/// The frustum itself is pushed to the prioritizer out of band (it changes
/// with every pan/zoom); per-request data carries only what is fixed for
/// the request's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPriorityData {
    /// Always score this request at the maximum priority.
    ///
    /// Used for the one-time low-resolution overview fetch that must land
    /// before anything else.
    pub override_highest_priority: bool,
}

impl RequestPriorityData {
    /// Priority data that always wins.
    pub fn highest() -> Self {
        Self {
            override_highest_priority: true,
        }
    }
}

/// A tile-aligned region request: the unit of work entering the engine.
///
/// Bounds are half-open and must be aligned to the tile grid at `level`
/// (validated by [`ImagePartParams::validate`]). `quality` selects the
/// progressive refinement tier; `None` means "best available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePartParams {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x_exclusive: u32,
    pub max_y_exclusive: u32,
    /// Resolution level, 0 = full resolution.
    pub level: u8,
    /// Progressive quality tier; `None` requests the best available.
    pub quality: Option<u16>,
    pub request_priority_data: RequestPriorityData,
}

impl ImagePartParams {
    /// Creates a request for the given half-open bounds at `level`.
    pub fn new(
        min_x: u32,
        min_y: u32,
        max_x_exclusive: u32,
        max_y_exclusive: u32,
        level: u8,
    ) -> Self {
        Self {
            min_x,
            min_y,
            max_x_exclusive,
            max_y_exclusive,
            level,
            quality: None,
            request_priority_data: RequestPriorityData::default(),
        }
    }

    /// Sets the progressive quality tier.
    pub fn with_quality(mut self, quality: u16) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Sets the per-request priority data.
    pub fn with_priority_data(mut self, data: RequestPriorityData) -> Self {
        self.request_priority_data = data;
        self
    }

    /// Returns the region as a [`Rect`].
    pub fn rect(&self) -> Rect {
        Rect {
            min_x: self.min_x,
            min_y: self.min_y,
            max_x_exclusive: self.max_x_exclusive,
            max_y_exclusive: self.max_y_exclusive,
        }
    }

    /// Validates the tile alignment and bounds of this request.
    ///
    /// `level_width`/`level_height` are the image dimensions at `self.level`;
    /// the last tile row/column may be smaller than the tile size, so bounds
    /// clamped to the image edge count as aligned.
    pub fn validate(
        &self,
        tile_width: u32,
        tile_height: u32,
        level_width: u32,
        level_height: u32,
    ) -> Result<(), RegionError> {
        if self.min_x >= self.max_x_exclusive || self.min_y >= self.max_y_exclusive {
            return Err(RegionError::EmptyRegion);
        }
        if self.max_x_exclusive > level_width || self.max_y_exclusive > level_height {
            return Err(RegionError::OutOfBounds {
                level_width,
                level_height,
            });
        }
        let aligned = self.min_x % tile_width == 0
            && self.min_y % tile_height == 0
            && (self.max_x_exclusive % tile_width == 0 || self.max_x_exclusive == level_width)
            && (self.max_y_exclusive % tile_height == 0 || self.max_y_exclusive == level_height);
        if !aligned {
            return Err(RegionError::NotTileAligned {
                tile_width,
                tile_height,
            });
        }
        Ok(())
    }

    /// Returns the key of the single tile covered by this part.
    ///
    /// Valid only for per-tile parts produced by the decode pool's split.
    pub fn tile_key(&self, tile_width: u32, tile_height: u32) -> TileKey {
        TileKey {
            tile_x: self.min_x / tile_width,
            tile_y: self.min_y / tile_height,
            level: self.level,
            quality: self.quality,
        }
    }
}

/// Errors from region validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    /// The half-open bounds describe no pixels.
    #[error("region is empty")]
    EmptyRegion,

    /// The region extends past the image at its level.
    #[error("region exceeds level bounds {level_width}x{level_height}")]
    OutOfBounds { level_width: u32, level_height: u32 },

    /// The region bounds are not aligned to the tile grid.
    #[error("region is not aligned to {tile_width}x{tile_height} tiles")]
    NotTileAligned { tile_width: u32, tile_height: u32 },
}

/// Identity of a single tile at a given level and quality tier.
///
/// Two overlapping callers asking for the same tile produce the same key;
/// decode work is deduplicated on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    pub tile_x: u32,
    pub tile_y: u32,
    pub level: u8,
    pub quality: Option<u16>,
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.quality {
            Some(q) => write!(
                f,
                "tile({},{})@L{}/q{}",
                self.tile_x, self.tile_y, self.level, q
            ),
            None => write!(f, "tile({},{})@L{}", self.tile_x, self.tile_y, self.level),
        }
    }
}

/// The schedulable unit: a region request plus its progressive position.
///
/// Owned by exactly one fetch or decode job; prioritizers score pending
/// work by reading this context.
#[derive(Debug)]
pub struct JobContext {
    pub image_part_params: ImagePartParams,
    /// Number of progressive stages already delivered for this request.
    pub progressive_stages_done: std::sync::atomic::AtomicUsize,
    /// Live copy of the override flag; mutable after enqueue so priority
    /// data can be raised or dropped while the job waits.
    override_highest_priority: std::sync::atomic::AtomicBool,
}

impl JobContext {
    /// Creates a context for a fresh request.
    pub fn new(image_part_params: ImagePartParams) -> Self {
        let override_flag = image_part_params.request_priority_data.override_highest_priority;
        Self {
            image_part_params,
            progressive_stages_done: std::sync::atomic::AtomicUsize::new(0),
            override_highest_priority: std::sync::atomic::AtomicBool::new(override_flag),
        }
    }

    /// True if this request always scores at the maximum priority.
    pub fn overrides_highest_priority(&self) -> bool {
        self.override_highest_priority
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Replaces the request's priority data.
    pub fn set_priority_data(&self, data: RequestPriorityData) {
        self.override_highest_priority
            .store(data.override_highest_priority, std::sync::atomic::Ordering::Relaxed);
    }

    /// Returns how many progressive stages have completed.
    pub fn stages_done(&self) -> usize {
        self.progressive_stages_done
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Records one more completed progressive stage.
    pub fn record_stage_done(&self) {
        self.progressive_stages_done
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
