//! Engine configuration.

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_WIDTH: u32 = 256;
/// Default tile edge height in pixels.
pub const DEFAULT_TILE_HEIGHT: u32 = 256;
/// Default number of concurrent fetch slots per connection.
pub const DEFAULT_FETCH_SLOTS: usize = 6;
/// Default number of pooled decoders.
pub const DEFAULT_DECODE_WORKERS: usize = 2;
/// Default backpressure window of a worker connection.
pub const DEFAULT_CALL_BUFFER_SIZE: usize = 5;

/// Configuration for the streaming engine.
///
/// Groups the sizing knobs of the pipeline: the tile grid regions are
/// split on, the fetch and decode pool sizes, and the bridge's call
/// window.
///
/// # Example
///
/// ```
/// use tilestream::config::StreamConfig;
///
/// let config = StreamConfig::default();
/// assert_eq!(config.tile_width(), 256);
/// assert_eq!(config.fetch_slots(), 6);
///
/// let config = StreamConfig::new()
///     .with_tile_size(512, 512)
///     .with_fetch_slots(12)
///     .with_decode_workers(4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Tile grid width in pixels
    tile_width: u32,
    /// Tile grid height in pixels
    tile_height: u32,
    /// Concurrent fetches per connection
    fetch_slots: usize,
    /// Pooled decoder count
    decode_workers: usize,
    /// Unacknowledged calls a worker connection may hold
    call_buffer_size: usize,
}

impl StreamConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tile grid dimensions.
    ///
    /// Regions are split and deduplicated on this grid; it must match
    /// the grid the imagery server serves. Default: 256x256.
    pub fn with_tile_size(mut self, width: u32, height: u32) -> Self {
        self.tile_width = width;
        self.tile_height = height;
        self
    }

    /// Set the number of concurrent fetch slots.
    ///
    /// Bounds how many tile fetches one connection runs at a time.
    /// Default: 6.
    pub fn with_fetch_slots(mut self, slots: usize) -> Self {
        self.fetch_slots = slots;
        self
    }

    /// Set the number of pooled decoders.
    ///
    /// Each decoder is an isolated worker; higher values trade memory
    /// for decode throughput. Default: 2.
    pub fn with_decode_workers(mut self, workers: usize) -> Self {
        self.decode_workers = workers;
        self
    }

    /// Set the backpressure window of worker connections.
    ///
    /// Calls beyond this many unacknowledged sends are queued on the
    /// controller side. Default: 5.
    pub fn with_call_buffer_size(mut self, size: usize) -> Self {
        self.call_buffer_size = size;
        self
    }

    /// Get the tile grid width in pixels.
    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    /// Get the tile grid height in pixels.
    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// Get the number of concurrent fetch slots.
    pub fn fetch_slots(&self) -> usize {
        self.fetch_slots
    }

    /// Get the number of pooled decoders.
    pub fn decode_workers(&self) -> usize {
        self.decode_workers
    }

    /// Get the backpressure window of worker connections.
    pub fn call_buffer_size(&self) -> usize {
        self.call_buffer_size
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            tile_width: DEFAULT_TILE_WIDTH,
            tile_height: DEFAULT_TILE_HEIGHT,
            fetch_slots: DEFAULT_FETCH_SLOTS,
            decode_workers: DEFAULT_DECODE_WORKERS,
            call_buffer_size: DEFAULT_CALL_BUFFER_SIZE,
        }
    }
}
