//! TileStream - progressive tiled-imagery streaming engine.
//!
//! Streams large tiled images progressively: coarse data first, refined
//! as more bytes arrive, with work constantly re-prioritized against the
//! viewer's frustum. The crate is organized as a pipeline:
//!
//! - [`region`] - tile geometry, request priority data, job contexts
//! - [`scheduler`] - bounded resource pools with LIFO and priority
//!   admission, cooperative yielding and abort
//! - [`bridge`] - remote-execution bridge onto isolated workers
//! - [`fetch`] - per-region fetch state machines, retargetable channels
//!   and the frustum prioritizer
//! - [`decode`] - per-tile decode jobs with input coalescing, region
//!   fan-out and remote decoders
//!
//! # Example
//!
//! ```ignore
//! use tilestream::config::StreamConfig;
//! use tilestream::decode::{DecodeJobsPool, DecodeJobsPoolOptions};
//! use tilestream::fetch::{FetchManager, FetchManagerOptions};
//!
//! let config = StreamConfig::default();
//! let manager = FetchManager::new(FetchManagerOptions { fetcher, scheduler, prioritizer: None });
//! manager.open("wss://imagery.example/stream")?;
//! let pool = DecodeJobsPool::new(DecodeJobsPoolOptions {
//!     fetch_manager: manager.clone(),
//!     decode_scheduler,
//!     tile_width: config.tile_width(),
//!     tile_height: config.tile_height(),
//! });
//! ```

pub mod bridge;
pub mod config;
pub mod decode;
pub mod fetch;
pub mod logging;
pub mod region;
pub mod scheduler;

/// Version of the tilestream library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
