//! Progressive tile decode pipeline.
//!
//! Regions fork into per-tile [`DecodeJob`]s deduplicated by
//! [`TileKey`](crate::region::TileKey); each job owns the tile's fetch
//! and feeds a bounded decoder pool, coalescing superseded inputs so at
//! most the newest compressed data is ever decoded next. Decoders are
//! [`PixelDecoder`] capabilities; [`RemoteDecoder`] runs the codec on an
//! isolated worker over the bridge.

mod decoder;
mod job;
mod pool;
mod proxy;

pub use decoder::{
    DataForDecode, DecodeDone, DecodeError, DecodeFunction, DecodedPixels, DecodedPixelsMeta,
    PixelDecoder,
};
pub use job::{
    DecodeJob, DecodeScheduler, DecodedTile, DecoderResource, ListenerCore, RegionDataListener,
    RegionTerminatedListener,
};
pub use pool::{DecodeJobsPool, DecodeJobsPoolOptions, ForkError, ListenerHandle};
pub use proxy::{decode_worker_factory, DecodeWorkerService, RemoteDecoder};
