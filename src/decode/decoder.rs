//! Injected pixel-decoding capability.
//!
//! Decode is the expensive half of the pipeline, so it runs behind a
//! capability boundary: the pool drives any [`PixelDecoder`], whether an
//! in-process function or a handle onto an isolated worker (see
//! [`RemoteDecoder`](super::RemoteDecoder)).

use crate::region::ImagePartParams;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One coalesced unit of compressed input for a tile decode.
#[derive(Debug, Clone)]
pub struct DataForDecode {
    /// The tile region the bytes encode.
    pub params: ImagePartParams,
    /// The progressive tier the bytes reach.
    pub quality: Option<u16>,
    pub data: Bytes,
}

/// A decoded tile: raw pixels for the tile's rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPixels {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

/// Wire shape of a decode result, minus the pixel payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct DecodedPixelsMeta {
    pub width: u32,
    pub height: u32,
}

/// Completion callback of one decode.
pub type DecodeDone = Box<dyn FnOnce(Result<DecodedPixels, DecodeError>) + Send>;

/// Asynchronous decode capability driven by the pool.
pub trait PixelDecoder: Send + Sync {
    /// Decodes `input`; `on_done` fires exactly once, possibly from
    /// another task, never re-entrantly from within this call.
    fn decode(&self, input: DataForDecode, on_done: DecodeDone);
}

/// The synchronous codec a decode worker hosts.
pub trait DecodeFunction: Send + Sync {
    fn decode(&self, input: DataForDecode) -> Result<DecodedPixels, DecodeError>;
}

impl<F> DecodeFunction for F
where
    F: Fn(DataForDecode) -> Result<DecodedPixels, DecodeError> + Send + Sync,
{
    fn decode(&self, input: DataForDecode) -> Result<DecodedPixels, DecodeError> {
        self(input)
    }
}

/// Errors raised by the decode pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The codec rejected the input.
    #[error("decode failed: {0}")]
    Decoder(String),

    /// The remote decode worker failed or the connection is corrupt.
    #[error("decode worker failure: {0}")]
    Worker(String),

    /// A decode reply arrived without its pixel payload.
    #[error("decode result is missing its pixel payload")]
    MissingPayload,

    /// A decode reply did not match the expected shape.
    #[error("malformed decode result: {0}")]
    InvalidResult(String),
}
