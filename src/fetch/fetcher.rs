//! Injected network capability.
//!
//! The pipeline never talks to the network itself; it drives an injected
//! [`Fetcher`] through these traits. A [`DataContext`] accumulates data
//! for one target region and raises data events; a [`FetchHandle`]
//! controls one in-flight transfer, including the pause/resume cycle the
//! yield protocol needs and the retarget operation backing channels.

use super::frustum::FrustumData;
use crate::region::{ImagePartParams, RegionError};
use bytes::Bytes;

/// One chunk of fetched data for a target region.
///
/// Progressive sources deliver several chunks of increasing quality for
/// the same region; `quality` identifies the refinement tier reached.
#[derive(Debug, Clone)]
pub struct FetchedData {
    pub data: Bytes,
    pub quality: Option<u16>,
}

/// Accumulates fetched data for one target region.
///
/// Created before the fetch starts; the data listener fires whenever new
/// data becomes available (possibly before the listener is installed, so
/// callers must check [`has_data`](DataContext::has_data) after
/// installing it).
///
/// Data events must never fire re-entrantly from within
/// [`set_data_listener`](DataContext::set_data_listener) or a
/// [`Fetcher`] call; implementations raise them from their own task.
pub trait DataContext: Send {
    /// True once at least one chunk is available.
    fn has_data(&self) -> bool;

    /// True once the source has delivered everything for this region.
    fn is_done(&self) -> bool;

    /// Installs the data-event listener, replacing any previous one.
    fn set_data_listener(&mut self, listener: Box<dyn FnMut() + Send>);

    /// Takes the best chunk at or below `quality` (`None` = best
    /// available), or `None` if nothing new arrived since the last take.
    fn fetched_data(&mut self, quality: Option<u16>) -> Option<FetchedData>;

    /// Releases the context. Data events stop firing.
    fn dispose(&mut self);
}

/// Controls one in-flight transfer.
pub trait FetchHandle: Send {
    /// Pauses the transfer; `on_stopped` fires once the pause took
    /// effect, never re-entrantly from within this call. Data events may
    /// still fire until then.
    fn stop(&mut self, on_stopped: Box<dyn FnOnce() + Send>);

    /// Resumes a previously stopped transfer.
    fn resume(&mut self);
}

/// The network capability the fetch pipeline is built over.
pub trait Fetcher: Send + Sync {
    /// Opens the connection to `url`.
    fn open(&self, url: &str) -> Result<(), FetchError>;

    /// Closes the connection; in-flight transfers are dropped.
    fn close(&self);

    /// Creates a data context for one target region.
    fn create_data_context(
        &self,
        params: &ImagePartParams,
    ) -> Result<Box<dyn DataContext>, FetchError>;

    /// Starts a one-shot fetch into `context`.
    fn fetch(&self, context: &mut dyn DataContext) -> Result<Box<dyn FetchHandle>, FetchError>;

    /// Starts a fetch whose target may later be moved without
    /// renegotiating the connection.
    fn start_movable_fetch(
        &self,
        context: &mut dyn DataContext,
    ) -> Result<Box<dyn FetchHandle>, FetchError>;

    /// Retargets a movable fetch onto a new data context.
    fn move_fetch(
        &self,
        handle: &mut dyn FetchHandle,
        context: &mut dyn DataContext,
    ) -> Result<(), FetchError>;

    /// Pushes viewport data to the server so it can order its replies.
    /// Transports without server-side prioritization ignore it.
    fn set_prioritizer_data(&self, _data: Option<FrustumData>) {}
}

/// Errors raised by the fetch pipeline and its injected capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Operation before [`Fetcher::open`] succeeded.
    #[error("fetch manager is not open")]
    NotOpen,

    /// A second open on an already-open manager.
    #[error("fetch manager is already open")]
    AlreadyOpen,

    /// The underlying transport failed.
    #[error("connection failure: {0}")]
    Connection(String),

    /// An id that names no live request.
    #[error("unknown request id {0}")]
    UnknownRequest(u64),

    /// A request id that is already in use.
    #[error("duplicate request id {0}")]
    DuplicateRequest(u64),

    /// A handle that names no live channel.
    #[error("unknown channel handle {0}")]
    UnknownChannel(u64),

    /// A second fetch call on a non-channel request.
    #[error("request is already fetching")]
    AlreadyFetching,

    /// A fetch call on a terminated request.
    #[error("request has terminated")]
    RequestTerminated,

    /// The requested region is invalid.
    #[error(transparent)]
    Region(#[from] RegionError),
}
