//! Progressive tile fetch pipeline.
//!
//! One [`FetchManager`] per connection owns every request and channel;
//! each request is a [`FetchJob`] state machine that cooperates with a
//! scheduler over a bounded pool of fetch slots and drives the injected
//! [`Fetcher`] capability. The [`FrustumRequestsPrioritizer`] scores
//! pending work against the viewport the renderer pushes.

mod fetcher;
mod frustum;
mod job;
mod manager;

pub use fetcher::{DataContext, FetchError, FetchHandle, FetchedData, Fetcher};
pub use frustum::{
    FrustumData, FrustumPrioritizerOptions, FrustumRequestsPrioritizer, PRIORITY_ABORT,
    PRIORITY_NO_FRUSTUM_DATA, PRIORITY_OUTSIDE_FRUSTUM, PRIORITY_OVERRIDE_HIGHEST,
    PRIORITY_RESOLUTION_TOO_COARSE, PRIORITY_RESOLUTION_TOO_FINE,
};
pub use job::{DataListener, FetchJob, FetchJobOptions, FetchJobState, TerminatedListener};
pub use manager::{ChannelHandle, FetchManager, FetchManagerOptions, RequestId};
