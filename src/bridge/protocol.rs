//! Wire protocol between the controller and its isolated workers.
//!
//! Every message is a serde-serializable envelope: a JSON-shaped body plus
//! zero or more binary payloads carried out of band and addressed into the
//! body by structural path. Keeping pixel buffers and compressed tile data
//! out of the JSON body means they move as [`bytes::Bytes`] handles,
//! never copied through a serializer.
//!
//! Message kinds mirror the call lifecycle:
//!
//! ```text
//! controller ──► worker:  Construct, Call, Post, SubWorkerReply, Close
//! worker ──► controller:  FunctionCalled (ack), PromiseResult/Failure,
//!                         Callback, UserData, SubWorkerSpawn/Post/Terminate,
//!                         Fatal
//! ```
//!
//! `FunctionCalled` acks drive the controller's backpressure window; a
//! `PromiseResult`/`PromiseFailure` correlates to exactly one `Call` by
//! `call_id`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates a call with its single reply; monotone per controller.
pub type CallId = u64;

/// Identifies a controller-registered callback handle.
pub type CallbackId = u64;

/// Identifies a nested worker spawned on behalf of a worker.
pub type SubWorkerId = u64;

/// One step into a JSON body: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// A binary payload travelling alongside a message body, addressed by the
/// structural path of the body node it belongs to.
#[derive(Debug, Clone)]
pub struct Payload {
    pub path: Vec<PathSegment>,
    pub data: Bytes,
}

impl Payload {
    /// Creates a payload addressed by `path` (e.g. `["data", "buffer"]`).
    pub fn new(path: Vec<PathSegment>, data: Bytes) -> Self {
        Self { path, data }
    }

    /// Creates a payload addressed by a single top-level key.
    pub fn at_key(key: &str, data: Bytes) -> Self {
        Self {
            path: vec![PathSegment::from(key)],
            data,
        }
    }
}

/// Resolves a structural path inside a JSON body.
///
/// Returns `None` if any step does not exist or has the wrong shape.
pub fn resolve_path<'a>(body: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut node = body;
    for segment in path {
        node = match segment {
            PathSegment::Key(key) => node.get(key.as_str())?,
            PathSegment::Index(index) => node.get(index)?,
        };
    }
    Some(node)
}

/// A message body plus its out-of-band binary payloads.
#[derive(Debug)]
pub struct Envelope<M> {
    pub message: M,
    pub payloads: Vec<Payload>,
}

impl<M> Envelope<M> {
    /// Wraps a message with no binary payloads.
    pub fn plain(message: M) -> Self {
        Self {
            message,
            payloads: Vec::new(),
        }
    }

    /// Wraps a message with payloads.
    pub fn with_payloads(message: M, payloads: Vec<Payload>) -> Self {
        Self { message, payloads }
    }
}

/// Messages flowing controller → worker.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToWorker {
    /// Instantiate the worker's service. Exactly one per connection.
    Construct { args: Value },

    /// Invoke a member function on the service instance.
    Call {
        call_id: CallId,
        method: String,
        args: Value,
        /// Whether the caller awaits a `PromiseResult`/`PromiseFailure`.
        want_result: bool,
    },

    /// Raw message for sub-workers (the nested-worker `postMessage` path).
    Post { data: Value },

    /// A message from one of this worker's sub-workers, routed through the
    /// controller.
    SubWorkerReply { sub_worker_id: SubWorkerId, data: Value },

    /// Orderly shutdown of the worker loop.
    Close,
}

/// Messages flowing worker → controller.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToController {
    /// Acknowledges that a `Call` was dispatched; releases one slot of the
    /// controller's backpressure window.
    FunctionCalled { call_id: CallId },

    /// Successful async result for a `Call` with `want_result`.
    PromiseResult { call_id: CallId, result: Value },

    /// Failed async result for a `Call` with `want_result`.
    PromiseFailure { call_id: CallId, error: String },

    /// Invocation of a controller-registered callback handle.
    Callback { callback_id: CallbackId, args: Value },

    /// Fire-and-forget sideband data from the worker's service.
    UserData { data: Value },

    /// The worker requests a nested worker.
    SubWorkerSpawn {
        sub_worker_id: SubWorkerId,
        ctor_args: Value,
    },

    /// The worker posts a message to one of its sub-workers.
    SubWorkerPost { sub_worker_id: SubWorkerId, data: Value },

    /// The worker terminates one of its sub-workers.
    SubWorkerTerminate { sub_worker_id: SubWorkerId },

    /// Protocol corruption detected on the worker side; the connection
    /// must be aborted.
    Fatal { reason: String },
}

/// Controller-facing bridge errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// The protocol was violated (unknown call id, missing member
    /// function, double construction, one-shot callback fired twice).
    /// The connection is unusable afterwards.
    #[error("protocol corruption: {0}")]
    ProtocolCorruption(String),

    /// The connection was closed before the reply arrived.
    #[error("bridge connection closed")]
    Closed,

    /// The worker's service reported a failure for an awaited call.
    #[error("worker failure: {0}")]
    WorkerFailure(String),

    /// Argument (de)serialization failed before anything was sent.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
