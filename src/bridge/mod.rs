//! Remote execution bridge.
//!
//! Long-running or CPU-heavy work (network fetches, pixel decoding) runs
//! in isolated workers so it never stalls the caller. The bridge gives
//! the controller an object-like handle onto a service living in such a
//! worker:
//!
//! ```text
//!    controller                          worker task
//!   ┌────────────────┐   ToWorker      ┌──────────────────┐
//!   │ RemoteWorker   │ ──────────────▶ │ WorkerRuntime    │
//!   │  calls/promises│                 │  └ WorkerService │
//!   │  callbacks     │ ◀────────────── │     (factory)    │
//!   └────────────────┘   ToController  └──────────────────┘
//! ```
//!
//! Messages are serde envelopes; bulk binary data rides out of band as
//! [`Payload`]s addressed by structural path, never inside the JSON
//! body. Calls are flow-controlled by a fixed window of unacknowledged
//! sends. See the submodules for the two halves and the shared protocol.

mod callback;
mod controller;
mod protocol;
mod worker;

pub use callback::{CallbackKind, CallbackRef, OnceCallback, StreamCallback};
pub use controller::{ConnectOptions, RemoteWorker, UserDataHandler};
pub use protocol::{
    resolve_path, BridgeError, CallId, CallbackId, Envelope, PathSegment, Payload, SubWorkerId,
    ToController, ToWorker,
};
pub use worker::{
    CallKind, PreCallHook, RemoteCallback, ServiceError, ServiceReply, WorkerContext,
    WorkerFactory, WorkerRuntime, WorkerService,
};
