//! Typed remote-callback handles.
//!
//! A worker can be handed a callback that lives on the controller side;
//! invoking it on the worker relays a `Callback` message back across the
//! boundary. Handles come in two kinds instead of a runtime "repeatable"
//! flag:
//!
//! - [`CallbackKind::Once`]: fires exactly once. A second delivery is
//!   protocol corruption, never a tolerated race.
//! - [`CallbackKind::Stream`]: fires zero or more times. A delivery racing
//!   with [`CallbackRegistry::free`] is an expected no-op.
//!
//! Freed handles leave tombstones behind so a late message can be told
//! apart from a message for an id that never existed (which is fatal).

use super::protocol::{BridgeError, CallbackId, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// How many times a callback handle may fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Exactly once; re-delivery is fatal.
    Once,
    /// Zero or more times; delivery after free is a no-op.
    Stream,
}

/// A sendable reference to a controller-side callback.
///
/// Serialized into call arguments as `{"__callback": id, "callbackKind": kind}`
/// so the worker's service can recognize and invoke it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRef {
    pub id: CallbackId,
    pub kind: CallbackKind,
}

impl CallbackRef {
    /// Encodes this reference into a JSON argument node.
    pub fn to_value(self) -> Value {
        serde_json::json!({
            "__callback": self.id,
            "callbackKind": match self.kind {
                CallbackKind::Once => "once",
                CallbackKind::Stream => "stream",
            },
        })
    }

    /// Decodes a reference from a JSON argument node, if it is one.
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("__callback")?.as_u64()?;
        let kind = match value.get("callbackKind")?.as_str()? {
            "once" => CallbackKind::Once,
            "stream" => CallbackKind::Stream,
            _ => return None,
        };
        Some(Self { id, kind })
    }
}

/// A one-shot callback closure.
pub type OnceCallback = Box<dyn FnOnce(Value, Vec<Payload>) + Send>;

/// A repeatable callback closure.
pub type StreamCallback = Box<dyn FnMut(Value, Vec<Payload>) + Send>;

enum Entry {
    Once(OnceCallback),
    /// Shared so a delivery can run after the registry lock is released;
    /// the per-callback mutex only serializes concurrent deliveries.
    Stream(Arc<Mutex<StreamCallback>>),
}

/// What happened to a freed or consumed handle; kept as a tombstone so
/// late deliveries can be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tombstone {
    ConsumedOnce,
    FreedStream,
}

/// Controller-side registry mapping callback ids to closures.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: CallbackId,
    live: HashMap<CallbackId, Entry>,
    tombstones: HashMap<CallbackId, Tombstone>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a one-shot callback and returns its sendable reference.
    pub fn register_once(&mut self, callback: OnceCallback) -> CallbackRef {
        let id = self.allocate();
        self.live.insert(id, Entry::Once(callback));
        CallbackRef {
            id,
            kind: CallbackKind::Once,
        }
    }

    /// Registers a repeatable callback and returns its sendable reference.
    pub fn register_stream(&mut self, callback: StreamCallback) -> CallbackRef {
        let id = self.allocate();
        self.live
            .insert(id, Entry::Stream(Arc::new(Mutex::new(callback))));
        CallbackRef {
            id,
            kind: CallbackKind::Stream,
        }
    }

    /// Releases a handle. Returns true if it was still live.
    ///
    /// Freeing a handle twice is tolerated; a message already in flight
    /// for a freed Stream handle will be dropped silently.
    pub fn free(&mut self, reference: CallbackRef) -> bool {
        if self.live.remove(&reference.id).is_some() {
            let tombstone = match reference.kind {
                CallbackKind::Once => Tombstone::ConsumedOnce,
                CallbackKind::Stream => Tombstone::FreedStream,
            };
            self.tombstones.insert(reference.id, tombstone);
            true
        } else {
            false
        }
    }

    /// Number of live handles.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Takes the closure work for a delivery, classifying late messages.
    ///
    /// Returns an owned invocation to run after the registry is unlocked,
    /// `Ok(None)` for a tolerated late delivery, or protocol corruption
    /// for a consumed one-shot or an id that never existed.
    pub fn take_invocation(&mut self, id: CallbackId) -> Result<Option<Invocation>, BridgeError> {
        if matches!(self.live.get(&id), Some(Entry::Once(_))) {
            // A one-shot is consumed by its single delivery.
            let Some(Entry::Once(callback)) = self.live.remove(&id) else {
                unreachable!("entry checked above");
            };
            self.tombstones.insert(id, Tombstone::ConsumedOnce);
            return Ok(Some(Invocation::Once(callback)));
        }
        match self.live.get(&id) {
            Some(Entry::Stream(callback)) => Ok(Some(Invocation::Stream(Arc::clone(callback)))),
            Some(Entry::Once(_)) => unreachable!("handled above"),
            None => match self.tombstones.get(&id) {
                Some(Tombstone::FreedStream) => {
                    trace!(callback_id = id, "late delivery for freed stream callback");
                    Ok(None)
                }
                Some(Tombstone::ConsumedOnce) => Err(BridgeError::ProtocolCorruption(format!(
                    "one-shot callback {id} delivered twice"
                ))),
                None => Err(BridgeError::ProtocolCorruption(format!(
                    "unknown callback id {id}"
                ))),
            },
        }
    }

    fn allocate(&mut self) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// A callback delivery ready to run outside the registry lock.
pub enum Invocation {
    Once(OnceCallback),
    Stream(Arc<Mutex<StreamCallback>>),
}

impl Invocation {
    /// Runs the callback with the delivered arguments.
    pub fn run(self, args: Value, payloads: Vec<Payload>) {
        match self {
            Invocation::Once(callback) => callback(args, payloads),
            Invocation::Stream(callback) => {
                let mut callback = callback.lock().unwrap_or_else(|e| e.into_inner());
                (*callback)(args, payloads)
            }
        }
    }
}
