//! Controller-side handle for a remote worker.
//!
//! [`RemoteWorker::connect`] spawns the worker's runtime task plus a
//! dispatch task that drains the worker's outbound channel. The handle
//! then offers member-function calls (fire-and-forget or awaited), typed
//! callback registration, sideband user-data delivery and a graceful
//! close.
//!
//! Two concerns live entirely on this side:
//!
//! - **Backpressure.** At most `buffer_size` unacknowledged calls are in
//!   flight; further calls queue in FIFO order and are released one per
//!   ack. Construction and explicitly immediate sends bypass the window.
//! - **Protocol health.** An unknown call id, an unknown callback id
//!   (other than a tolerated late delivery) or a worker-declared fatal
//!   condition poisons the handle: every pending and future call fails
//!   with the corruption error.

use super::callback::{CallbackRegistry, OnceCallback, StreamCallback};
use super::protocol::{BridgeError, CallId, Envelope, Payload, SubWorkerId, ToController, ToWorker};
use super::worker::{WorkerFactory, WorkerRuntime};
use super::CallbackRef;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Sideband data handler, invoked for every `UserData` message.
pub type UserDataHandler = Box<dyn FnMut(Value, Vec<Payload>) + Send>;

type PendingReply = oneshot::Sender<Result<(Value, Vec<Payload>), BridgeError>>;

/// Tuning knobs for a bridge connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Maximum unacknowledged calls in flight before queuing locally.
    pub buffer_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { buffer_size: 5 }
    }
}

struct ControllerState {
    next_call_id: CallId,
    pending: HashMap<CallId, PendingReply>,
    callbacks: CallbackRegistry,
    unacked: usize,
    buffer_size: usize,
    queued: VecDeque<Envelope<ToWorker>>,
    failed: Option<BridgeError>,
    closed: bool,
}

struct Shared {
    to_worker: mpsc::UnboundedSender<Envelope<ToWorker>>,
    state: Mutex<ControllerState>,
    user_data_handler: Mutex<Option<UserDataHandler>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Poisons the connection: all pending and future calls fail.
    fn fail(&self, error: BridgeError) {
        let drained = {
            let mut state = self.state();
            if state.failed.is_none() {
                state.failed = Some(error.clone());
            }
            state.queued.clear();
            state.pending.drain().collect::<Vec<_>>()
        };
        if !drained.is_empty() {
            error!(error = %error, pending = drained.len(), "bridge failure, failing pending calls");
        }
        for (_, reply) in drained {
            let _ = reply.send(Err(error.clone()));
        }
        let _ = self.to_worker.send(Envelope::plain(ToWorker::Close));
    }
}

/// Handle to an isolated worker hosting one service instance.
#[derive(Clone)]
pub struct RemoteWorker {
    shared: Arc<Shared>,
}

impl RemoteWorker {
    /// Spawns a worker built by `factory`, constructs its service with
    /// `ctor_args` and returns the controlling handle.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(
        factory: Arc<dyn WorkerFactory>,
        ctor_args: Value,
        options: ConnectOptions,
    ) -> Self {
        let (to_worker, from_controller) = mpsc::unbounded_channel();
        let (to_controller, from_worker) = mpsc::unbounded_channel();

        tokio::spawn(WorkerRuntime::new(Arc::clone(&factory)).run(from_controller, to_controller));

        let shared = Arc::new(Shared {
            to_worker,
            state: Mutex::new(ControllerState {
                next_call_id: 0,
                pending: HashMap::new(),
                callbacks: CallbackRegistry::new(),
                unacked: 0,
                buffer_size: options.buffer_size,
                queued: VecDeque::new(),
                failed: None,
                closed: false,
            }),
            user_data_handler: Mutex::new(None),
        });

        // Construction precedes every call and bypasses the window.
        let _ = shared
            .to_worker
            .send(Envelope::plain(ToWorker::Construct { args: ctor_args }));

        tokio::spawn(dispatch_loop(Arc::clone(&shared), factory, from_worker));

        Self { shared }
    }

    /// Installs the handler for sideband user data from the worker.
    pub fn on_user_data(&self, handler: UserDataHandler) {
        let mut slot = match self.shared.user_data_handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    /// Fire-and-forget member-function call, subject to backpressure.
    pub fn call(&self, method: &str, args: Value) -> Result<(), BridgeError> {
        self.send_call(method, args, Vec::new(), None, false)
    }

    /// Fire-and-forget call carrying binary payloads.
    pub fn call_with_payloads(
        &self,
        method: &str,
        args: Value,
        payloads: Vec<Payload>,
    ) -> Result<(), BridgeError> {
        self.send_call(method, args, payloads, None, false)
    }

    /// Fire-and-forget call that skips the backpressure window. For
    /// control messages that must not sit behind queued work.
    pub fn call_immediately(&self, method: &str, args: Value) -> Result<(), BridgeError> {
        self.send_call(method, args, Vec::new(), None, true)
    }

    /// Awaited member-function call; resolves with the worker's result
    /// and any reply payloads.
    pub async fn call_with_result(
        &self,
        method: &str,
        args: Value,
    ) -> Result<(Value, Vec<Payload>), BridgeError> {
        self.call_with_result_and_payloads(method, args, Vec::new())
            .await
    }

    /// Awaited call carrying binary payloads.
    pub async fn call_with_result_and_payloads(
        &self,
        method: &str,
        args: Value,
        payloads: Vec<Payload>,
    ) -> Result<(Value, Vec<Payload>), BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_call(method, args, payloads, Some(reply_tx), false)?;
        reply_rx.await.map_err(|_| BridgeError::Closed)?
    }

    fn send_call(
        &self,
        method: &str,
        args: Value,
        payloads: Vec<Payload>,
        reply: Option<PendingReply>,
        send_immediately: bool,
    ) -> Result<(), BridgeError> {
        let mut state = self.shared.state();
        if let Some(error) = &state.failed {
            return Err(error.clone());
        }
        if state.closed {
            return Err(BridgeError::Closed);
        }

        let call_id = state.next_call_id;
        state.next_call_id += 1;
        let want_result = reply.is_some();
        if let Some(reply) = reply {
            state.pending.insert(call_id, reply);
        }

        let envelope = Envelope::with_payloads(
            ToWorker::Call {
                call_id,
                method: method.to_owned(),
                args,
                want_result,
            },
            payloads,
        );

        if send_immediately || state.unacked < state.buffer_size {
            state.unacked += 1;
            self.shared
                .to_worker
                .send(envelope)
                .map_err(|_| BridgeError::Closed)?;
        } else {
            state.queued.push_back(envelope);
        }
        Ok(())
    }

    /// Registers a single-shot callback; its reference can be embedded in
    /// call arguments for the worker to invoke.
    pub fn wrap_callback_once(&self, callback: OnceCallback) -> CallbackRef {
        self.shared.state().callbacks.register_once(callback)
    }

    /// Registers a repeatable callback.
    pub fn wrap_callback_stream(&self, callback: StreamCallback) -> CallbackRef {
        self.shared.state().callbacks.register_stream(callback)
    }

    /// Releases a callback registration. Late invocations of a freed
    /// stream callback are tolerated; of a consumed once callback they
    /// are protocol corruption.
    pub fn free_callback(&self, reference: CallbackRef) -> bool {
        self.shared.state().callbacks.free(reference)
    }

    /// Shuts the worker down. Pending calls fail with [`BridgeError::Closed`].
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queued.clear();
            state.pending.drain().collect::<Vec<_>>()
        };
        for (_, reply) in drained {
            let _ = reply.send(Err(BridgeError::Closed));
        }
        let _ = self.shared.to_worker.send(Envelope::plain(ToWorker::Close));
    }

    /// True once the connection is poisoned by a protocol failure.
    pub fn is_failed(&self) -> bool {
        self.shared.state().failed.is_some()
    }

    /// Calls sent but not yet acknowledged by the worker.
    pub fn unacked_calls(&self) -> usize {
        self.shared.state().unacked
    }

    /// Calls held back by the backpressure window.
    pub fn queued_calls(&self) -> usize {
        self.shared.state().queued.len()
    }

    /// Live callback registrations.
    pub fn live_callbacks(&self) -> usize {
        self.shared.state().callbacks.live_count()
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    factory: Arc<dyn WorkerFactory>,
    mut from_worker: mpsc::UnboundedReceiver<Envelope<ToController>>,
) {
    let mut sub_workers: HashMap<SubWorkerId, mpsc::UnboundedSender<Envelope<ToWorker>>> =
        HashMap::new();

    while let Some(Envelope { message, payloads }) = from_worker.recv().await {
        match message {
            ToController::FunctionCalled { .. } => {
                let release = {
                    let mut state = shared.state();
                    state.unacked = state.unacked.saturating_sub(1);
                    match state.queued.pop_front() {
                        Some(envelope) => {
                            state.unacked += 1;
                            Some(envelope)
                        }
                        None => None,
                    }
                };
                if let Some(envelope) = release {
                    if shared.to_worker.send(envelope).is_err() {
                        shared.fail(BridgeError::Closed);
                        break;
                    }
                }
            }

            ToController::PromiseResult { call_id, result } => {
                let reply = shared.state().pending.remove(&call_id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Ok((result, payloads)));
                    }
                    None => {
                        shared.fail(BridgeError::ProtocolCorruption(format!(
                            "result for unknown call {call_id}"
                        )));
                        break;
                    }
                }
            }

            ToController::PromiseFailure { call_id, error } => {
                let reply = shared.state().pending.remove(&call_id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(BridgeError::WorkerFailure(error)));
                    }
                    None => {
                        shared.fail(BridgeError::ProtocolCorruption(format!(
                            "failure for unknown call {call_id}"
                        )));
                        break;
                    }
                }
            }

            ToController::Callback { callback_id, args } => {
                // Look up under the lock, run outside it.
                let invocation = shared.state().callbacks.take_invocation(callback_id);
                match invocation {
                    Ok(Some(invocation)) => invocation.run(args, payloads),
                    Ok(None) => {}
                    Err(error) => {
                        shared.fail(error);
                        break;
                    }
                }
            }

            ToController::UserData { data } => {
                let mut slot = match shared.user_data_handler.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                match slot.as_mut() {
                    Some(handler) => handler(data, payloads),
                    None => debug!("user data with no handler installed, dropping"),
                }
            }

            ToController::SubWorkerSpawn {
                sub_worker_id,
                ctor_args,
            } => {
                let (sub_tx, sub_rx) = mpsc::unbounded_channel();
                let (sub_out_tx, sub_out_rx) = mpsc::unbounded_channel();
                tokio::spawn(WorkerRuntime::new(Arc::clone(&factory)).run(sub_rx, sub_out_tx));
                tokio::spawn(forward_sub_worker(
                    sub_worker_id,
                    Arc::clone(&shared),
                    sub_out_rx,
                ));
                let _ = sub_tx.send(Envelope::plain(ToWorker::Construct { args: ctor_args }));
                sub_workers.insert(sub_worker_id, sub_tx);
            }

            ToController::SubWorkerPost {
                sub_worker_id,
                data,
            } => match sub_workers.get(&sub_worker_id) {
                Some(sub) => {
                    let _ = sub.send(Envelope::with_payloads(ToWorker::Post { data }, payloads));
                }
                None => warn!(sub_worker_id, "post to unknown sub-worker"),
            },

            ToController::SubWorkerTerminate { sub_worker_id } => {
                if let Some(sub) = sub_workers.remove(&sub_worker_id) {
                    let _ = sub.send(Envelope::plain(ToWorker::Close));
                } else {
                    warn!(sub_worker_id, "terminate for unknown sub-worker");
                }
            }

            ToController::Fatal { reason } => {
                shared.fail(BridgeError::WorkerFailure(reason));
                break;
            }
        }
    }

    for (_, sub) in sub_workers {
        let _ = sub.send(Envelope::plain(ToWorker::Close));
    }

    // Worker hung up: anything still pending can never resolve.
    let drained = {
        let mut state = shared.state();
        state.pending.drain().collect::<Vec<_>>()
    };
    for (_, reply) in drained {
        let _ = reply.send(Err(BridgeError::Closed));
    }
    debug!("controller dispatch loop exited");
}

/// Relays a sub-worker's sideband output to its parent worker.
async fn forward_sub_worker(
    sub_worker_id: SubWorkerId,
    shared: Arc<Shared>,
    mut from_sub: mpsc::UnboundedReceiver<Envelope<ToController>>,
) {
    while let Some(Envelope { message, .. }) = from_sub.recv().await {
        match message {
            ToController::UserData { data } => {
                let _ = shared.to_worker.send(Envelope::plain(ToWorker::SubWorkerReply {
                    sub_worker_id,
                    data,
                }));
            }
            ToController::Fatal { reason } => {
                error!(sub_worker_id, reason, "sub-worker fatal");
            }
            other => {
                warn!(sub_worker_id, message = ?other, "unsupported message from sub-worker");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::worker::{ServiceError, ServiceReply, WorkerContext, WorkerService};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Calculator {
        total: i64,
    }

    impl WorkerService for Calculator {
        fn invoke(
            &mut self,
            method: &str,
            args: Value,
            payloads: Vec<Payload>,
            cx: &mut WorkerContext,
        ) -> Result<ServiceReply, ServiceError> {
            match method {
                "add" => {
                    self.total += args["n"].as_i64().unwrap_or(0);
                    Ok(ServiceReply::Ack)
                }
                "total" => Ok(ServiceReply::Value(json!(self.total))),
                "fail" => Err(ServiceError::Failed("deliberate".into())),
                "later" => Ok(ServiceReply::Future(Box::pin(async move {
                    Ok((json!("done"), Vec::new()))
                }))),
                "echo_bytes" => Ok(ServiceReply::ValueWithPayloads(json!(null), payloads)),
                "notify" => {
                    if let Some(callback) = cx.callback_from_value(&args["cb"]) {
                        callback.invoke(json!({"tick": 1}), Vec::new());
                        callback.invoke(json!({"tick": 2}), Vec::new());
                    }
                    Ok(ServiceReply::Ack)
                }
                "announce" => {
                    cx.send_user_data(json!({"event": "announced"}));
                    Ok(ServiceReply::Ack)
                }
                other => Err(ServiceError::NoSuchMethod(other.to_owned())),
            }
        }
    }

    fn calculator_factory() -> Arc<dyn WorkerFactory> {
        Arc::new(|args: &Value, _cx: &mut WorkerContext| {
            let total = args["start"].as_i64().unwrap_or(0);
            Ok(Box::new(Calculator { total }) as Box<dyn WorkerService>)
        })
    }

    #[tokio::test]
    async fn test_call_with_result_round_trip() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!({"start": 10}),
            ConnectOptions::default(),
        );
        worker.call("add", json!({"n": 5})).unwrap();
        let (result, _) = worker.call_with_result("total", json!(null)).await.unwrap();
        assert_eq!(result, json!(15));
    }

    #[tokio::test]
    async fn test_deferred_result_resolves() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let (result, _) = worker.call_with_result("later", json!(null)).await.unwrap();
        assert_eq!(result, json!("done"));
    }

    #[tokio::test]
    async fn test_service_failure_surfaces_as_worker_failure() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let err = worker
            .call_with_result("fail", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::WorkerFailure(reason) if reason.contains("deliberate")));
        // A single failed call does not poison the connection.
        let (result, _) = worker.call_with_result("total", json!(null)).await.unwrap();
        assert_eq!(result, json!(0));
    }

    #[tokio::test]
    async fn test_payloads_round_trip() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let sent = Payload::at_key("pixels", Bytes::from_static(b"\x01\x02\x03"));
        let (_, payloads) = worker
            .call_with_result_and_payloads("echo_bytes", json!(null), vec![sent])
            .await
            .unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].data, Bytes::from_static(b"\x01\x02\x03"));
    }

    #[tokio::test]
    async fn test_stream_callback_fires_repeatedly() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let reference = worker.wrap_callback_stream(Box::new(move |args, _payloads| {
            let _ = tick_tx.send(args["tick"].as_i64().unwrap_or(-1));
        }));
        worker
            .call("notify", json!({"cb": reference.to_value()}))
            .unwrap();

        assert_eq!(tick_rx.recv().await, Some(1));
        assert_eq!(tick_rx.recv().await, Some(2));
        assert!(worker.free_callback(reference));
    }

    #[tokio::test]
    async fn test_once_callback_consumed_then_second_invocation_is_fatal() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let reference = worker.wrap_callback_once(Box::new(move |args, _payloads| {
            let _ = tick_tx.send(args["tick"].as_i64().unwrap_or(-1));
        }));
        worker
            .call("notify", json!({"cb": reference.to_value()}))
            .unwrap();

        // First invocation lands, the second poisons the connection.
        assert_eq!(tick_rx.recv().await, Some(1));
        let err = loop {
            match worker.call_with_result("total", json!(null)).await {
                Err(err) => break err,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };
        assert!(matches!(err, BridgeError::ProtocolCorruption(_)));
        assert!(worker.is_failed());
    }

    #[tokio::test]
    async fn test_user_data_reaches_handler() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        worker.on_user_data(Box::new(move |data, _payloads| {
            let _ = event_tx.send(data);
        }));
        worker.call("announce", json!(null)).unwrap();
        assert_eq!(
            event_rx.recv().await,
            Some(json!({"event": "announced"}))
        );
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let worker = RemoteWorker::connect(
            calculator_factory(),
            json!(null),
            ConnectOptions::default(),
        );
        worker.close();
        let err = worker
            .call_with_result("total", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }

    // Gated worker: the first call parks until the test releases it, so
    // the backpressure window can be observed deterministically.
    struct Gated {
        gate: std_mpsc::Receiver<()>,
        parked_once: bool,
    }

    impl WorkerService for Gated {
        fn invoke(
            &mut self,
            _method: &str,
            _args: Value,
            _payloads: Vec<Payload>,
            _cx: &mut WorkerContext,
        ) -> Result<ServiceReply, ServiceError> {
            if !self.parked_once {
                self.parked_once = true;
                let _ = self.gate.recv();
            }
            Ok(ServiceReply::Ack)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backpressure_window_queues_excess_calls() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let gate = Mutex::new(Some(gate_rx));
        let factory: Arc<dyn WorkerFactory> =
            Arc::new(move |_args: &Value, _cx: &mut WorkerContext| {
                let gate = gate
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| ServiceError::Failed("single use".into()))?;
                Ok(Box::new(Gated {
                    gate,
                    parked_once: false,
                }) as Box<dyn WorkerService>)
            });
        let worker =
            RemoteWorker::connect(factory, json!(null), ConnectOptions { buffer_size: 5 });

        for i in 0..10 {
            worker.call("work", json!({"i": i})).unwrap();
        }
        // Window full at 5 in flight, the rest held back.
        assert_eq!(worker.unacked_calls(), 5);
        assert_eq!(worker.queued_calls(), 5);

        gate_tx.send(()).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while worker.unacked_calls() + worker.queued_calls() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "window never drained");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct Parent {
        sub: Option<SubWorkerId>,
    }

    impl WorkerService for Parent {
        fn invoke(
            &mut self,
            method: &str,
            args: Value,
            _payloads: Vec<Payload>,
            cx: &mut WorkerContext,
        ) -> Result<ServiceReply, ServiceError> {
            match method {
                "spawn" => {
                    self.sub = Some(cx.spawn_sub_worker(json!({"role": "child"})));
                    Ok(ServiceReply::Ack)
                }
                "relay" => {
                    if let Some(sub) = self.sub {
                        cx.post_to_sub_worker(sub, args);
                    }
                    Ok(ServiceReply::Ack)
                }
                other => Err(ServiceError::NoSuchMethod(other.to_owned())),
            }
        }

        fn on_sub_worker_message(&mut self, _sub: SubWorkerId, data: Value, cx: &mut WorkerContext) {
            cx.send_user_data(json!({"from_child": data}));
        }
    }

    struct Child;

    impl WorkerService for Child {
        fn invoke(
            &mut self,
            method: &str,
            _args: Value,
            _payloads: Vec<Payload>,
            _cx: &mut WorkerContext,
        ) -> Result<ServiceReply, ServiceError> {
            Err(ServiceError::NoSuchMethod(method.to_owned()))
        }

        fn on_post(&mut self, data: Value, cx: &mut WorkerContext) {
            cx.send_user_data(json!({"echoed": data}));
        }
    }

    #[tokio::test]
    async fn test_sub_worker_round_trip() {
        let factory: Arc<dyn WorkerFactory> =
            Arc::new(|args: &Value, _cx: &mut WorkerContext| {
                if args["role"] == json!("child") {
                    Ok(Box::new(Child) as Box<dyn WorkerService>)
                } else {
                    Ok(Box::new(Parent { sub: None }) as Box<dyn WorkerService>)
                }
            });
        let worker = RemoteWorker::connect(factory, json!(null), ConnectOptions::default());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        worker.on_user_data(Box::new(move |data, _payloads| {
            let _ = event_tx.send(data);
        }));

        worker.call("spawn", json!(null)).unwrap();
        worker.call("relay", json!({"msg": "hi"})).unwrap();

        // Parent -> sub-worker -> parent -> controller.
        assert_eq!(
            event_rx.recv().await,
            Some(json!({"from_child": {"echoed": {"msg": "hi"}}}))
        );
    }
}
