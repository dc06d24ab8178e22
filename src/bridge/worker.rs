//! Worker-side runtime of the remote execution bridge.
//!
//! A worker is an isolated task that owns exactly one service instance,
//! created by a [`WorkerFactory`] when the controller's construction
//! message arrives. The runtime loop dispatches member-function calls to
//! the service, acks each call for the controller's backpressure window,
//! and relays promise results, callback invocations, sideband user data
//! and nested sub-worker traffic back across the boundary.
//!
//! Nothing in the worker blocks: immediate replies are returned from
//! [`WorkerService::invoke`], asynchronous ones as a boxed future the
//! runtime drives on its own task.

use super::callback::CallbackRef;
use super::protocol::{Envelope, Payload, SubWorkerId, ToController, ToWorker};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// What kind of dispatch a pre-call hook is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A member-function call from the controller.
    Method,
    /// A raw posted message (sub-worker path).
    Post,
    /// A message from one of this worker's sub-workers.
    SubWorkerMessage,
}

/// Hook observing every dispatch before the service sees it.
///
/// Lets the instantiated object inspect or intercept incoming calls and
/// user data without wrapping the whole service.
pub type PreCallHook = Box<dyn FnMut(CallKind, &str, &Value) + Send>;

/// A service's reply to one member-function call.
pub enum ServiceReply {
    /// No result value; the call is fire-and-forget.
    Ack,
    /// Immediate result.
    Value(Value),
    /// Immediate result with binary payloads.
    ValueWithPayloads(Value, Vec<Payload>),
    /// Asynchronous result, resolved or rejected exactly once.
    Future(BoxFuture<'static, Result<(Value, Vec<Payload>), String>>),
}

/// Worker-side dispatch failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The method does not exist on the service. Fatal: the controller
    /// and worker disagree about the service's surface.
    #[error("no such member function: {0}")]
    NoSuchMethod(String),

    /// The arguments did not decode.
    #[error("bad arguments for {method}: {reason}")]
    BadArguments { method: String, reason: String },

    /// The operation itself failed; delivered as a promise failure.
    #[error("{0}")]
    Failed(String),
}

/// The object instantiated inside a worker.
pub trait WorkerService: Send + 'static {
    /// Dispatches a member-function call by name.
    fn invoke(
        &mut self,
        method: &str,
        args: Value,
        payloads: Vec<Payload>,
        cx: &mut WorkerContext,
    ) -> Result<ServiceReply, ServiceError>;

    /// Receives a raw posted message (this worker is itself a sub-worker).
    fn on_post(&mut self, _data: Value, _cx: &mut WorkerContext) {}

    /// Receives a message from one of this worker's sub-workers.
    fn on_sub_worker_message(&mut self, _sub: SubWorkerId, _data: Value, _cx: &mut WorkerContext) {}
}

/// Creates service instances; also reused for nested sub-worker spawns.
pub trait WorkerFactory: Send + Sync + 'static {
    fn create(
        &self,
        ctor_args: &Value,
        cx: &mut WorkerContext,
    ) -> Result<Box<dyn WorkerService>, ServiceError>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&Value, &mut WorkerContext) -> Result<Box<dyn WorkerService>, ServiceError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        ctor_args: &Value,
        cx: &mut WorkerContext,
    ) -> Result<Box<dyn WorkerService>, ServiceError> {
        self(ctor_args, cx)
    }
}

/// A controller-side callback usable from the worker.
///
/// Cloneable; each invocation relays a `Callback` message tagged with the
/// handle's id.
#[derive(Clone)]
pub struct RemoteCallback {
    reference: CallbackRef,
    to_controller: mpsc::UnboundedSender<Envelope<ToController>>,
}

impl RemoteCallback {
    /// Fires the callback on the controller side.
    pub fn invoke(&self, args: Value, payloads: Vec<Payload>) {
        let _ = self.to_controller.send(Envelope::with_payloads(
            ToController::Callback {
                callback_id: self.reference.id,
                args,
            },
            payloads,
        ));
    }

    /// The underlying handle reference.
    pub fn reference(&self) -> CallbackRef {
        self.reference
    }
}

/// Worker-side capabilities handed to the service on every dispatch.
pub struct WorkerContext {
    to_controller: mpsc::UnboundedSender<Envelope<ToController>>,
    next_sub_worker_id: SubWorkerId,
}

impl WorkerContext {
    fn new(to_controller: mpsc::UnboundedSender<Envelope<ToController>>) -> Self {
        Self {
            to_controller,
            next_sub_worker_id: 0,
        }
    }

    /// Sends fire-and-forget sideband data to the controller.
    pub fn send_user_data(&self, data: Value) {
        self.send_user_data_with_payloads(data, Vec::new());
    }

    /// Sends sideband data carrying binary payloads.
    pub fn send_user_data_with_payloads(&self, data: Value, payloads: Vec<Payload>) {
        let _ = self
            .to_controller
            .send(Envelope::with_payloads(ToController::UserData { data }, payloads));
    }

    /// Recognizes a callback reference inside call arguments and binds it
    /// to this worker's outbound channel.
    pub fn callback_from_value(&self, value: &Value) -> Option<RemoteCallback> {
        CallbackRef::from_value(value).map(|reference| RemoteCallback {
            reference,
            to_controller: self.to_controller.clone(),
        })
    }

    /// Binds an already-decoded callback reference.
    pub fn remote_callback(&self, reference: CallbackRef) -> RemoteCallback {
        RemoteCallback {
            reference,
            to_controller: self.to_controller.clone(),
        }
    }

    /// Requests a nested worker; its lifecycle is proxied through the
    /// controller. Returns the id used to address it.
    pub fn spawn_sub_worker(&mut self, ctor_args: Value) -> SubWorkerId {
        let sub_worker_id = self.next_sub_worker_id;
        self.next_sub_worker_id += 1;
        let _ = self.to_controller.send(Envelope::plain(ToController::SubWorkerSpawn {
            sub_worker_id,
            ctor_args,
        }));
        sub_worker_id
    }

    /// Posts a message to a previously spawned sub-worker.
    pub fn post_to_sub_worker(&self, sub_worker_id: SubWorkerId, data: Value) {
        let _ = self
            .to_controller
            .send(Envelope::plain(ToController::SubWorkerPost { sub_worker_id, data }));
    }

    /// Terminates a previously spawned sub-worker.
    pub fn terminate_sub_worker(&self, sub_worker_id: SubWorkerId) {
        let _ = self
            .to_controller
            .send(Envelope::plain(ToController::SubWorkerTerminate { sub_worker_id }));
    }

    fn fatal(&self, reason: String) {
        error!(reason, "worker-side protocol corruption");
        let _ = self
            .to_controller
            .send(Envelope::plain(ToController::Fatal { reason }));
    }
}

/// The message loop hosting one service instance.
pub struct WorkerRuntime {
    factory: Arc<dyn WorkerFactory>,
    pre_call_hook: Option<PreCallHook>,
}

impl WorkerRuntime {
    /// Creates a runtime that will build its service from `factory`.
    pub fn new(factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            factory,
            pre_call_hook: None,
        }
    }

    /// Installs a hook observing every dispatch before the service.
    pub fn set_pre_call_hook(&mut self, hook: PreCallHook) {
        self.pre_call_hook = Some(hook);
    }

    /// Runs the worker loop until `Close` or a fatal protocol violation.
    pub async fn run(
        mut self,
        mut from_controller: mpsc::UnboundedReceiver<Envelope<ToWorker>>,
        to_controller: mpsc::UnboundedSender<Envelope<ToController>>,
    ) {
        let mut cx = WorkerContext::new(to_controller.clone());
        let mut service: Option<Box<dyn WorkerService>> = None;

        while let Some(Envelope { message, payloads }) = from_controller.recv().await {
            match message {
                ToWorker::Construct { args } => {
                    if service.is_some() {
                        cx.fatal("duplicate construction".into());
                        break;
                    }
                    match self.factory.create(&args, &mut cx) {
                        Ok(instance) => service = Some(instance),
                        Err(err) => {
                            cx.fatal(format!("construction failed: {err}"));
                            break;
                        }
                    }
                }

                ToWorker::Call {
                    call_id,
                    method,
                    args,
                    want_result,
                } => {
                    let Some(service) = service.as_mut() else {
                        cx.fatal(format!("call to {method} before construction"));
                        break;
                    };
                    if let Some(hook) = self.pre_call_hook.as_mut() {
                        hook(CallKind::Method, &method, &args);
                    }
                    let reply = service.invoke(&method, args, payloads, &mut cx);

                    // The ack releases one backpressure slot: the call's
                    // synchronous part has run, regardless of outcome.
                    let _ = to_controller
                        .send(Envelope::plain(ToController::FunctionCalled { call_id }));

                    match reply {
                        Ok(ServiceReply::Ack) => {
                            if want_result {
                                let _ = to_controller.send(Envelope::plain(
                                    ToController::PromiseFailure {
                                        call_id,
                                        error: format!("{method} returns no result"),
                                    },
                                ));
                            }
                        }
                        Ok(ServiceReply::Value(result)) => {
                            if want_result {
                                let _ = to_controller.send(Envelope::plain(
                                    ToController::PromiseResult { call_id, result },
                                ));
                            }
                        }
                        Ok(ServiceReply::ValueWithPayloads(result, reply_payloads)) => {
                            if want_result {
                                let _ = to_controller.send(Envelope::with_payloads(
                                    ToController::PromiseResult { call_id, result },
                                    reply_payloads,
                                ));
                            }
                        }
                        Ok(ServiceReply::Future(future)) => {
                            let to_controller = to_controller.clone();
                            tokio::spawn(async move {
                                let message = match future.await {
                                    Ok((result, reply_payloads)) => Envelope::with_payloads(
                                        ToController::PromiseResult { call_id, result },
                                        reply_payloads,
                                    ),
                                    Err(error) => Envelope::plain(ToController::PromiseFailure {
                                        call_id,
                                        error,
                                    }),
                                };
                                if want_result {
                                    let _ = to_controller.send(message);
                                }
                            });
                        }
                        Err(err @ ServiceError::NoSuchMethod(_)) => {
                            cx.fatal(err.to_string());
                            break;
                        }
                        Err(err) => {
                            if want_result {
                                let _ = to_controller.send(Envelope::plain(
                                    ToController::PromiseFailure {
                                        call_id,
                                        error: err.to_string(),
                                    },
                                ));
                            } else {
                                warn!(method = %method_name_of(&err), error = %err, "call failed without awaiter");
                            }
                        }
                    }
                }

                ToWorker::Post { data } => {
                    let Some(service) = service.as_mut() else {
                        cx.fatal("post before construction".into());
                        break;
                    };
                    if let Some(hook) = self.pre_call_hook.as_mut() {
                        hook(CallKind::Post, "", &data);
                    }
                    service.on_post(data, &mut cx);
                }

                ToWorker::SubWorkerReply {
                    sub_worker_id,
                    data,
                } => {
                    let Some(service) = service.as_mut() else {
                        // The sub-worker raced construction teardown.
                        continue;
                    };
                    if let Some(hook) = self.pre_call_hook.as_mut() {
                        hook(CallKind::SubWorkerMessage, "", &data);
                    }
                    service.on_sub_worker_message(sub_worker_id, data, &mut cx);
                }

                ToWorker::Close => break,
            }
        }
        debug!("worker loop exited");
    }
}

fn method_name_of(err: &ServiceError) -> &str {
    match err {
        ServiceError::BadArguments { method, .. } => method,
        _ => "",
    }
}
