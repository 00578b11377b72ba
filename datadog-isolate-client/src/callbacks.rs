// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Callback registry: host functions the daemon invokes by id.
//!
//! Ids are registered at runtime-creation time (console, fetch, fs, module
//! loader, custom functions, hooks) or dynamically by the marshalling
//! bridge when a result carries a live reference. Results travel back as a
//! `callback-response` frame, except for streaming fetch responses, which
//! complete through `callback-stream-*` frames alone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use datadog_isolate_ipc::msg::{
    CallbackInvoke, CallbackResponse, CallbackStreamChunk, CallbackStreamEnd, CallbackStreamStart,
    Message, StreamError,
};
use futures::StreamExt;
use rmpv::Value as Wire;
use serde_bytes::ByteBuf;
use tracing::{debug, warn};

use crate::config::{FetchHandler, IteratorFactory};
use crate::connection::ConnectionCore;
use crate::error::CallbackError;
use crate::http::{Body, HttpResponse};
use crate::marshal::{self, HostFunction, HostStream, Value};
use crate::streams::{BODY_STREAM_THRESHOLD, MAX_CHUNK_SIZE};

/// What a callback id stands for. The daemon only knows ids; the kind
/// decides how an invocation is executed and answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallbackKind {
    /// Fire-and-marshal host hook (console, test events).
    SyncEffect,
    /// Async host function; the awaited result is marshalled back.
    Async,
    /// Host fetch implementation; may answer with a body stream instead of
    /// a `callback-response`. Receives the invocation's request id.
    Fetch,
    IteratorStart,
    IteratorNext,
    IteratorReturn,
    IteratorThrow,
    /// Resolver for a promise reference returned from a callback.
    PromiseResolve,
    ReturnedIteratorNext,
    ReturnedIteratorReturn,
    /// Invoker for a function reference returned from a callback.
    ReturnedFunction,
}

#[derive(Clone)]
pub(crate) enum CallbackTarget {
    Hook(HostFunction),
    Fetch(FetchHandler),
    IteratorFactory(IteratorFactory),
    /// Iterator step callbacks take the iterator id from the arguments.
    IteratorStep,
    Promise {
        promise_id: u64,
    },
    ReturnedIterator {
        iterator_id: u64,
        next_callback_id: u64,
        return_callback_id: u64,
    },
}

#[derive(Clone)]
pub(crate) struct CallbackDescriptor {
    pub(crate) kind: CallbackKind,
    pub(crate) target: CallbackTarget,
}

/// Callback descriptors plus the registries backing live references:
/// iterator sessions and pending returned promises.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    callbacks: Mutex<HashMap<u64, CallbackDescriptor>>,
    iterators: Mutex<HashMap<u64, HostStream>>,
    promises: Mutex<HashMap<u64, marshal::HostPromise>>,
}

impl CallbackRegistry {
    pub(crate) fn register(&self, callback_id: u64, descriptor: CallbackDescriptor) {
        self.callbacks
            .lock()
            .unwrap()
            .insert(callback_id, descriptor);
    }

    pub(crate) fn remove(&self, callback_id: u64) {
        self.callbacks.lock().unwrap().remove(&callback_id);
    }

    fn lookup(&self, callback_id: u64) -> Option<CallbackDescriptor> {
        self.callbacks.lock().unwrap().get(&callback_id).cloned()
    }

    pub(crate) fn store_iterator(&self, iterator_id: u64, iterator: HostStream) {
        self.iterators.lock().unwrap().insert(iterator_id, iterator);
    }

    fn take_iterator(&self, iterator_id: u64) -> Option<HostStream> {
        self.iterators.lock().unwrap().remove(&iterator_id)
    }

    pub(crate) fn store_promise(&self, promise_id: u64, promise: marshal::HostPromise) {
        self.promises.lock().unwrap().insert(promise_id, promise);
    }

    fn take_promise(&self, promise_id: u64) -> Option<marshal::HostPromise> {
        self.promises.lock().unwrap().remove(&promise_id)
    }

    pub(crate) fn clear(&self) {
        self.callbacks.lock().unwrap().clear();
        self.iterators.lock().unwrap().clear();
        self.promises.lock().unwrap().clear();
    }
}

enum InvokeOutcome {
    Respond(Wire),
    /// A body stream is already flowing; no `callback-response` follows.
    Streaming,
}

fn done_object(done: bool, value: Option<Wire>) -> Wire {
    let mut entries = vec![(Wire::from("done"), Wire::Boolean(done))];
    if let Some(value) = value {
        entries.push((Wire::from("value"), value));
    }
    Wire::Map(entries)
}

/// Entry point for an inbound `callback-invoke` frame. Runs on its own
/// task so host code cannot stall frame dispatch.
pub(crate) async fn dispatch_invoke(core: Arc<ConnectionCore>, invoke: CallbackInvoke) {
    let request_id = invoke.request_id;
    let response = match run_callback(&core, invoke).await {
        Ok(InvokeOutcome::Streaming) => return,
        Ok(InvokeOutcome::Respond(value)) => CallbackResponse {
            request_id,
            value: Some(value),
            error: None,
        },
        Err(error) => CallbackResponse {
            request_id,
            value: None,
            error: Some(error.into_wire()),
        },
    };
    core.outbound
        .send_or_warn(Message::CallbackResponse(response));
}

async fn run_callback(
    core: &Arc<ConnectionCore>,
    invoke: CallbackInvoke,
) -> Result<InvokeOutcome, CallbackError> {
    let CallbackInvoke {
        request_id,
        callback_id,
        args,
    } = invoke;
    let Some(descriptor) = core.callbacks.lookup(callback_id) else {
        warn!(callback_id, "invocation of unknown callback");
        return Err(CallbackError::new(
            "Error",
            format!("unknown callback {callback_id}"),
        ));
    };
    let args = marshal::unmarshal_args(args);

    match (descriptor.kind, descriptor.target) {
        (CallbackKind::Fetch, CallbackTarget::Fetch(handler)) => {
            run_fetch(core, request_id, handler, args).await
        }
        (CallbackKind::IteratorStart, CallbackTarget::IteratorFactory(factory)) => {
            let iterator = factory(args);
            let iterator_id = core.ids.next_iterator();
            core.callbacks.store_iterator(iterator_id, iterator);
            Ok(InvokeOutcome::Respond(Wire::from(iterator_id)))
        }
        (CallbackKind::IteratorNext, CallbackTarget::IteratorStep) => {
            let iterator_id = arg_iterator_id(&args)?;
            advance_iterator(core, iterator_id, None).await
        }
        (CallbackKind::IteratorReturn | CallbackKind::IteratorThrow, CallbackTarget::IteratorStep) => {
            let iterator_id = arg_iterator_id(&args)?;
            core.callbacks.take_iterator(iterator_id);
            Ok(InvokeOutcome::Respond(done_object(true, None)))
        }
        (CallbackKind::PromiseResolve, CallbackTarget::Promise { promise_id }) => {
            let Some(promise) = core.callbacks.take_promise(promise_id) else {
                return Err(CallbackError::new(
                    "Error",
                    format!("unknown promise {promise_id}"),
                ));
            };
            // the resolver is one-shot; evict it with the promise
            core.callbacks.remove(callback_id);
            let value = promise.await?;
            let wire = marshal::marshal(value, core.as_scope())?;
            Ok(InvokeOutcome::Respond(wire))
        }
        (
            CallbackKind::ReturnedIteratorNext,
            CallbackTarget::ReturnedIterator {
                iterator_id,
                next_callback_id,
                return_callback_id,
            },
        ) => {
            advance_iterator(core, iterator_id, Some((next_callback_id, return_callback_id))).await
        }
        (
            CallbackKind::ReturnedIteratorReturn,
            CallbackTarget::ReturnedIterator {
                iterator_id,
                next_callback_id,
                return_callback_id,
            },
        ) => {
            core.callbacks.take_iterator(iterator_id);
            core.callbacks.remove(next_callback_id);
            core.callbacks.remove(return_callback_id);
            Ok(InvokeOutcome::Respond(done_object(true, None)))
        }
        (
            CallbackKind::SyncEffect | CallbackKind::Async | CallbackKind::ReturnedFunction,
            CallbackTarget::Hook(function),
        ) => {
            let value = function(args).await?;
            let wire = marshal::marshal(value, core.as_scope())?;
            Ok(InvokeOutcome::Respond(wire))
        }
        (kind, _) => {
            warn!(callback_id, ?kind, "callback descriptor is inconsistent");
            Err(CallbackError::new("Error", "inconsistent callback"))
        }
    }
}

fn arg_iterator_id(args: &[Value]) -> Result<u64, CallbackError> {
    match args.first() {
        Some(Value::Int(id)) if *id >= 0 => Ok(*id as u64),
        _ => Err(CallbackError::new("TypeError", "expected an iterator id")),
    }
}

/// Advances an iterator session and marshals the step result. On a
/// terminal step the session (and, for returned references, its callback
/// ids) is evicted.
async fn advance_iterator(
    core: &Arc<ConnectionCore>,
    iterator_id: u64,
    evict_callbacks: Option<(u64, u64)>,
) -> Result<InvokeOutcome, CallbackError> {
    let Some(mut iterator) = core.callbacks.take_iterator(iterator_id) else {
        return Err(CallbackError::new(
            "Error",
            format!("unknown iterator {iterator_id}"),
        ));
    };
    match iterator.next().await {
        Some(Ok(value)) => {
            core.callbacks.store_iterator(iterator_id, iterator);
            let wire = marshal::marshal(value, core.as_scope())?;
            Ok(InvokeOutcome::Respond(done_object(false, Some(wire))))
        }
        Some(Err(error)) => {
            if let Some((next_id, return_id)) = evict_callbacks {
                core.callbacks.remove(next_id);
                core.callbacks.remove(return_id);
            }
            Err(error)
        }
        None => {
            if let Some((next_id, return_id)) = evict_callbacks {
                core.callbacks.remove(next_id);
                core.callbacks.remove(return_id);
            }
            Ok(InvokeOutcome::Respond(done_object(true, None)))
        }
    }
}

async fn run_fetch(
    core: &Arc<ConnectionCore>,
    request_id: u64,
    handler: FetchHandler,
    args: Vec<Value>,
) -> Result<InvokeOutcome, CallbackError> {
    let request = match args.into_iter().next() {
        Some(Value::Request(request)) => *request,
        other => {
            return Err(CallbackError::new(
                "TypeError",
                format!("fetch callback expects a request, got {other:?}"),
            ))
        }
    };
    let response = handler(request).await?;

    let inline = match response.body.size_hint() {
        Some(size) => size < BODY_STREAM_THRESHOLD && !matches!(response.body, Body::Stream { .. }),
        None => false,
    };
    if inline {
        let wire = marshal::marshal(Value::Response(Box::new(response)), core.as_scope())?;
        return Ok(InvokeOutcome::Respond(wire));
    }

    start_callback_stream(core, request_id, response);
    Ok(InvokeOutcome::Streaming)
}

/// Streams a fetch-callback response body daemon-ward. The exchange has no
/// trailing `callback-response`; `callback-stream-end` (or an error, or a
/// daemon-side cancel) completes it.
fn start_callback_stream(core: &Arc<ConnectionCore>, request_id: u64, response: HttpResponse) {
    let stream_id = core.ids.next_stream();
    core.outbound
        .send_or_warn(Message::CallbackStreamStart(CallbackStreamStart {
            request_id,
            stream_id,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
        }));

    let mut body = response.body.into_stream();
    let task_core = core.clone();
    let handle = tokio::spawn(async move {
        loop {
            match body.next().await {
                Some(Ok(mut bytes)) => {
                    while !bytes.is_empty() {
                        let piece = bytes.split_to(bytes.len().min(MAX_CHUNK_SIZE));
                        task_core.outbound.send_or_warn(Message::CallbackStreamChunk(
                            CallbackStreamChunk {
                                stream_id,
                                bytes: ByteBuf::from(piece.to_vec()),
                            },
                        ));
                    }
                }
                Some(Err(error)) => {
                    debug!(stream_id, %error, "callback body failed");
                    task_core
                        .outbound
                        .send_or_warn(Message::StreamError(StreamError {
                            stream_id,
                            message: error.to_string(),
                        }));
                    break;
                }
                None => {
                    task_core
                        .outbound
                        .send_or_warn(Message::CallbackStreamEnd(CallbackStreamEnd { stream_id }));
                    break;
                }
            }
        }
        task_core.remove_callback_stream(stream_id);
    });
    core.register_callback_stream(stream_id, handle.abort_handle());
}
