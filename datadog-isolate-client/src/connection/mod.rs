// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle and the multiplexer state shared by every façade.
//!
//! One socket, one reader task, one writer task. All maps live on
//! [`ConnectionCore`] behind mutexes that are never held across an await;
//! caller tasks and the dispatch task interleave only at suspension
//! points.

pub(crate) mod dispatch;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use datadog_isolate_ipc::msg::Message;
use datadog_isolate_ipc::platform::Channel;
use datadog_isolate_ipc::transport::Transport;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::callbacks::{CallbackDescriptor, CallbackKind, CallbackRegistry, CallbackTarget};
use crate::config::{ConnectConfig, RuntimeConfig};
use crate::error::ClientError;
use crate::marshal::{
    HostFunction, HostPromise, HostStream, IteratorIds, PromiseIds, RegistrationScope,
};
use crate::outbound::Outbound;
use crate::pending::{PendingRequests, RpcOutcome};
use crate::runtime::Runtime;
use crate::streams::download::DownloadRegistry;
use crate::streams::upload::UploadRegistry;
use crate::websocket::WsRouter;

/// Monotone per-connection counters. Ids are never reused.
#[derive(Default)]
pub(crate) struct IdAllocator {
    request: AtomicU64,
    callback: AtomicU64,
    stream: AtomicU64,
    iterator: AtomicU64,
    promise: AtomicU64,
}

impl IdAllocator {
    pub(crate) fn next_request(&self) -> u64 {
        self.request.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_callback(&self) -> u64 {
        self.callback.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_stream(&self) -> u64 {
        self.stream.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_iterator(&self) -> u64 {
        self.iterator.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_promise(&self) -> u64 {
        self.promise.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub(crate) struct ConnectionCore {
    pub(crate) outbound: Outbound,
    pub(crate) ids: IdAllocator,
    pub(crate) pending: PendingRequests,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) downloads: Arc<DownloadRegistry>,
    pub(crate) uploads: Arc<UploadRegistry>,
    pub(crate) ws_router: Arc<WsRouter>,
    pub(crate) module_cache: Mutex<HashMap<String, String>>,
    pub(crate) request_timeout: Duration,
    callback_streams: Mutex<HashMap<u64, AbortHandle>>,
    close_tx: watch::Sender<bool>,
}

impl ConnectionCore {
    pub(crate) fn as_scope(&self) -> &dyn RegistrationScope {
        self
    }

    /// Inserts a pending entry and writes the request frame. The caller
    /// must have stamped `request_id` into the message.
    pub(crate) fn start_request(
        &self,
        request_id: u64,
        message: Message,
    ) -> Result<oneshot::Receiver<Result<RpcOutcome, ClientError>>, ClientError> {
        let rx = self.pending.insert(request_id);
        if let Err(e) = self.outbound.send(message) {
            self.pending.remove(request_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Awaits the response with a timeout; expiry drops the pending entry
    /// so a late response is discarded with a warning.
    pub(crate) async fn await_response(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<Result<RpcOutcome, ClientError>>,
        timeout: Duration,
    ) -> Result<RpcOutcome, ClientError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    pub(crate) async fn request(
        &self,
        request_id: u64,
        message: Message,
        timeout: Duration,
    ) -> Result<RpcOutcome, ClientError> {
        let rx = self.start_request(request_id, message)?;
        self.await_response(request_id, rx, timeout).await
    }

    /// Request returning the daemon's plain value payload.
    pub(crate) async fn request_value(
        &self,
        request_id: u64,
        message: Message,
        timeout: Duration,
    ) -> Result<rmpv::Value, ClientError> {
        match self.request(request_id, message, timeout).await? {
            RpcOutcome::Value(value) => Ok(value),
            other => Err(ClientError::Protocol(format!(
                "unexpected response shape {other:?}"
            ))),
        }
    }

    pub(crate) fn register_callback_stream(&self, stream_id: u64, handle: AbortHandle) {
        self.callback_streams
            .lock()
            .unwrap()
            .insert(stream_id, handle);
    }

    pub(crate) fn remove_callback_stream(&self, stream_id: u64) {
        self.callback_streams.lock().unwrap().remove(&stream_id);
    }

    /// Daemon-side cancel of a callback body stream.
    pub(crate) fn abort_callback_stream(&self, stream_id: u64) -> bool {
        match self.callback_streams.lock().unwrap().remove(&stream_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Tears the connection down and fans the loss out to all outstanding
    /// work. Idempotent.
    pub(crate) fn shutdown(&self) {
        if !self.outbound.mark_disconnected() {
            return;
        }
        let _ = self.close_tx.send(true);
        for awaiter in self.pending.drain() {
            let _ = awaiter.send(Err(ClientError::ConnectionClosed));
        }
        for download in self.downloads.drain() {
            // buffered chunks stay readable; the error surfaces after them
            download.fail(ClientError::ConnectionClosed);
        }
        for upload in self.uploads.drain() {
            upload.close();
        }
        for (_, handle) in self.callback_streams.lock().unwrap().drain() {
            handle.abort();
        }
        self.ws_router.clear();
        self.callbacks.clear();
        self.module_cache.lock().unwrap().clear();
        debug!("connection shut down");
    }
}

impl RegistrationScope for ConnectionCore {
    fn register_function(&self, function: HostFunction) -> u64 {
        let callback_id = self.ids.next_callback();
        self.callbacks.register(
            callback_id,
            CallbackDescriptor {
                kind: CallbackKind::ReturnedFunction,
                target: CallbackTarget::Hook(function),
            },
        );
        callback_id
    }

    fn register_promise(&self, promise: HostPromise) -> PromiseIds {
        let promise_id = self.ids.next_promise();
        let resolve_callback_id = self.ids.next_callback();
        self.callbacks.store_promise(promise_id, promise);
        self.callbacks.register(
            resolve_callback_id,
            CallbackDescriptor {
                kind: CallbackKind::PromiseResolve,
                target: CallbackTarget::Promise { promise_id },
            },
        );
        PromiseIds {
            promise_id,
            resolve_callback_id,
        }
    }

    fn register_iterator(&self, iterator: HostStream) -> IteratorIds {
        let iterator_id = self.ids.next_iterator();
        let next_callback_id = self.ids.next_callback();
        let return_callback_id = self.ids.next_callback();
        self.callbacks.store_iterator(iterator_id, iterator);
        let target = CallbackTarget::ReturnedIterator {
            iterator_id,
            next_callback_id,
            return_callback_id,
        };
        self.callbacks.register(
            next_callback_id,
            CallbackDescriptor {
                kind: CallbackKind::ReturnedIteratorNext,
                target: target.clone(),
            },
        );
        self.callbacks.register(
            return_callback_id,
            CallbackDescriptor {
                kind: CallbackKind::ReturnedIteratorReturn,
                target,
            },
        );
        IteratorIds {
            iterator_id,
            next_callback_id,
            return_callback_id,
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Transport, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            message = rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        debug!("write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Transport>,
    core: Arc<ConnectionCore>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            frame = stream.next() => match frame {
                Some(Ok(message)) => dispatch::dispatch(&core, message),
                Some(Err(e)) => {
                    // frame boundaries are unrecoverable after a parse
                    // error, so the connection goes down with it
                    error!("read path failed: {e}");
                    break;
                }
                None => {
                    debug!("daemon closed the connection");
                    break;
                }
            },
        }
    }
    core.shutdown();
}

/// Connection façade handed to the host process.
#[derive(Clone)]
pub struct IsolateConnection {
    core: Arc<ConnectionCore>,
}

/// Opens a connection to the daemon and wires the read/write pipeline.
pub async fn connect(config: ConnectConfig) -> Result<IsolateConnection, ClientError> {
    let channel = Channel::connect(&config.endpoint, config.connect_timeout).await?;
    let (sink, stream) = Transport::from(channel).split();

    let (tx, rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(false);
    let core = Arc::new(ConnectionCore {
        outbound: Outbound::new(tx),
        ids: IdAllocator::default(),
        pending: PendingRequests::default(),
        callbacks: CallbackRegistry::default(),
        downloads: Arc::new(DownloadRegistry::default()),
        uploads: Arc::new(UploadRegistry::default()),
        ws_router: Arc::new(WsRouter::default()),
        module_cache: Mutex::new(HashMap::new()),
        request_timeout: config.request_timeout,
        callback_streams: Mutex::new(HashMap::new()),
        close_tx,
    });

    tokio::spawn(write_loop(sink, rx, close_rx.clone()));
    tokio::spawn(read_loop(stream, core.clone(), close_rx));

    Ok(IsolateConnection { core })
}

impl IsolateConnection {
    pub async fn create_runtime(&self, config: RuntimeConfig) -> Result<Runtime, ClientError> {
        Runtime::create(self.core.clone(), config).await
    }

    /// Creates a runtime under a namespace; the daemon may reuse an
    /// existing isolate for it.
    pub async fn create_namespace(
        &self,
        namespace: impl Into<String>,
        mut config: RuntimeConfig,
    ) -> Result<Runtime, ClientError> {
        config.namespace = Some(namespace.into());
        self.create_runtime(config).await
    }

    pub fn is_connected(&self) -> bool {
        self.core.outbound.is_connected()
    }

    /// Closes the connection and rejects everything outstanding.
    /// Idempotent.
    pub fn close(&self) {
        self.core.shutdown();
    }
}
