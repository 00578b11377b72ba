// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use bytes::Bytes;
use datadog_isolate_ipc::msg::{Message, StreamClose, StreamError, StreamPush};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_bytes::ByteBuf;
use tracing::debug;

use crate::error::ClientError;
use crate::outbound::Outbound;
use crate::streams::MAX_CHUNK_SIZE;

/// Byte source for an upload body.
pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UploadPhase {
    Active,
    Closing,
    Closed,
}

/// Client-side state of one client-to-daemon byte stream. Bytes move only
/// while credit covers them; credit never goes negative.
pub(crate) struct UploadShared {
    stream_id: u64,
    state: Mutex<UploadState>,
}

struct UploadState {
    phase: UploadPhase,
    sent: u64,
    credit: u64,
    // at most one credit-waiter: only the pump task awaits here
    waker: Option<Waker>,
}

impl UploadShared {
    pub(crate) fn new(stream_id: u64) -> Self {
        UploadShared {
            stream_id,
            state: Mutex::new(UploadState {
                phase: UploadPhase::Active,
                sent: 0,
                credit: 0,
                waker: None,
            }),
        }
    }

    pub(crate) fn grant(&self, amount: u64) {
        let mut state = self.state.lock().unwrap();
        state.credit = state.credit.saturating_add(amount);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Terminates the session from the daemon or connection side; the pump
    /// observes this on its next credit wait.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.phase = UploadPhase::Closed;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    /// Waits until the session holds at least `amount` bytes of credit,
    /// then deducts it.
    async fn reserve(&self, amount: u64) -> Result<(), ClientError> {
        poll_fn(|cx| {
            let mut state = self.state.lock().unwrap();
            if state.phase == UploadPhase::Closed {
                return Poll::Ready(Err(ClientError::ConnectionClosed));
            }
            if state.credit >= amount {
                state.credit -= amount;
                state.sent += amount;
                return Poll::Ready(Ok(()));
            }
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.state.lock().unwrap().sent
    }
}

/// All live upload sessions of one connection, keyed by stream id.
#[derive(Default)]
pub(crate) struct UploadRegistry {
    inner: Mutex<HashMap<u64, Arc<UploadShared>>>,
}

impl UploadRegistry {
    pub(crate) fn insert(&self, shared: Arc<UploadShared>) {
        self.inner
            .lock()
            .unwrap()
            .insert(shared.stream_id, shared.clone());
    }

    pub(crate) fn get(&self, stream_id: u64) -> Option<Arc<UploadShared>> {
        self.inner.lock().unwrap().get(&stream_id).cloned()
    }

    pub(crate) fn remove(&self, stream_id: u64) -> Option<Arc<UploadShared>> {
        self.inner.lock().unwrap().remove(&stream_id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<UploadShared>> {
        self.inner.lock().unwrap().drain().map(|(_, s)| s).collect()
    }
}

/// Pumps `body` to the daemon in chunks of at most [`MAX_CHUNK_SIZE`],
/// awaiting credit before each one. On exhaustion emits `stream-close`, on
/// a body error `stream-error`.
pub(crate) async fn pump_upload(
    outbound: Outbound,
    registry: Arc<UploadRegistry>,
    shared: Arc<UploadShared>,
    mut body: ByteStream,
) {
    let stream_id = shared.stream_id;
    loop {
        match body.next().await {
            Some(Ok(mut bytes)) => {
                while !bytes.is_empty() {
                    let piece = bytes.split_to(bytes.len().min(MAX_CHUNK_SIZE));
                    if shared.reserve(piece.len() as u64).await.is_err() {
                        debug!(stream_id, "upload session closed mid-body");
                        registry.remove(stream_id);
                        return;
                    }
                    outbound.send_or_warn(Message::StreamPush(StreamPush {
                        stream_id,
                        bytes: ByteBuf::from(piece.to_vec()),
                    }));
                }
            }
            Some(Err(e)) => {
                outbound.send_or_warn(Message::StreamError(StreamError {
                    stream_id,
                    message: e.to_string(),
                }));
                break;
            }
            None => {
                {
                    let mut state = shared.state.lock().unwrap();
                    if state.phase == UploadPhase::Active {
                        state.phase = UploadPhase::Closing;
                    }
                }
                outbound.send_or_warn(Message::StreamClose(StreamClose { stream_id }));
                debug!(stream_id, bytes = shared.bytes_sent(), "upload complete");
                break;
            }
        }
    }
    shared.close();
    registry.remove(stream_id);
}
