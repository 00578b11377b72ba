// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use datadog_isolate_ipc::msg::{Message, StreamError, StreamPull};
use futures::Stream;

use crate::error::ClientError;
use crate::outbound::Outbound;
use crate::streams::DEFAULT_STREAM_CREDIT;

/// Client-side state of one daemon-to-client byte stream.
///
/// Chunks that arrive before the consumer pulls are buffered; a terminal
/// error is raised only once the buffer has drained, so bytes received
/// before the failure stay visible.
pub(crate) struct DownloadShared {
    stream_id: u64,
    state: Mutex<DownloadState>,
}

#[derive(Default)]
struct DownloadState {
    queue: VecDeque<Bytes>,
    error: Option<ClientError>,
    done: bool,
    cancelled: bool,
    // set once by whichever terminal event fires first
    finalized: bool,
    wakers: Vec<Waker>,
}

impl DownloadState {
    fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

impl DownloadShared {
    pub(crate) fn new(stream_id: u64) -> Self {
        DownloadShared {
            stream_id,
            state: Mutex::new(DownloadState::default()),
        }
    }

    pub(crate) fn push_chunk(&self, chunk: Bytes) {
        let mut state = self.state.lock().unwrap();
        if state.finalized || state.cancelled {
            // late chunk after cancel or close, discard
            return;
        }
        state.queue.push_back(chunk);
        state.wake_all();
    }

    pub(crate) fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if state.finalized || state.cancelled {
            return;
        }
        state.done = true;
        state.finalized = true;
        state.wake_all();
    }

    pub(crate) fn fail(&self, error: ClientError) {
        let mut state = self.state.lock().unwrap();
        if state.finalized || state.cancelled {
            return;
        }
        state.error = Some(error);
        state.finalized = true;
        state.wake_all();
    }

    /// Consumer-side cancel. Returns false when the stream already
    /// terminated, in which case nothing is sent upward.
    fn cancel_local(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.finalized || state.cancelled {
            return false;
        }
        state.cancelled = true;
        state.queue.clear();
        state.wake_all();
        true
    }
}

/// All live download receivers of one connection, keyed by stream id.
#[derive(Default)]
pub(crate) struct DownloadRegistry {
    inner: Mutex<HashMap<u64, Arc<DownloadShared>>>,
}

impl DownloadRegistry {
    pub(crate) fn insert(&self, shared: Arc<DownloadShared>) {
        self.inner
            .lock()
            .unwrap()
            .insert(shared.stream_id, shared.clone());
    }

    pub(crate) fn get(&self, stream_id: u64) -> Option<Arc<DownloadShared>> {
        self.inner.lock().unwrap().get(&stream_id).cloned()
    }

    pub(crate) fn remove(&self, stream_id: u64) -> Option<Arc<DownloadShared>> {
        self.inner.lock().unwrap().remove(&stream_id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<DownloadShared>> {
        self.inner.lock().unwrap().drain().map(|(_, s)| s).collect()
    }
}

/// Streamed response body handed to the caller. Pulling a chunk replenishes
/// the daemon's send credit; dropping without [`ResponseBody::cancel`]
/// leaves the stream to terminate on the daemon's schedule.
pub struct ResponseBody {
    shared: Arc<DownloadShared>,
    registry: Arc<DownloadRegistry>,
    outbound: Outbound,
}

impl ResponseBody {
    pub(crate) fn new(
        shared: Arc<DownloadShared>,
        registry: Arc<DownloadRegistry>,
        outbound: Outbound,
    ) -> Self {
        ResponseBody {
            shared,
            registry,
            outbound,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.shared.stream_id
    }

    /// Gracefully abandons the stream: tells the daemon, closes the
    /// receiver without raising an error to the consumer, and yields once
    /// so chunk frames already queued inbound are dispatched (and
    /// discarded) before this resolves.
    pub async fn cancel(&self) {
        if !self.shared.cancel_local() {
            return;
        }
        self.registry.remove(self.shared.stream_id);
        self.outbound.send_or_warn(Message::StreamError(StreamError {
            stream_id: self.shared.stream_id,
            message: "cancelled by consumer".into(),
        }));
        tokio::task::yield_now().await;
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(chunk) = state.queue.pop_front() {
            drop(state);
            self.outbound.send_or_warn(Message::StreamPull(StreamPull {
                stream_id: self.shared.stream_id,
                amount: DEFAULT_STREAM_CREDIT,
            }));
            return Poll::Ready(Some(Ok(chunk)));
        }
        if let Some(error) = state.error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        // finalized with no pending error covers "error already raised"
        if state.done || state.cancelled || state.finalized {
            return Poll::Ready(None);
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("stream_id", &self.shared.stream_id)
            .finish()
    }
}
