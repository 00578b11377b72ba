// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Push router for outbound WebSocket traffic originating in isolates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use datadog_isolate_ipc::msg::{WsCommandPayload, WsData};
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum WsPayload {
    Text(String),
    Binary(Bytes),
}

impl From<WsData> for WsPayload {
    fn from(data: WsData) -> Self {
        match data {
            WsData::Text(text) => WsPayload::Text(text),
            // owned copy, decoupled from the parser's buffer
            WsData::Binary(bytes) => WsPayload::Binary(Bytes::from(bytes.into_vec())),
        }
    }
}

impl From<WsPayload> for WsData {
    fn from(payload: WsPayload) -> Self {
        match payload {
            WsPayload::Text(text) => WsData::Text(text),
            WsPayload::Binary(bytes) => WsData::Binary(serde_bytes::ByteBuf::from(bytes.to_vec())),
        }
    }
}

/// One pushed WebSocket command, delivered to every subscriber of the
/// originating runtime.
#[derive(Clone, Debug)]
pub struct WsCommand {
    pub kind: String,
    pub connection_id: u64,
    pub data: Option<WsPayload>,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl From<WsCommandPayload> for WsCommand {
    fn from(payload: WsCommandPayload) -> Self {
        WsCommand {
            kind: payload.kind,
            connection_id: payload.connection_id,
            data: payload.data.map(WsPayload::from),
            code: payload.code,
            reason: payload.reason,
        }
    }
}

pub type WsSubscriber = Arc<dyn Fn(WsCommand) + Send + Sync>;

/// Per-runtime subscriber sets. Unsubscription is by token identity;
/// disposing a runtime drops the whole set.
#[derive(Default)]
pub(crate) struct WsRouter {
    inner: Mutex<HashMap<u64, Vec<(u64, WsSubscriber)>>>,
    next_token: AtomicU64,
}

impl WsRouter {
    pub(crate) fn subscribe(&self, runtime_id: u64, subscriber: WsSubscriber) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .lock()
            .unwrap()
            .entry(runtime_id)
            .or_default()
            .push((token, subscriber));
        token
    }

    pub(crate) fn unsubscribe(&self, runtime_id: u64, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscribers) = inner.get_mut(&runtime_id) {
            subscribers.retain(|(t, _)| *t != token);
            if subscribers.is_empty() {
                inner.remove(&runtime_id);
            }
        }
    }

    pub(crate) fn publish(&self, runtime_id: u64, command: WsCommand) {
        let subscribers: Vec<WsSubscriber> = {
            let inner = self.inner.lock().unwrap();
            match inner.get(&runtime_id) {
                Some(subscribers) => subscribers.iter().map(|(_, s)| s.clone()).collect(),
                None => {
                    debug!(runtime_id, "ws command with no subscribers");
                    return;
                }
            }
        };
        for subscriber in subscribers {
            subscriber(command.clone());
        }
    }

    pub(crate) fn drop_runtime(&self, runtime_id: u64) {
        self.inner.lock().unwrap().remove(&runtime_id);
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Handle returned from a subscription; detach with
/// [`WsSubscription::unsubscribe`].
pub struct WsSubscription {
    pub(crate) router: Arc<WsRouter>,
    pub(crate) runtime_id: u64,
    pub(crate) token: u64,
}

impl WsSubscription {
    pub fn unsubscribe(self) {
        self.router.unsubscribe(self.runtime_id, self.token);
    }
}
