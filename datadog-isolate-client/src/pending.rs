// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::http::HttpResponse;

/// How an RPC completed. Most requests resolve with a plain value; runtime
/// creation and streamed responses carry their own shapes.
#[derive(Debug)]
pub(crate) enum RpcOutcome {
    Value(rmpv::Value),
    RuntimeCreated { runtime_id: u64, reused: bool },
    Stream(HttpResponse),
}

type Awaiter = oneshot::Sender<Result<RpcOutcome, ClientError>>;

/// Outstanding requests by id. An entry is removed exactly once, by
/// whichever of {response, error response, timeout, connection close}
/// fires first.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<u64, Awaiter>>,
}

impl PendingRequests {
    pub(crate) fn insert(&self, request_id: u64) -> oneshot::Receiver<Result<RpcOutcome, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().insert(request_id, tx);
        rx
    }

    /// Resolves the awaiter for `request_id`. Returns false when no entry
    /// is present (late response after timeout, or a daemon bug).
    pub(crate) fn complete(
        &self,
        request_id: u64,
        result: Result<RpcOutcome, ClientError>,
    ) -> bool {
        match self.inner.lock().unwrap().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, request_id: u64) {
        self.inner.lock().unwrap().remove(&request_id);
    }

    pub(crate) fn drain(&self) -> Vec<Awaiter> {
        self.inner
            .lock()
            .unwrap()
            .drain()
            .map(|(_, tx)| tx)
            .collect()
    }
}
