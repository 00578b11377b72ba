// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use datadog_isolate_ipc::msg::{Message, RuntimeRequest};

use crate::error::ClientError;
use crate::runtime::RuntimeInner;

/// Introspection over the isolate's console state.
#[derive(Clone)]
pub struct ConsoleHandle {
    inner: Arc<RuntimeInner>,
}

impl ConsoleHandle {
    pub(crate) fn new(inner: Arc<RuntimeInner>) -> Self {
        ConsoleHandle { inner }
    }

    fn runtime_request(&self, request_id: u64) -> RuntimeRequest {
        RuntimeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
        }
    }

    pub async fn reset(&self) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::ConsoleReset(self.runtime_request(request_id));
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }

    /// Open `console.time` labels with their start timestamps (ms).
    pub async fn timers(&self) -> Result<BTreeMap<String, f64>, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::ConsoleTimers(self.runtime_request(request_id));
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        rmpv::ext::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// `console.count` labels with their current counts.
    pub async fn counters(&self) -> Result<BTreeMap<String, u64>, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::ConsoleCounters(self.runtime_request(request_id));
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        rmpv::ext::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    /// Current `console.group` nesting depth.
    pub async fn group_depth(&self) -> Result<u64, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::ConsoleGroupDepth(self.runtime_request(request_id));
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        value
            .as_u64()
            .ok_or_else(|| ClientError::Protocol("expected an integer".into()))
    }
}
