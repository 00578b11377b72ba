// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use datadog_isolate_ipc::msg::{Message, PlaywrightOperation};

use crate::error::ClientError;
use crate::marshal::{self, Value};
use crate::runtime::RuntimeInner;

/// Browser-automation surface. Operations are opaque to the client; the
/// daemon routes them to the page objects the helper decorated. Arguments
/// pass through the marshalling bridge, so they may carry functions,
/// promises, and iterators.
#[derive(Clone)]
pub struct PlaywrightHandle {
    inner: Arc<RuntimeInner>,
}

impl PlaywrightHandle {
    pub(crate) fn new(inner: Arc<RuntimeInner>) -> Self {
        PlaywrightHandle { inner }
    }

    pub async fn operation(
        &self,
        operation: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let core = &self.inner.core;
        let args = args
            .into_iter()
            .map(|arg| marshal::marshal(arg, core.as_scope()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let request_id = core.ids.next_request();
        let message = Message::PlaywrightOperation(PlaywrightOperation {
            request_id,
            runtime_id: self.inner.runtime_id,
            operation: operation.into(),
            args,
        });
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(marshal::unmarshal(value))
    }
}
