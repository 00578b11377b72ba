// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use datadog_isolate_ipc::msg::{Message, RuntimeRequest};

use crate::error::ClientError;
use crate::runtime::RuntimeInner;

#[derive(Clone)]
pub struct TimersHandle {
    inner: Arc<RuntimeInner>,
}

impl TimersHandle {
    pub(crate) fn new(inner: Arc<RuntimeInner>) -> Self {
        TimersHandle { inner }
    }

    /// Clears every pending timer inside the isolate.
    pub async fn reset(&self) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::TimersReset(RuntimeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }
}
