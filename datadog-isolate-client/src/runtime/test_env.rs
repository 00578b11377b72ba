// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use datadog_isolate_ipc::msg::{Message, RuntimeRequest, TestRun};
use serde::Deserialize;

use crate::error::ClientError;
use crate::runtime::RuntimeInner;

/// Outcome of a test run inside the isolate.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct TestRunReport {
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
}

/// Test-environment surface. Every method fails with a configuration
/// error when the runtime was created without the test environment.
#[derive(Clone)]
pub struct TestEnvironmentHandle {
    inner: Arc<RuntimeInner>,
}

impl TestEnvironmentHandle {
    pub(crate) fn new(inner: Arc<RuntimeInner>) -> Self {
        TestEnvironmentHandle { inner }
    }

    fn ensure_enabled(&self) -> Result<(), ClientError> {
        if self.inner.test_enabled {
            Ok(())
        } else {
            Err(ClientError::Configuration(
                "test environment not enabled for this runtime",
            ))
        }
    }

    /// Runs registered tests, optionally only those whose name matches
    /// `filter`.
    pub async fn run(&self, filter: Option<String>) -> Result<TestRunReport, ClientError> {
        self.ensure_enabled()?;
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::TestRun(TestRun {
            request_id,
            runtime_id: self.inner.runtime_id,
            filter,
        });
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        rmpv::ext::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    pub async fn has_tests(&self) -> Result<bool, ClientError> {
        self.ensure_enabled()?;
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::TestHas(RuntimeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
        });
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        value
            .as_bool()
            .ok_or_else(|| ClientError::Protocol("expected a boolean".into()))
    }

    pub async fn test_count(&self) -> Result<u64, ClientError> {
        self.ensure_enabled()?;
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::TestCount(RuntimeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
        });
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        value
            .as_u64()
            .ok_or_else(|| ClientError::Protocol("expected an integer".into()))
    }

    /// Drops registered tests and collected results.
    pub async fn reset(&self) -> Result<(), ClientError> {
        self.ensure_enabled()?;
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::TestReset(RuntimeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }
}
