// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use datadog_isolate_ipc::msg::TestEnvironmentOptions;
use datadog_isolate_ipc::platform::Endpoint;
use futures::future::BoxFuture;

use crate::error::CallbackError;
use crate::http::{HttpRequest, HttpResponse};
use crate::marshal::{HostFunction, HostStream, Value};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to reach the daemon.
#[derive(Clone, Debug)]
pub struct ConnectConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Default timeout for every RPC; fetch dispatches can override it
    /// per request.
    pub request_timeout: Duration,
}

impl ConnectConfig {
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ConnectConfig {
            endpoint: Endpoint::Unix(path.into()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectConfig {
            endpoint: Endpoint::Tcp(host.into(), port),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Host-side fetch implementation: invoked when isolate code calls fetch.
/// The response body may stream back to the daemon.
pub type FetchHandler = Arc<
    dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, CallbackError>> + Send + Sync,
>;

/// Resolves a module specifier to source text. Results are cached per
/// connection by specifier.
pub type ModuleLoader =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<String, CallbackError>> + Send + Sync>;

/// Produces the value stream backing a custom async-iterator function.
pub type IteratorFactory = Arc<dyn Fn(Vec<Value>) -> HostStream + Send + Sync>;

/// A named custom function exposed to the isolate.
#[derive(Clone)]
pub enum FunctionSpec {
    /// Plain async function; its (marshalled) return value goes back to
    /// the isolate.
    Function(HostFunction),
    /// Async iterator; the isolate drives it through start/next/return.
    AsyncIterator(IteratorFactory),
}

#[derive(Clone, Debug, Default)]
pub enum TestEnvironment {
    #[default]
    Disabled,
    Enabled,
    WithOptions(TestEnvironmentOptions),
}

impl TestEnvironment {
    pub(crate) fn enabled(&self) -> bool {
        !matches!(self, TestEnvironment::Disabled)
    }

    pub(crate) fn wire_options(&self) -> Option<TestEnvironmentOptions> {
        match self {
            TestEnvironment::Disabled => None,
            TestEnvironment::Enabled => Some(TestEnvironmentOptions::default()),
            TestEnvironment::WithOptions(options) => Some(options.clone()),
        }
    }
}

/// Hook invoked with the runtime id when a runtime is created or disposed,
/// so the browser-automation helper can attach and detach its page
/// listeners.
pub type PlaywrightLifecycleHook = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone)]
pub struct PlaywrightConfig {
    /// Receives marshalled playwright operations initiated by the isolate.
    pub handler: HostFunction,
    pub on_attach: Option<PlaywrightLifecycleHook>,
    pub on_detach: Option<PlaywrightLifecycleHook>,
}

/// Everything a `create-runtime` request carries, host hooks included.
#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub memory_limit_mb: Option<u64>,
    pub working_dir: Option<PathBuf>,
    pub namespace: Option<String>,
    pub test_environment: TestEnvironment,
    pub console: Option<HostFunction>,
    pub fetch: Option<FetchHandler>,
    pub fs: Option<HostFunction>,
    pub module_loader: Option<ModuleLoader>,
    pub test_event: Option<HostFunction>,
    pub playwright: Option<PlaywrightConfig>,
    pub functions: BTreeMap<String, FunctionSpec>,
}

/// Options for evaluating a module.
#[derive(Clone, Debug, Default)]
pub struct EvalOptions {
    pub filename: Option<String>,
    /// Cap on wall-clock execution inside the isolate.
    pub max_duration: Option<Duration>,
}

/// Options for one fetch dispatch.
#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Overrides the connection's default request timeout.
    pub timeout: Option<Duration>,
}
