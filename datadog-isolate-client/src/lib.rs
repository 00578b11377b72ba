// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the isolate daemon.
//!
//! A host process opens one stream-socket connection and multiplexes over
//! it: request/response RPCs that create, evaluate into, and dispose of
//! sandboxed runtimes; asynchronous callbacks from the daemon back into
//! host code; credit-controlled byte streams for large bodies; and
//! server-push notifications for WebSocket traffic originating inside an
//! isolate.
//!
//! ```no_run
//! use datadog_isolate_client::{connect, ConnectConfig, EvalOptions, RuntimeConfig};
//!
//! # async fn demo() -> Result<(), datadog_isolate_client::ClientError> {
//! let connection = connect(ConnectConfig::unix("/tmp/isolate.sock")).await?;
//! let runtime = connection.create_runtime(RuntimeConfig::default()).await?;
//! runtime
//!     .eval("export default 1", EvalOptions::default())
//!     .await?;
//! runtime.dispose().await?;
//! connection.close();
//! # Ok(())
//! # }
//! ```
//!
//! There is no automatic reconnection: when the connection drops, every
//! outstanding request rejects, every live stream errors, and the caller
//! decides whether to rebuild.

mod callbacks;
mod config;
mod connection;
mod error;
mod http;
mod marshal;
mod outbound;
mod pending;
mod runtime;
mod streams;
mod websocket;

pub use config::{
    ConnectConfig, DispatchOptions, EvalOptions, FetchHandler, FunctionSpec, IteratorFactory,
    ModuleLoader, PlaywrightConfig, PlaywrightLifecycleHook, RuntimeConfig, TestEnvironment,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};
pub use connection::{connect, IsolateConnection};
pub use error::{CallbackError, ClientError, RemoteError};
pub use http::{Body, HttpRequest, HttpResponse};
pub use marshal::{host_fn, FileValue, HostFunction, HostPromise, HostStream, Value};
pub use runtime::{
    ConsoleHandle, FetchHandle, PlaywrightHandle, Runtime, TestEnvironmentHandle, TestRunReport,
    TimersHandle, UpgradeResult,
};
pub use streams::{
    ByteStream, ResponseBody, BODY_STREAM_THRESHOLD, DEFAULT_STREAM_CREDIT, MAX_CHUNK_SIZE,
};
pub use websocket::{WsCommand, WsPayload, WsSubscriber, WsSubscription};

pub use datadog_isolate_ipc::msg::TestEnvironmentOptions;
pub use datadog_isolate_ipc::platform::Endpoint;
