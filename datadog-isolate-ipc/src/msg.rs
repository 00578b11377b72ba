// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed protocol messages. Every frame carries exactly one [`Message`],
//! encoded as a MessagePack map with a numeric `type` tag (see
//! [`crate::codec`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// Numeric message-type tags. The daemon dispatches on these, so the values
/// are part of the wire contract and must never be reassigned.
pub mod tag {
    pub const CREATE_RUNTIME: u8 = 1;
    pub const CREATE_RUNTIME_RESULT: u8 = 2;
    pub const EVAL: u8 = 3;
    pub const DISPOSE_RUNTIME: u8 = 4;
    pub const RESPONSE_OK: u8 = 5;
    pub const RESPONSE_ERROR: u8 = 6;
    pub const DISPATCH_REQUEST: u8 = 7;
    pub const RESPONSE_STREAM_START: u8 = 8;
    pub const RESPONSE_STREAM_CHUNK: u8 = 9;
    pub const RESPONSE_STREAM_END: u8 = 10;
    pub const STREAM_PULL: u8 = 11;
    pub const STREAM_PUSH: u8 = 12;
    pub const STREAM_CLOSE: u8 = 13;
    pub const STREAM_ERROR: u8 = 14;
    pub const CALLBACK_INVOKE: u8 = 15;
    pub const CALLBACK_RESPONSE: u8 = 16;
    pub const CALLBACK_STREAM_START: u8 = 17;
    pub const CALLBACK_STREAM_CHUNK: u8 = 18;
    pub const CALLBACK_STREAM_END: u8 = 19;
    pub const CALLBACK_STREAM_CANCEL: u8 = 20;
    pub const WS_COMMAND: u8 = 21;
    pub const PONG: u8 = 22;
    pub const FETCH_UPGRADE_REQUEST: u8 = 23;
    pub const FETCH_HAS_SERVE_HANDLER: u8 = 24;
    pub const FETCH_HAS_ACTIVE_CONNECTIONS: u8 = 25;
    pub const FETCH_WS_ERROR: u8 = 26;
    pub const WS_OPEN: u8 = 27;
    pub const WS_MESSAGE: u8 = 28;
    pub const WS_CLOSE: u8 = 29;
    pub const TIMERS_RESET: u8 = 30;
    pub const CONSOLE_RESET: u8 = 31;
    pub const CONSOLE_TIMERS: u8 = 32;
    pub const CONSOLE_COUNTERS: u8 = 33;
    pub const CONSOLE_GROUP_DEPTH: u8 = 34;
    pub const TEST_RUN: u8 = 35;
    pub const TEST_HAS: u8 = 36;
    pub const TEST_COUNT: u8 = 37;
    pub const TEST_RESET: u8 = 38;
    pub const PLAYWRIGHT_OPERATION: u8 = 39;
}

/// Callback ids registered with a runtime at creation time. The daemon
/// invokes these through [`Message::CallbackInvoke`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackRegistration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_loader: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_event: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playwright: Option<u64>,
    /// Named custom functions. Async-iterator functions register four
    /// entries under `name:start`, `name:next`, `name:return`, `name:throw`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub functions: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestEnvironmentOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

/// Options carried by `create-runtime`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_environment: Option<TestEnvironmentOptions>,
    #[serde(default)]
    pub callbacks: CallbackRegistration,
}

/// HTTP request shape on the wire. A body is either absent, inlined, or
/// announced as an upload stream (`body_stream_id`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_stream_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_size: Option<u64>,
}

/// Buffered HTTP response shape, carried in the `value` of a `response-ok`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ByteBuf>,
}

/// WebSocket payloads are either UTF-8 text or opaque binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WsData {
    Text(String),
    Binary(ByteBuf),
}

/// Server-push command for outbound WebSocket traffic from an isolate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsCommandPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WsData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error fields of `response-error` and `callback-response`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateRuntime {
    pub request_id: u64,
    #[serde(default)]
    pub options: RuntimeOptions,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateRuntimeResult {
    pub request_id: u64,
    pub runtime_id: u64,
    #[serde(default)]
    pub reused: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Eval {
    pub request_id: u64,
    pub runtime_id: u64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisposeRuntime {
    pub request_id: u64,
    pub runtime_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseOk {
    pub request_id: u64,
    pub value: rmpv::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub request_id: u64,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub request_id: u64,
    pub runtime_id: u64,
    pub request: WireRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseStreamStart {
    pub request_id: u64,
    pub stream_id: u64,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseStreamChunk {
    pub stream_id: u64,
    pub bytes: ByteBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseStreamEnd {
    pub stream_id: u64,
}

/// Credit grant, in bytes, for the given stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamPull {
    pub stream_id: u64,
    pub amount: u64,
}

/// Upload body chunk. Never larger than the chunk cap, never sent without
/// credit covering it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamPush {
    pub stream_id: u64,
    pub bytes: ByteBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamClose {
    pub stream_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    pub stream_id: u64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackInvoke {
    pub request_id: u64,
    pub callback_id: u64,
    #[serde(default)]
    pub args: Vec<rmpv::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<rmpv::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Opens a streamed body for a callback response. The exchange is completed
/// by `callback-stream-end` (or `-cancel`); no `callback-response` follows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackStreamStart {
    pub request_id: u64,
    pub stream_id: u64,
    pub status: u16,
    #[serde(default)]
    pub status_text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackStreamChunk {
    pub stream_id: u64,
    pub bytes: ByteBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackStreamEnd {
    pub stream_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackStreamCancel {
    pub stream_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsCommand {
    pub runtime_id: u64,
    pub command: WsCommandPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchUpgradeRequest {
    pub request_id: u64,
    pub runtime_id: u64,
    pub request: WireRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchHasServeHandler {
    pub request_id: u64,
    pub runtime_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchHasActiveConnections {
    pub request_id: u64,
    pub runtime_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchWsError {
    pub request_id: u64,
    pub runtime_id: u64,
    pub connection_id: u64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsOpen {
    pub request_id: u64,
    pub runtime_id: u64,
    pub connection_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    pub request_id: u64,
    pub runtime_id: u64,
    pub connection_id: u64,
    pub data: WsData,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsClose {
    pub request_id: u64,
    pub runtime_id: u64,
    pub connection_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRequest {
    pub request_id: u64,
    pub runtime_id: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub request_id: u64,
    pub runtime_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaywrightOperation {
    pub request_id: u64,
    pub runtime_id: u64,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<rmpv::Value>,
}

/// One protocol message, one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    CreateRuntime(CreateRuntime),
    CreateRuntimeResult(CreateRuntimeResult),
    Eval(Eval),
    DisposeRuntime(DisposeRuntime),
    ResponseOk(ResponseOk),
    ResponseError(ResponseError),
    DispatchRequest(DispatchRequest),
    ResponseStreamStart(ResponseStreamStart),
    ResponseStreamChunk(ResponseStreamChunk),
    ResponseStreamEnd(ResponseStreamEnd),
    StreamPull(StreamPull),
    StreamPush(StreamPush),
    StreamClose(StreamClose),
    StreamError(StreamError),
    CallbackInvoke(CallbackInvoke),
    CallbackResponse(CallbackResponse),
    CallbackStreamStart(CallbackStreamStart),
    CallbackStreamChunk(CallbackStreamChunk),
    CallbackStreamEnd(CallbackStreamEnd),
    CallbackStreamCancel(CallbackStreamCancel),
    WsCommand(WsCommand),
    Pong,
    FetchUpgradeRequest(FetchUpgradeRequest),
    FetchHasServeHandler(FetchHasServeHandler),
    FetchHasActiveConnections(FetchHasActiveConnections),
    FetchWsError(FetchWsError),
    WsOpen(WsOpen),
    WsMessage(WsMessage),
    WsClose(WsClose),
    TimersReset(RuntimeRequest),
    ConsoleReset(RuntimeRequest),
    ConsoleTimers(RuntimeRequest),
    ConsoleCounters(RuntimeRequest),
    ConsoleGroupDepth(RuntimeRequest),
    TestRun(TestRun),
    TestHas(RuntimeRequest),
    TestCount(RuntimeRequest),
    TestReset(RuntimeRequest),
    PlaywrightOperation(PlaywrightOperation),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::CreateRuntime(_) => tag::CREATE_RUNTIME,
            Message::CreateRuntimeResult(_) => tag::CREATE_RUNTIME_RESULT,
            Message::Eval(_) => tag::EVAL,
            Message::DisposeRuntime(_) => tag::DISPOSE_RUNTIME,
            Message::ResponseOk(_) => tag::RESPONSE_OK,
            Message::ResponseError(_) => tag::RESPONSE_ERROR,
            Message::DispatchRequest(_) => tag::DISPATCH_REQUEST,
            Message::ResponseStreamStart(_) => tag::RESPONSE_STREAM_START,
            Message::ResponseStreamChunk(_) => tag::RESPONSE_STREAM_CHUNK,
            Message::ResponseStreamEnd(_) => tag::RESPONSE_STREAM_END,
            Message::StreamPull(_) => tag::STREAM_PULL,
            Message::StreamPush(_) => tag::STREAM_PUSH,
            Message::StreamClose(_) => tag::STREAM_CLOSE,
            Message::StreamError(_) => tag::STREAM_ERROR,
            Message::CallbackInvoke(_) => tag::CALLBACK_INVOKE,
            Message::CallbackResponse(_) => tag::CALLBACK_RESPONSE,
            Message::CallbackStreamStart(_) => tag::CALLBACK_STREAM_START,
            Message::CallbackStreamChunk(_) => tag::CALLBACK_STREAM_CHUNK,
            Message::CallbackStreamEnd(_) => tag::CALLBACK_STREAM_END,
            Message::CallbackStreamCancel(_) => tag::CALLBACK_STREAM_CANCEL,
            Message::WsCommand(_) => tag::WS_COMMAND,
            Message::Pong => tag::PONG,
            Message::FetchUpgradeRequest(_) => tag::FETCH_UPGRADE_REQUEST,
            Message::FetchHasServeHandler(_) => tag::FETCH_HAS_SERVE_HANDLER,
            Message::FetchHasActiveConnections(_) => tag::FETCH_HAS_ACTIVE_CONNECTIONS,
            Message::FetchWsError(_) => tag::FETCH_WS_ERROR,
            Message::WsOpen(_) => tag::WS_OPEN,
            Message::WsMessage(_) => tag::WS_MESSAGE,
            Message::WsClose(_) => tag::WS_CLOSE,
            Message::TimersReset(_) => tag::TIMERS_RESET,
            Message::ConsoleReset(_) => tag::CONSOLE_RESET,
            Message::ConsoleTimers(_) => tag::CONSOLE_TIMERS,
            Message::ConsoleCounters(_) => tag::CONSOLE_COUNTERS,
            Message::ConsoleGroupDepth(_) => tag::CONSOLE_GROUP_DEPTH,
            Message::TestRun(_) => tag::TEST_RUN,
            Message::TestHas(_) => tag::TEST_HAS,
            Message::TestCount(_) => tag::TEST_COUNT,
            Message::TestReset(_) => tag::TEST_RESET,
            Message::PlaywrightOperation(_) => tag::PLAYWRIGHT_OPERATION,
        }
    }

    /// Stable name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::CreateRuntime(_) => "create-runtime",
            Message::CreateRuntimeResult(_) => "create-runtime-result",
            Message::Eval(_) => "eval",
            Message::DisposeRuntime(_) => "dispose-runtime",
            Message::ResponseOk(_) => "response-ok",
            Message::ResponseError(_) => "response-error",
            Message::DispatchRequest(_) => "dispatch-request",
            Message::ResponseStreamStart(_) => "response-stream-start",
            Message::ResponseStreamChunk(_) => "response-stream-chunk",
            Message::ResponseStreamEnd(_) => "response-stream-end",
            Message::StreamPull(_) => "stream-pull",
            Message::StreamPush(_) => "stream-push",
            Message::StreamClose(_) => "stream-close",
            Message::StreamError(_) => "stream-error",
            Message::CallbackInvoke(_) => "callback-invoke",
            Message::CallbackResponse(_) => "callback-response",
            Message::CallbackStreamStart(_) => "callback-stream-start",
            Message::CallbackStreamChunk(_) => "callback-stream-chunk",
            Message::CallbackStreamEnd(_) => "callback-stream-end",
            Message::CallbackStreamCancel(_) => "callback-stream-cancel",
            Message::WsCommand(_) => "ws-command",
            Message::Pong => "pong",
            Message::FetchUpgradeRequest(_) => "fetch-upgrade-request",
            Message::FetchHasServeHandler(_) => "fetch-has-serve-handler",
            Message::FetchHasActiveConnections(_) => "fetch-has-active-connections",
            Message::FetchWsError(_) => "fetch-ws-error",
            Message::WsOpen(_) => "ws-open",
            Message::WsMessage(_) => "ws-message",
            Message::WsClose(_) => "ws-close",
            Message::TimersReset(_) => "timers-reset",
            Message::ConsoleReset(_) => "console-reset",
            Message::ConsoleTimers(_) => "console-timers",
            Message::ConsoleCounters(_) => "console-counters",
            Message::ConsoleGroupDepth(_) => "console-group-depth",
            Message::TestRun(_) => "test-run",
            Message::TestHas(_) => "test-has",
            Message::TestCount(_) => "test-count",
            Message::TestReset(_) => "test-reset",
            Message::PlaywrightOperation(_) => "playwright-operation",
        }
    }
}
