// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Frame codec: 4-byte big-endian length prefix, MessagePack payload.
//!
//! The payload is a map whose `type` entry selects the message shape. The
//! decoder is a streaming consumer over arbitrary byte slices; a frame that
//! fails to decode is surfaced as an error and the connection is expected to
//! be torn down by the caller, since frame boundaries are unrecoverable past
//! a bad length prefix.

use std::io;

use bytes::{Bytes, BytesMut};
use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::warn;

use crate::msg::{tag, Message};

pub const MAX_FRAME_LEN: usize = 100_000_000;

const TYPE_KEY: &str = "type";

pub struct MessageCodec {
    inner: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        let mut inner = LengthDelimitedCodec::new();
        inner.set_max_frame_length(MAX_FRAME_LEN);
        MessageCodec { inner }
    }
}

fn invalid_data<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

fn from_value<T: DeserializeOwned>(fields: Value) -> io::Result<T> {
    rmpv::ext::from_value(fields).map_err(invalid_data)
}

/// Splits the decoded payload map into its numeric type tag and the
/// remaining fields.
fn split_tag(value: Value) -> io::Result<(u8, Value)> {
    let entries = match value {
        Value::Map(entries) => entries,
        other => {
            return Err(invalid_data(format!(
                "expected a map payload, got {other}"
            )))
        }
    };
    let mut tag = None;
    let mut fields = Vec::with_capacity(entries.len().saturating_sub(1));
    for (key, val) in entries {
        if key.as_str() == Some(TYPE_KEY) {
            tag = val.as_u64();
        } else {
            fields.push((key, val));
        }
    }
    match tag {
        Some(tag) if tag <= u8::MAX as u64 => Ok((tag as u8, Value::Map(fields))),
        Some(tag) => Err(invalid_data(format!("message type {tag} out of range"))),
        None => Err(invalid_data("payload has no message type")),
    }
}

/// Decodes one frame payload. `Ok(None)` means the frame carried an
/// unknown message type: frame boundaries are intact, so it is dropped
/// with a warning instead of poisoning the connection.
pub fn decode_message(payload: &[u8]) -> io::Result<Option<Message>> {
    let value = rmpv::decode::read_value(&mut &payload[..]).map_err(invalid_data)?;
    let (tag, fields) = split_tag(value)?;
    let message = match tag {
        tag::CREATE_RUNTIME => Message::CreateRuntime(from_value(fields)?),
        tag::CREATE_RUNTIME_RESULT => Message::CreateRuntimeResult(from_value(fields)?),
        tag::EVAL => Message::Eval(from_value(fields)?),
        tag::DISPOSE_RUNTIME => Message::DisposeRuntime(from_value(fields)?),
        tag::RESPONSE_OK => Message::ResponseOk(from_value(fields)?),
        tag::RESPONSE_ERROR => Message::ResponseError(from_value(fields)?),
        tag::DISPATCH_REQUEST => Message::DispatchRequest(from_value(fields)?),
        tag::RESPONSE_STREAM_START => Message::ResponseStreamStart(from_value(fields)?),
        tag::RESPONSE_STREAM_CHUNK => Message::ResponseStreamChunk(from_value(fields)?),
        tag::RESPONSE_STREAM_END => Message::ResponseStreamEnd(from_value(fields)?),
        tag::STREAM_PULL => Message::StreamPull(from_value(fields)?),
        tag::STREAM_PUSH => Message::StreamPush(from_value(fields)?),
        tag::STREAM_CLOSE => Message::StreamClose(from_value(fields)?),
        tag::STREAM_ERROR => Message::StreamError(from_value(fields)?),
        tag::CALLBACK_INVOKE => Message::CallbackInvoke(from_value(fields)?),
        tag::CALLBACK_RESPONSE => Message::CallbackResponse(from_value(fields)?),
        tag::CALLBACK_STREAM_START => Message::CallbackStreamStart(from_value(fields)?),
        tag::CALLBACK_STREAM_CHUNK => Message::CallbackStreamChunk(from_value(fields)?),
        tag::CALLBACK_STREAM_END => Message::CallbackStreamEnd(from_value(fields)?),
        tag::CALLBACK_STREAM_CANCEL => Message::CallbackStreamCancel(from_value(fields)?),
        tag::WS_COMMAND => Message::WsCommand(from_value(fields)?),
        tag::PONG => Message::Pong,
        tag::FETCH_UPGRADE_REQUEST => Message::FetchUpgradeRequest(from_value(fields)?),
        tag::FETCH_HAS_SERVE_HANDLER => Message::FetchHasServeHandler(from_value(fields)?),
        tag::FETCH_HAS_ACTIVE_CONNECTIONS => {
            Message::FetchHasActiveConnections(from_value(fields)?)
        }
        tag::FETCH_WS_ERROR => Message::FetchWsError(from_value(fields)?),
        tag::WS_OPEN => Message::WsOpen(from_value(fields)?),
        tag::WS_MESSAGE => Message::WsMessage(from_value(fields)?),
        tag::WS_CLOSE => Message::WsClose(from_value(fields)?),
        tag::TIMERS_RESET => Message::TimersReset(from_value(fields)?),
        tag::CONSOLE_RESET => Message::ConsoleReset(from_value(fields)?),
        tag::CONSOLE_TIMERS => Message::ConsoleTimers(from_value(fields)?),
        tag::CONSOLE_COUNTERS => Message::ConsoleCounters(from_value(fields)?),
        tag::CONSOLE_GROUP_DEPTH => Message::ConsoleGroupDepth(from_value(fields)?),
        tag::TEST_RUN => Message::TestRun(from_value(fields)?),
        tag::TEST_HAS => Message::TestHas(from_value(fields)?),
        tag::TEST_COUNT => Message::TestCount(from_value(fields)?),
        tag::TEST_RESET => Message::TestReset(from_value(fields)?),
        tag::PLAYWRIGHT_OPERATION => Message::PlaywrightOperation(from_value(fields)?),
        other => {
            warn!(tag = other, "dropping message with unknown type");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn to_fields<T: serde::Serialize>(payload: &T) -> io::Result<Value> {
    rmpv::ext::to_value(payload).map_err(invalid_data)
}

pub fn encode_message(message: &Message) -> io::Result<Vec<u8>> {
    let fields = match message {
        Message::CreateRuntime(m) => to_fields(m)?,
        Message::CreateRuntimeResult(m) => to_fields(m)?,
        Message::Eval(m) => to_fields(m)?,
        Message::DisposeRuntime(m) => to_fields(m)?,
        Message::ResponseOk(m) => to_fields(m)?,
        Message::ResponseError(m) => to_fields(m)?,
        Message::DispatchRequest(m) => to_fields(m)?,
        Message::ResponseStreamStart(m) => to_fields(m)?,
        Message::ResponseStreamChunk(m) => to_fields(m)?,
        Message::ResponseStreamEnd(m) => to_fields(m)?,
        Message::StreamPull(m) => to_fields(m)?,
        Message::StreamPush(m) => to_fields(m)?,
        Message::StreamClose(m) => to_fields(m)?,
        Message::StreamError(m) => to_fields(m)?,
        Message::CallbackInvoke(m) => to_fields(m)?,
        Message::CallbackResponse(m) => to_fields(m)?,
        Message::CallbackStreamStart(m) => to_fields(m)?,
        Message::CallbackStreamChunk(m) => to_fields(m)?,
        Message::CallbackStreamEnd(m) => to_fields(m)?,
        Message::CallbackStreamCancel(m) => to_fields(m)?,
        Message::WsCommand(m) => to_fields(m)?,
        Message::Pong => Value::Map(Vec::new()),
        Message::FetchUpgradeRequest(m) => to_fields(m)?,
        Message::FetchHasServeHandler(m) => to_fields(m)?,
        Message::FetchHasActiveConnections(m) => to_fields(m)?,
        Message::FetchWsError(m) => to_fields(m)?,
        Message::WsOpen(m) => to_fields(m)?,
        Message::WsMessage(m) => to_fields(m)?,
        Message::WsClose(m) => to_fields(m)?,
        Message::TimersReset(m) => to_fields(m)?,
        Message::ConsoleReset(m) => to_fields(m)?,
        Message::ConsoleTimers(m) => to_fields(m)?,
        Message::ConsoleCounters(m) => to_fields(m)?,
        Message::ConsoleGroupDepth(m) => to_fields(m)?,
        Message::TestRun(m) => to_fields(m)?,
        Message::TestHas(m) => to_fields(m)?,
        Message::TestCount(m) => to_fields(m)?,
        Message::TestReset(m) => to_fields(m)?,
        Message::PlaywrightOperation(m) => to_fields(m)?,
    };
    let mut entries = match fields {
        Value::Map(entries) => entries,
        other => {
            return Err(invalid_data(format!(
                "message body must encode to a map, got {other}"
            )))
        }
    };
    entries.insert(
        0,
        (Value::from(TYPE_KEY), Value::from(message.tag() as u64)),
    );
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &Value::Map(entries)).map_err(invalid_data)?;
    Ok(buf)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        while let Some(frame) = self.inner.decode(src)? {
            if let Some(message) = decode_message(&frame)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> io::Result<()> {
        let payload = encode_message(&item)?;
        self.inner.encode(Bytes::from(payload), dst)
    }
}
