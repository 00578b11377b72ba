// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound dispatch: one frame in, one state transition out. Responses
//! fulfil pending requests, callback invocations spawn host code, stream
//! frames mutate the stream engine, pushes fan out to subscribers.

use std::sync::Arc;

use bytes::Bytes;
use datadog_isolate_ipc::msg::{Message, StreamError, StreamPull};
use tracing::{trace, warn};

use crate::callbacks;
use crate::connection::ConnectionCore;
use crate::error::{ClientError, RemoteError};
use crate::http::{Body, HttpResponse};
use crate::pending::RpcOutcome;
use crate::streams::download::{DownloadShared, ResponseBody};
use crate::streams::DEFAULT_STREAM_CREDIT;

pub(crate) fn dispatch(core: &Arc<ConnectionCore>, message: Message) {
    match message {
        Message::ResponseOk(m) => {
            if !core
                .pending
                .complete(m.request_id, Ok(RpcOutcome::Value(m.value)))
            {
                warn!(request_id = m.request_id, "response for unknown request");
            }
        }
        Message::ResponseError(m) => {
            let error = ClientError::Remote(RemoteError {
                name: m.name,
                message: m.message,
                stack: m.stack,
            });
            if !core.pending.complete(m.request_id, Err(error)) {
                warn!(request_id = m.request_id, "error for unknown request");
            }
        }
        Message::CreateRuntimeResult(m) => {
            let outcome = RpcOutcome::RuntimeCreated {
                runtime_id: m.runtime_id,
                reused: m.reused,
            };
            if !core.pending.complete(m.request_id, Ok(outcome)) {
                warn!(request_id = m.request_id, "runtime result for unknown request");
            }
        }
        Message::ResponseStreamStart(m) => {
            let shared = Arc::new(DownloadShared::new(m.stream_id));
            core.downloads.insert(shared.clone());
            let body = ResponseBody::new(
                shared,
                core.downloads.clone(),
                core.outbound.clone(),
            );
            let response = HttpResponse {
                status: m.status,
                status_text: m.status_text,
                headers: m.headers,
                body: Body::Download(body),
            };
            if core
                .pending
                .complete(m.request_id, Ok(RpcOutcome::Stream(response)))
            {
                // initial grant; pulls replenish it as the consumer reads
                core.outbound.send_or_warn(Message::StreamPull(StreamPull {
                    stream_id: m.stream_id,
                    amount: DEFAULT_STREAM_CREDIT,
                }));
            } else {
                warn!(
                    request_id = m.request_id,
                    stream_id = m.stream_id,
                    "stream start for unknown request"
                );
                core.downloads.remove(m.stream_id);
                core.outbound
                    .send_or_warn(Message::StreamError(StreamError {
                        stream_id: m.stream_id,
                        message: "cancelled by consumer".into(),
                    }));
            }
        }
        Message::ResponseStreamChunk(m) => match core.downloads.get(m.stream_id) {
            Some(download) => download.push_chunk(Bytes::from(m.bytes.into_vec())),
            None => warn!(stream_id = m.stream_id, "chunk for unknown stream"),
        },
        Message::ResponseStreamEnd(m) => match core.downloads.remove(m.stream_id) {
            Some(download) => download.finish(),
            None => warn!(stream_id = m.stream_id, "end for unknown stream"),
        },
        Message::StreamPull(m) => match core.uploads.get(m.stream_id) {
            Some(upload) => upload.grant(m.amount),
            None => warn!(stream_id = m.stream_id, "credit for unknown stream"),
        },
        Message::StreamClose(m) => match core.uploads.remove(m.stream_id) {
            Some(upload) => upload.close(),
            None => warn!(stream_id = m.stream_id, "close for unknown stream"),
        },
        Message::StreamError(m) => {
            if let Some(download) = core.downloads.remove(m.stream_id) {
                download.fail(ClientError::Stream(m.message));
            } else if let Some(upload) = core.uploads.remove(m.stream_id) {
                upload.close();
            } else if !core.abort_callback_stream(m.stream_id) {
                warn!(stream_id = m.stream_id, "error for unknown stream");
            }
        }
        Message::CallbackInvoke(m) => {
            // host code must not stall the dispatch path
            tokio::spawn(callbacks::dispatch_invoke(core.clone(), m));
        }
        Message::CallbackStreamCancel(m) => {
            if !core.abort_callback_stream(m.stream_id) {
                warn!(stream_id = m.stream_id, "cancel for unknown callback stream");
            }
        }
        Message::WsCommand(m) => {
            core.ws_router.publish(m.runtime_id, m.command.into());
        }
        Message::Pong => trace!("pong"),
        other => {
            warn!(message = other.name(), "unexpected inbound message");
        }
    }
}
