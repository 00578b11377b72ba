// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fetch submodule: dispatching HTTP-shaped requests at the isolate's
//! serve handler, WebSocket upgrade/dispatch, and connection queries.

use std::sync::Arc;

use datadog_isolate_ipc::msg::{
    DispatchRequest, FetchHasActiveConnections, FetchHasServeHandler, FetchUpgradeRequest,
    FetchWsError, Message, WireRequest, WireResponse, WsClose, WsMessage, WsOpen,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_bytes::ByteBuf;

use crate::config::DispatchOptions;
use crate::connection::ConnectionCore;
use crate::error::ClientError;
use crate::http::{Body, HttpRequest, HttpResponse};
use crate::pending::RpcOutcome;
use crate::runtime::RuntimeInner;
use crate::streams::upload::{pump_upload, ByteStream, UploadShared};
use crate::streams::BODY_STREAM_THRESHOLD;
use crate::websocket::WsPayload;

/// Result of a WebSocket upgrade dispatch; the connection id keys all
/// subsequent open/message/close dispatches and pushed commands.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct UpgradeResult {
    pub connection_id: u64,
}

fn decode<T: serde::de::DeserializeOwned>(value: rmpv::Value) -> Result<T, ClientError> {
    rmpv::ext::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
}

struct BodyPlan {
    inline: Option<ByteBuf>,
    stream_id: Option<u64>,
    size: Option<u64>,
    upload: Option<(Arc<UploadShared>, ByteStream)>,
}

/// Inlines small sized bodies; assigns an upload stream to large or
/// size-unknown ones.
fn plan_body(core: &ConnectionCore, body: Body) -> BodyPlan {
    match body {
        Body::Empty => BodyPlan {
            inline: None,
            stream_id: None,
            size: None,
            upload: None,
        },
        Body::Bytes(bytes) if (bytes.len() as u64) < BODY_STREAM_THRESHOLD => BodyPlan {
            inline: Some(ByteBuf::from(bytes.to_vec())),
            stream_id: None,
            size: None,
            upload: None,
        },
        Body::Bytes(bytes) => {
            let stream_id = core.ids.next_stream();
            let size = bytes.len() as u64;
            BodyPlan {
                inline: None,
                stream_id: Some(stream_id),
                size: Some(size),
                upload: Some((
                    Arc::new(UploadShared::new(stream_id)),
                    futures::stream::iter([Ok(bytes)]).boxed(),
                )),
            }
        }
        Body::Stream { stream, size } => {
            let stream_id = core.ids.next_stream();
            BodyPlan {
                inline: None,
                stream_id: Some(stream_id),
                size,
                upload: Some((Arc::new(UploadShared::new(stream_id)), stream)),
            }
        }
        Body::Download(body) => {
            let stream_id = core.ids.next_stream();
            BodyPlan {
                inline: None,
                stream_id: Some(stream_id),
                size: None,
                upload: Some((Arc::new(UploadShared::new(stream_id)), body.boxed())),
            }
        }
    }
}

#[derive(Clone)]
pub struct FetchHandle {
    inner: Arc<RuntimeInner>,
}

impl FetchHandle {
    pub(crate) fn new(inner: Arc<RuntimeInner>) -> Self {
        FetchHandle { inner }
    }

    /// Dispatches a request at the isolate's serve handler. The response
    /// is buffered or streaming at the daemon's discretion; either way the
    /// returned body reads as one ordered byte sequence.
    pub async fn dispatch(
        &self,
        request: HttpRequest,
        options: DispatchOptions,
    ) -> Result<HttpResponse, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let timeout = options.timeout.unwrap_or(core.request_timeout);

        let plan = plan_body(core, request.body);
        let wire = WireRequest {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: plan.inline,
            body_stream_id: plan.stream_id,
            body_size: plan.size,
        };
        let message = Message::DispatchRequest(DispatchRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
            request: wire,
            timeout_ms: options.timeout.map(|d| d.as_millis() as u64),
        });

        // the session must exist before the daemon can grant credit
        if let Some((shared, _)) = &plan.upload {
            core.uploads.insert(shared.clone());
        }
        let rx = match core.start_request(request_id, message) {
            Ok(rx) => rx,
            Err(e) => {
                if let Some(stream_id) = plan.stream_id {
                    core.uploads.remove(stream_id);
                }
                return Err(e);
            }
        };
        if let Some((shared, stream)) = plan.upload {
            tokio::spawn(pump_upload(
                core.outbound.clone(),
                core.uploads.clone(),
                shared,
                stream,
            ));
        }

        match core.await_response(request_id, rx, timeout).await? {
            RpcOutcome::Value(value) => {
                let wire: WireResponse = decode(value)?;
                Ok(HttpResponse::from_wire(wire))
            }
            RpcOutcome::Stream(response) => Ok(response),
            other => Err(ClientError::Protocol(format!(
                "unexpected dispatch response {other:?}"
            ))),
        }
    }

    /// Dispatches a WebSocket upgrade request at the serve handler.
    pub async fn upgrade(&self, request: HttpRequest) -> Result<UpgradeResult, ClientError> {
        let core = &self.inner.core;
        let body = match request.body {
            Body::Empty => None,
            Body::Bytes(bytes) => Some(ByteBuf::from(bytes.to_vec())),
            _ => {
                return Err(ClientError::Protocol(
                    "an upgrade request cannot carry a streaming body".into(),
                ))
            }
        };
        let request_id = core.ids.next_request();
        let message = Message::FetchUpgradeRequest(FetchUpgradeRequest {
            request_id,
            runtime_id: self.inner.runtime_id,
            request: WireRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body,
                body_stream_id: None,
                body_size: None,
            },
        });
        let value = core
            .request_value(request_id, message, core.request_timeout)
            .await?;
        decode(value)
    }

    /// Tells the isolate an upgraded connection is open.
    pub async fn ws_open(&self, connection_id: u64) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::WsOpen(WsOpen {
            request_id,
            runtime_id: self.inner.runtime_id,
            connection_id,
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }

    /// Delivers a client-side WebSocket message into the isolate.
    pub async fn ws_message(
        &self,
        connection_id: u64,
        payload: WsPayload,
    ) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::WsMessage(WsMessage {
            request_id,
            runtime_id: self.inner.runtime_id,
            connection_id,
            data: payload.into(),
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }

    pub async fn ws_close(
        &self,
        connection_id: u64,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::WsClose(WsClose {
            request_id,
            runtime_id: self.inner.runtime_id,
            connection_id,
            code,
            reason,
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }

    /// Reports a host-side WebSocket error into the isolate.
    pub async fn ws_error(
        &self,
        connection_id: u64,
        message: impl Into<String>,
    ) -> Result<(), ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::FetchWsError(FetchWsError {
            request_id,
            runtime_id: self.inner.runtime_id,
            connection_id,
            message: message.into(),
        });
        core.request_value(request_id, message, core.request_timeout)
            .await?;
        Ok(())
    }

    pub async fn has_serve_handler(&self) -> Result<bool, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::FetchHasServeHandler(FetchHasServeHandler {
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

    pub async fn has_active_connections(&self) -> Result<bool, ClientError> {
        let core = &self.inner.core;
        let request_id = core.ids.next_request();
        let message = Message::FetchHasActiveConnections(FetchHasActiveConnections {
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
}
