// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP-shaped request/response values exchanged with isolates. These are
//! virtual: they never touch a real network, they are dispatched into (or
//! produced by) isolate code inside the daemon.

use bytes::{Bytes, BytesMut};
use datadog_isolate_ipc::msg::WireResponse;
use futures::StreamExt;

use crate::error::ClientError;
use crate::streams::download::ResponseBody;
use crate::streams::upload::ByteStream;

pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        HttpRequest {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            status_text: String::new(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    pub(crate) fn from_wire(wire: WireResponse) -> Self {
        HttpResponse {
            status: wire.status,
            status_text: wire.status_text,
            headers: wire.headers,
            body: match wire.body {
                Some(bytes) => Body::Bytes(Bytes::from(bytes.into_vec())),
                None => Body::Empty,
            },
        }
    }
}

/// A request or response body. `Stream` is a host-supplied source pumped
/// daemon-ward; `Download` is a daemon stream read client-side.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: ByteStream,
        size: Option<u64>,
    },
    Download(ResponseBody),
}

impl Body {
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Body::Bytes(bytes.into())
    }

    pub fn stream(stream: ByteStream, size: Option<u64>) -> Self {
        Body::Stream { stream, size }
    }

    /// Known size in bytes, if any.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Stream { size, .. } => *size,
            Body::Download(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Streamed bodies keep their chunk boundaries; buffered bodies arrive
    /// as a single chunk.
    pub fn into_stream(self) -> ByteStream {
        match self {
            Body::Empty => futures::stream::empty().boxed(),
            Body::Bytes(bytes) => futures::stream::iter([Ok(bytes)]).boxed(),
            Body::Stream { stream, .. } => stream,
            Body::Download(body) => body.boxed(),
        }
    }

    /// Drains the body into one buffer.
    pub async fn collect(self) -> Result<Bytes, ClientError> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes),
            other => {
                let mut stream = other.into_stream();
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Stream { size, .. } => write!(f, "Body::Stream(size {size:?})"),
            Body::Download(body) => write!(f, "Body::Download(stream {})", body.stream_id()),
        }
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}
