// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

use datadog_isolate_ipc::msg::WireError;

/// Error raised by the daemon and surfaced from a `response-error` frame.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl From<WireError> for RemoteError {
    fn from(e: WireError) -> Self {
        RemoteError {
            name: e.name,
            message: e.message,
            stack: e.stack,
        }
    }
}

/// Everything a client call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The connection is gone; all outstanding work is rejected with this.
    #[error("connection closed")]
    ConnectionClosed,
    /// The per-request timeout expired before a response arrived.
    #[error("request timed out")]
    Timeout,
    /// A frame or payload violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A body stream terminated abnormally.
    #[error("stream error: {0}")]
    Stream(String),
    /// The daemon rejected the request.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A façade method needs a feature that was not enabled at creation.
    #[error("configuration error: {0}")]
    Configuration(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by host callbacks; serialized into the error fields of a
/// `callback-response` frame.
#[derive(Clone, Debug)]
pub struct CallbackError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl CallbackError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        CallbackError {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub(crate) fn into_wire(self) -> WireError {
        WireError {
            name: self.name,
            message: self.message,
            stack: self.stack,
        }
    }
}

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for CallbackError {}

impl From<anyhow::Error> for CallbackError {
    fn from(e: anyhow::Error) -> Self {
        CallbackError::new("Error", format!("{e:#}"))
    }
}

impl From<&str> for CallbackError {
    fn from(message: &str) -> Self {
        CallbackError::new("Error", message)
    }
}

impl From<String> for CallbackError {
    fn from(message: String) -> Self {
        CallbackError::new("Error", message)
    }
}
