// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use datadog_isolate_ipc::msg::Message;
use tokio::sync::mpsc;

use crate::error::ClientError;

/// Handle to the single outbound writer task. Every frame the connection
/// emits goes through here, which keeps writes per-frame atomic: the writer
/// owns the sink half of the framed transport and nothing else touches it.
///
/// Outbound volume is bounded by credit (chunks) and by callers (requests),
/// so the channel does not need its own backpressure.
#[derive(Clone)]
pub(crate) struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl Outbound {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Outbound {
            tx,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Flips the connected flag; returns false if it was already down.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn send(&self, message: Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::ConnectionClosed);
        }
        self.tx
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Send variant for paths that only log on a dead connection.
    pub(crate) fn send_or_warn(&self, message: Message) {
        if let Err(e) = self.send(message) {
            tracing::debug!("dropping outbound frame, {e}");
        }
    }
}
