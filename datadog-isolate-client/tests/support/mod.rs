// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted daemon for integration tests: the real client connects over a
//! unix socket, the test drives the daemon half frame by frame.

// not every test binary uses the whole harness
#![allow(dead_code)]

use std::time::Duration;

use datadog_isolate_client::{connect, ConnectConfig, IsolateConnection, Runtime, RuntimeConfig};
use datadog_isolate_ipc::msg::{CreateRuntime, CreateRuntimeResult, Message};
use datadog_isolate_ipc::platform::Channel;
use datadog_isolate_ipc::transport::Transport;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixListener;

pub struct MockDaemon {
    transport: Transport,
    _dir: tempfile::TempDir,
}

pub async fn start() -> (IsolateConnection, MockDaemon) {
    start_with_timeout(Duration::from_secs(5)).await
}

pub async fn start_with_timeout(request_timeout: Duration) -> (IsolateConnection, MockDaemon) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("isolate.sock");
    let listener = UnixListener::bind(&path).expect("bind");
    let accept = tokio::spawn(async move { listener.accept().await.expect("accept").0 });

    let connection = connect(ConnectConfig::unix(&path).request_timeout(request_timeout))
        .await
        .expect("connect");
    let stream = accept.await.expect("join");
    (
        connection,
        MockDaemon {
            transport: Transport::from(Channel::from(stream)),
            _dir: dir,
        },
    )
}

impl MockDaemon {
    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.transport.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the connection")
            .expect("frame decode")
    }

    /// Receives a frame if one arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        match tokio::time::timeout(wait, self.transport.next()).await {
            Ok(Some(Ok(message))) => Some(message),
            _ => None,
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.transport.send(message).await.expect("send frame");
    }

    /// Serves one create-runtime handshake and returns the built handle
    /// together with the request the client sent.
    pub async fn serve_create_runtime(
        &mut self,
        connection: &IsolateConnection,
        config: RuntimeConfig,
        runtime_id: u64,
    ) -> (Runtime, CreateRuntime) {
        let client = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.create_runtime(config).await })
        };
        let request = match self.recv().await {
            Message::CreateRuntime(request) => request,
            other => panic!("expected create-runtime, got {other:?}"),
        };
        self.send(Message::CreateRuntimeResult(CreateRuntimeResult {
            request_id: request.request_id,
            runtime_id,
            reused: false,
        }))
        .await;
        let runtime = client.await.expect("join").expect("create runtime");
        (runtime, request)
    }

    /// Drops the daemon half, closing the socket.
    pub fn close(self) {}
}
