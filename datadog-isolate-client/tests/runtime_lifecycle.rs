// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod support;

use std::collections::HashSet;
use std::time::Duration;

use datadog_isolate_client::{ClientError, EvalOptions, RuntimeConfig, Value};
use datadog_isolate_ipc::msg::{Message, ResponseError, ResponseOk};

#[tokio::test]
async fn creates_evaluates_and_disposes_a_runtime() {
    let (connection, mut daemon) = support::start().await;

    let mut config = RuntimeConfig {
        memory_limit_mb: Some(128),
        ..RuntimeConfig::default()
    };
    config.console = Some(datadog_isolate_client::host_fn(|_args| async {
        Ok(Value::Undefined)
    }));
    let (runtime, request) = daemon.serve_create_runtime(&connection, config, 42).await;

    assert_eq!(request.options.memory_limit_mb, Some(128));
    assert!(request.options.callbacks.console.is_some());
    assert_eq!(runtime.runtime_id(), 42);
    assert!(!runtime.was_reused());

    let eval = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .eval(
                    "export default 1",
                    EvalOptions {
                        filename: Some("main.ts".into()),
                        max_duration: Some(Duration::from_secs(2)),
                    },
                )
                .await
        })
    };
    let request_id = match daemon.recv().await {
        Message::Eval(m) => {
            assert_eq!(m.runtime_id, 42);
            assert_eq!(m.source, "export default 1");
            assert_eq!(m.filename.as_deref(), Some("main.ts"));
            assert_eq!(m.max_duration_ms, Some(2_000));
            m.request_id
        }
        other => panic!("expected eval, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;
    eval.await.unwrap().unwrap();

    let dispose = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.dispose().await })
    };
    let request_id = match daemon.recv().await {
        Message::DisposeRuntime(m) => {
            assert_eq!(m.runtime_id, 42);
            m.request_id
        }
        other => panic!("expected dispose-runtime, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;
    dispose.await.unwrap().unwrap();

    connection.close();
}

#[tokio::test]
async fn namespace_creation_passes_the_namespace_through() {
    let (connection, mut daemon) = support::start().await;

    let client = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .create_namespace("workers", RuntimeConfig::default())
                .await
        })
    };
    let request = match daemon.recv().await {
        Message::CreateRuntime(request) => request,
        other => panic!("expected create-runtime, got {other:?}"),
    };
    assert_eq!(request.options.namespace.as_deref(), Some("workers"));
    daemon
        .send(Message::CreateRuntimeResult(
            datadog_isolate_ipc::msg::CreateRuntimeResult {
                request_id: request.request_id,
                runtime_id: 7,
                reused: true,
            },
        ))
        .await;
    let runtime = client.await.unwrap().unwrap();
    assert!(runtime.was_reused());
}

#[tokio::test]
async fn remote_errors_carry_name_message_and_stack() {
    let (connection, mut daemon) = support::start().await;
    let (runtime, _) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    let eval = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.eval("throw 1", EvalOptions::default()).await })
    };
    let request_id = match daemon.recv().await {
        Message::Eval(m) => m.request_id,
        other => panic!("expected eval, got {other:?}"),
    };
    daemon
        .send(Message::ResponseError(ResponseError {
            request_id,
            name: "SyntaxError".into(),
            message: "unexpected token".into(),
            stack: Some("at main.ts:1".into()),
        }))
        .await;
    match eval.await.unwrap() {
        Err(ClientError::Remote(e)) => {
            assert_eq!(e.name, "SyntaxError");
            assert_eq!(e.message, "unexpected token");
            assert_eq!(e.stack.as_deref(), Some("at main.ts:1"));
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn requests_time_out_and_late_responses_are_dropped() {
    let (connection, mut daemon) = support::start_with_timeout(Duration::from_millis(200)).await;
    let (runtime, _) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    let eval = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.eval("1", EvalOptions::default()).await })
    };
    let request_id = match daemon.recv().await {
        Message::Eval(m) => m.request_id,
        other => panic!("expected eval, got {other:?}"),
    };
    match eval.await.unwrap() {
        Err(ClientError::Timeout) => {}
        other => panic!("expected a timeout, got {other:?}"),
    }

    // the late response lands on an empty pending map and is discarded
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;

    // the connection stays usable afterwards
    let eval = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.eval("2", EvalOptions::default()).await })
    };
    let request_id = match daemon.recv().await {
        Message::Eval(m) => m.request_id,
        other => panic!("expected eval, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;
    eval.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_environment_methods_require_the_flag() {
    let (connection, mut daemon) = support::start().await;
    let (runtime, request) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;
    assert!(request.options.test_environment.is_none());

    match runtime.test_environment().run(None).await {
        Err(ClientError::Configuration(_)) => {}
        other => panic!("expected a configuration error, got {other:?}"),
    }
    match runtime.test_environment().test_count().await {
        Err(ClientError::Configuration(_)) => {}
        other => panic!("expected a configuration error, got {other:?}"),
    }
    // nothing went on the wire for either call
    assert!(daemon.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn request_ids_are_never_reused() {
    let (connection, mut daemon) = support::start().await;
    let (runtime, create) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    let mut seen = HashSet::new();
    assert!(seen.insert(create.request_id));
    for i in 0..10 {
        let eval = {
            let runtime = runtime.clone();
            tokio::spawn(async move {
                runtime
                    .eval(&format!("export default {i}"), EvalOptions::default())
                    .await
            })
        };
        let request_id = match daemon.recv().await {
            Message::Eval(m) => m.request_id,
            other => panic!("expected eval, got {other:?}"),
        };
        assert!(seen.insert(request_id), "request id {request_id} reused");
        daemon
            .send(Message::ResponseOk(ResponseOk {
                request_id,
                value: rmpv::Value::Nil,
            }))
            .await;
        eval.await.unwrap().unwrap();
    }
}
