// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod support;

use std::sync::Arc;

use datadog_isolate_client::{
    host_fn, RuntimeConfig, TestEnvironment, Value,
};
use datadog_isolate_ipc::msg::{Message, ResponseOk};

#[tokio::test]
async fn console_and_timers_expose_isolate_state() {
    let (connection, mut daemon) = support::start().await;
    let (runtime, _) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    let counters = {
        let console = runtime.console();
        tokio::spawn(async move { console.counters().await })
    };
    let request_id = match daemon.recv().await {
        Message::ConsoleCounters(m) => {
            assert_eq!(m.runtime_id, 1);
            m.request_id
        }
        other => panic!("expected console-counters, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Map(vec![
                (rmpv::Value::from("clicks"), rmpv::Value::from(3u64)),
                (rmpv::Value::from("loads"), rmpv::Value::from(1u64)),
            ]),
        }))
        .await;
    let counters = counters.await.unwrap().unwrap();
    assert_eq!(counters["clicks"], 3);
    assert_eq!(counters["loads"], 1);

    let depth = {
        let console = runtime.console();
        tokio::spawn(async move { console.group_depth().await })
    };
    let request_id = match daemon.recv().await {
        Message::ConsoleGroupDepth(m) => m.request_id,
        other => panic!("expected console-group-depth, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::from(2u64),
        }))
        .await;
    assert_eq!(depth.await.unwrap().unwrap(), 2);

    let reset = {
        let timers = runtime.timers();
        tokio::spawn(async move { timers.reset().await })
    };
    let request_id = match daemon.recv().await {
        Message::TimersReset(m) => m.request_id,
        other => panic!("expected timers-reset, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;
    reset.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_environment_runs_when_enabled() {
    let (connection, mut daemon) = support::start().await;
    let config = RuntimeConfig {
        test_environment: TestEnvironment::Enabled,
        ..RuntimeConfig::default()
    };
    let (runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    assert!(request.options.test_environment.is_some());

    let run = {
        let tests = runtime.test_environment();
        tokio::spawn(async move { tests.run(Some("parser".into())).await })
    };
    let request_id = match daemon.recv().await {
        Message::TestRun(m) => {
            assert_eq!(m.filter.as_deref(), Some("parser"));
            m.request_id
        }
        other => panic!("expected test-run, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Map(vec![
                (rmpv::Value::from("passed"), rmpv::Value::from(12u64)),
                (rmpv::Value::from("failed"), rmpv::Value::from(1u64)),
                (rmpv::Value::from("skipped"), rmpv::Value::from(2u64)),
            ]),
        }))
        .await;
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.passed, 12);
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn playwright_operations_marshal_their_arguments() {
    let (connection, mut daemon) = support::start().await;
    let attach_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let detach_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let config = RuntimeConfig {
        playwright: Some(datadog_isolate_client::PlaywrightConfig {
            handler: host_fn(|_args| async { Ok(Value::Undefined) }),
            on_attach: Some({
                let attach_count = attach_count.clone();
                Arc::new(move |_runtime_id| {
                    attach_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }),
            on_detach: Some({
                let detach_count = detach_count.clone();
                Arc::new(move |_runtime_id| {
                    detach_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            }),
        }),
        ..RuntimeConfig::default()
    };
    let (runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    assert!(request.options.callbacks.playwright.is_some());
    assert_eq!(attach_count.load(std::sync::atomic::Ordering::SeqCst), 1);

    let operation = {
        let playwright = runtime.playwright();
        tokio::spawn(async move {
            playwright
                .operation(
                    "page.on",
                    vec![
                        Value::String("console".into()),
                        Value::Function(host_fn(|_args| async { Ok(Value::Undefined) })),
                    ],
                )
                .await
        })
    };
    let request_id = match daemon.recv().await {
        Message::PlaywrightOperation(m) => {
            assert_eq!(m.operation, "page.on");
            assert_eq!(m.args[0].as_str(), Some("console"));
            // the function argument crossed as a reference
            match &m.args[1] {
                rmpv::Value::Map(entries) => {
                    assert!(entries
                        .iter()
                        .any(|(k, v)| k.as_str() == Some("$type")
                            && v.as_str() == Some("function")));
                }
                other => panic!("expected a function reference, got {other:?}"),
            }
            m.request_id
        }
        other => panic!("expected playwright-operation, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::from("ok"),
        }))
        .await;
    let result = operation.await.unwrap().unwrap();
    assert_eq!(result.as_str(), Some("ok"));

    // disposal detaches the page listeners
    let dispose = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.dispose().await })
    };
    let request_id = match daemon.recv().await {
        Message::DisposeRuntime(m) => m.request_id,
        other => panic!("expected dispose-runtime, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Nil,
        }))
        .await;
    dispose.await.unwrap().unwrap();
    assert_eq!(detach_count.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fetch_queries_decode_boolean_results() {
    let (connection, mut daemon) = support::start().await;
    let (runtime, _) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    let has = {
        let fetch = runtime.fetch();
        tokio::spawn(async move { fetch.has_serve_handler().await })
    };
    let request_id = match daemon.recv().await {
        Message::FetchHasServeHandler(m) => m.request_id,
        other => panic!("expected fetch-has-serve-handler, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Boolean(true),
        }))
        .await;
    assert!(has.await.unwrap().unwrap());

    let active = {
        let fetch = runtime.fetch();
        tokio::spawn(async move { fetch.has_active_connections().await })
    };
    let request_id = match daemon.recv().await {
        Message::FetchHasActiveConnections(m) => m.request_id,
        other => panic!("expected fetch-has-active-connections, got {other:?}"),
    };
    daemon
        .send(Message::ResponseOk(ResponseOk {
            request_id,
            value: rmpv::Value::Boolean(false),
        }))
        .await;
    assert!(!active.await.unwrap().unwrap());
}
