// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use datadog_isolate_client::{
    host_fn, Body, CallbackError, FunctionSpec, HttpResponse, IteratorFactory, ModuleLoader,
    RuntimeConfig, Value,
};
use datadog_isolate_ipc::msg::{CallbackInvoke, Message};
use futures::{FutureExt, StreamExt};

fn map_get<'a>(value: &'a rmpv::Value, key: &str) -> Option<&'a rmpv::Value> {
    match value {
        rmpv::Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v),
        _ => None,
    }
}

fn invoke(request_id: u64, callback_id: u64, args: Vec<rmpv::Value>) -> Message {
    Message::CallbackInvoke(CallbackInvoke {
        request_id,
        callback_id,
        args,
    })
}

#[tokio::test]
async fn custom_functions_are_invoked_and_answered() {
    let (connection, mut daemon) = support::start().await;
    let mut config = RuntimeConfig::default();
    config.functions.insert(
        "add".into(),
        FunctionSpec::Function(host_fn(|args| async move {
            let a = args[0].as_i64().ok_or("not a number")?;
            let b = args[1].as_i64().ok_or("not a number")?;
            Ok(Value::Int(a + b))
        })),
    );
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let add_id = request.options.callbacks.functions["add"];

    daemon
        .send(invoke(501, add_id, vec![rmpv::Value::from(20), rmpv::Value::from(22)]))
        .await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            assert_eq!(m.request_id, 501);
            assert!(m.error.is_none());
            assert_eq!(m.value.unwrap().as_i64(), Some(42));
        }
        other => panic!("expected callback-response, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_callback_ids_answer_with_an_error() {
    let (connection, mut daemon) = support::start().await;
    let (_runtime, _) = daemon
        .serve_create_runtime(&connection, RuntimeConfig::default(), 1)
        .await;

    daemon.send(invoke(502, 9999, vec![])).await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            assert_eq!(m.request_id, 502);
            let error = m.error.expect("error fields");
            assert!(error.message.contains("unknown callback"));
        }
        other => panic!("expected callback-response, got {other:?}"),
    }
}

#[tokio::test]
async fn callback_failures_travel_back_as_structured_errors() {
    let (connection, mut daemon) = support::start().await;
    let mut config = RuntimeConfig::default();
    config.functions.insert(
        "boom".into(),
        FunctionSpec::Function(host_fn(|_args| async {
            Err(CallbackError::new("RangeError", "out of range"))
        })),
    );
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let boom_id = request.options.callbacks.functions["boom"];

    daemon.send(invoke(503, boom_id, vec![])).await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            let error = m.error.expect("error fields");
            assert_eq!(error.name, "RangeError");
            assert_eq!(error.message, "out of range");
        }
        other => panic!("expected callback-response, got {other:?}"),
    }
}

#[tokio::test]
async fn returned_functions_stay_callable() {
    let (connection, mut daemon) = support::start().await;
    let mut config = RuntimeConfig::default();
    config.functions.insert(
        "make_counter".into(),
        FunctionSpec::Function(host_fn(|_args| async {
            let count = Arc::new(AtomicUsize::new(0));
            Ok(Value::Function(host_fn(move |_args| {
                let count = count.clone();
                async move { Ok(Value::Int(count.fetch_add(1, Ordering::SeqCst) as i64 + 1)) }
            })))
        })),
    );
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let make_id = request.options.callbacks.functions["make_counter"];

    daemon.send(invoke(510, make_id, vec![])).await;
    let counter_id = match daemon.recv().await {
        Message::CallbackResponse(m) => {
            let value = m.value.expect("value");
            assert_eq!(
                map_get(&value, "$type").and_then(rmpv::Value::as_str),
                Some("function")
            );
            map_get(&value, "callback_id")
                .and_then(rmpv::Value::as_u64)
                .expect("callback id")
        }
        other => panic!("expected callback-response, got {other:?}"),
    };

    for expected in 1..=3i64 {
        daemon.send(invoke(510 + expected as u64, counter_id, vec![])).await;
        match daemon.recv().await {
            Message::CallbackResponse(m) => {
                assert_eq!(m.value.unwrap().as_i64(), Some(expected));
            }
            other => panic!("expected callback-response, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn returned_promises_resolve_once_then_evict() {
    let (connection, mut daemon) = support::start().await;
    let mut config = RuntimeConfig::default();
    config.functions.insert(
        "deferred".into(),
        FunctionSpec::Function(host_fn(|_args| async {
            Ok(Value::Promise(Box::pin(async {
                Ok(Value::String("ready".into()))
            })))
        })),
    );
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let deferred_id = request.options.callbacks.functions["deferred"];

    daemon.send(invoke(520, deferred_id, vec![])).await;
    let resolve_id = match daemon.recv().await {
        Message::CallbackResponse(m) => {
            let value = m.value.expect("value");
            assert_eq!(
                map_get(&value, "$type").and_then(rmpv::Value::as_str),
                Some("promise")
            );
            assert!(map_get(&value, "promise_id").is_some());
            map_get(&value, "resolve_callback_id")
                .and_then(rmpv::Value::as_u64)
                .expect("resolve callback id")
        }
        other => panic!("expected callback-response, got {other:?}"),
    };

    daemon.send(invoke(521, resolve_id, vec![])).await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            assert_eq!(m.value.unwrap().as_str(), Some("ready"));
        }
        other => panic!("expected callback-response, got {other:?}"),
    }

    // resolved exactly once; the registry entry is gone
    daemon.send(invoke(522, resolve_id, vec![])).await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            assert!(m.error.is_some());
        }
        other => panic!("expected callback-response, got {other:?}"),
    }
}

#[tokio::test]
async fn async_iterator_functions_yield_in_order_then_evict() {
    let (connection, mut daemon) = support::start().await;
    let factory: IteratorFactory = Arc::new(|_args| {
        futures::stream::iter((0..3i64).map(|i| Ok(Value::Int(i)))).boxed()
    });
    let mut config = RuntimeConfig::default();
    config
        .functions
        .insert("gen".into(), FunctionSpec::AsyncIterator(factory));
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let start_id = request.options.callbacks.functions["gen:start"];
    let next_id = request.options.callbacks.functions["gen:next"];
    assert!(request.options.callbacks.functions.contains_key("gen:return"));
    assert!(request.options.callbacks.functions.contains_key("gen:throw"));

    daemon.send(invoke(530, start_id, vec![])).await;
    let iterator_id = match daemon.recv().await {
        Message::CallbackResponse(m) => m.value.unwrap().as_u64().expect("iterator id"),
        other => panic!("expected callback-response, got {other:?}"),
    };

    for expected in 0..3i64 {
        daemon
            .send(invoke(
                531 + expected as u64,
                next_id,
                vec![rmpv::Value::from(iterator_id)],
            ))
            .await;
        match daemon.recv().await {
            Message::CallbackResponse(m) => {
                let value = m.value.expect("step value");
                assert_eq!(
                    map_get(&value, "done").and_then(rmpv::Value::as_bool),
                    Some(false)
                );
                assert_eq!(
                    map_get(&value, "value").and_then(rmpv::Value::as_i64),
                    Some(expected)
                );
            }
            other => panic!("expected callback-response, got {other:?}"),
        }
    }

    daemon
        .send(invoke(540, next_id, vec![rmpv::Value::from(iterator_id)]))
        .await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            let value = m.value.expect("step value");
            assert_eq!(
                map_get(&value, "done").and_then(rmpv::Value::as_bool),
                Some(true)
            );
        }
        other => panic!("expected callback-response, got {other:?}"),
    }

    // the session is evicted after done
    daemon
        .send(invoke(541, next_id, vec![rmpv::Value::from(iterator_id)]))
        .await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => assert!(m.error.is_some()),
        other => panic!("expected callback-response, got {other:?}"),
    }
}

fn wire_request(url: &str) -> rmpv::Value {
    rmpv::Value::Map(vec![
        (rmpv::Value::from("$type"), rmpv::Value::from("request")),
        (rmpv::Value::from("method"), rmpv::Value::from("GET")),
        (rmpv::Value::from("url"), rmpv::Value::from(url)),
        (rmpv::Value::from("headers"), rmpv::Value::Array(vec![])),
        (rmpv::Value::from("body"), rmpv::Value::Nil),
    ])
}

#[tokio::test]
async fn fetch_callbacks_answer_small_responses_inline() {
    let (connection, mut daemon) = support::start().await;
    let config = RuntimeConfig {
        fetch: Some(Arc::new(|request| {
            async move {
                assert_eq!(request.method, "GET");
                Ok(HttpResponse::new(200)
                    .header("x-served-by", "host")
                    .body(Body::bytes(&b"hello"[..])))
            }
            .boxed()
        })),
        ..RuntimeConfig::default()
    };
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let fetch_id = request.options.callbacks.fetch.expect("fetch id");

    daemon
        .send(invoke(550, fetch_id, vec![wire_request("http://up/")]))
        .await;
    match daemon.recv().await {
        Message::CallbackResponse(m) => {
            let value = m.value.expect("value");
            assert_eq!(
                map_get(&value, "$type").and_then(rmpv::Value::as_str),
                Some("response")
            );
            assert_eq!(
                map_get(&value, "status").and_then(rmpv::Value::as_u64),
                Some(200)
            );
            match map_get(&value, "body") {
                Some(rmpv::Value::Binary(bytes)) => assert_eq!(bytes, b"hello"),
                other => panic!("expected inline body, got {other:?}"),
            }
        }
        other => panic!("expected callback-response, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_fetch_callbacks_complete_without_a_callback_response() {
    let (connection, mut daemon) = support::start().await;
    let config = RuntimeConfig {
        fetch: Some(Arc::new(|_request| {
            async move {
                let stream: datadog_isolate_client::ByteStream = futures::stream::iter([
                    Ok(Bytes::from_static(b"part one ")),
                    Ok(Bytes::from_static(b"part two")),
                ])
                .boxed();
                Ok(HttpResponse::new(200).body(Body::stream(stream, None)))
            }
            .boxed()
        })),
        ..RuntimeConfig::default()
    };
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let fetch_id = request.options.callbacks.fetch.expect("fetch id");

    daemon
        .send(invoke(560, fetch_id, vec![wire_request("http://up/stream")]))
        .await;

    let stream_id = match daemon.recv().await {
        Message::CallbackStreamStart(m) => {
            assert_eq!(m.request_id, 560);
            assert_eq!(m.status, 200);
            m.stream_id
        }
        other => panic!("expected callback-stream-start, got {other:?}"),
    };
    let mut received = Vec::new();
    loop {
        match daemon.recv().await {
            Message::CallbackStreamChunk(m) => {
                assert_eq!(m.stream_id, stream_id);
                received.extend_from_slice(&m.bytes);
            }
            Message::CallbackStreamEnd(m) => {
                assert_eq!(m.stream_id, stream_id);
                break;
            }
            other => panic!("expected callback stream traffic, got {other:?}"),
        }
    }
    assert_eq!(received, b"part one part two");

    // no trailing callback-response for a streamed exchange
    assert!(daemon.try_recv(Duration::from_millis(150)).await.is_none());
}

#[tokio::test]
async fn daemon_cancel_stops_a_callback_body_stream() {
    let (connection, mut daemon) = support::start().await;
    let config = RuntimeConfig {
        fetch: Some(Arc::new(|_request| {
            async move {
                let stream: datadog_isolate_client::ByteStream =
                    futures::stream::unfold(0u64, |n| async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        Some((Ok(Bytes::from(vec![b'x'; 1024])), n + 1))
                    })
                    .boxed();
                Ok(HttpResponse::new(200).body(Body::stream(stream, None)))
            }
            .boxed()
        })),
        ..RuntimeConfig::default()
    };
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let fetch_id = request.options.callbacks.fetch.expect("fetch id");

    daemon
        .send(invoke(570, fetch_id, vec![wire_request("http://up/endless")]))
        .await;
    let stream_id = match daemon.recv().await {
        Message::CallbackStreamStart(m) => m.stream_id,
        other => panic!("expected callback-stream-start, got {other:?}"),
    };
    for _ in 0..2 {
        match daemon.recv().await {
            Message::CallbackStreamChunk(_) => {}
            other => panic!("expected callback-stream-chunk, got {other:?}"),
        }
    }

    daemon
        .send(Message::CallbackStreamCancel(
            datadog_isolate_ipc::msg::CallbackStreamCancel { stream_id },
        ))
        .await;

    // in-flight chunks drain, then the flow stops
    while daemon.try_recv(Duration::from_millis(200)).await.is_some() {}
    assert!(daemon.try_recv(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn module_loader_results_are_cached_per_specifier() {
    let (connection, mut daemon) = support::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let loader: ModuleLoader = {
        let calls = calls.clone();
        Arc::new(move |specifier| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("export default {specifier:?}"))
            }
            .boxed()
        })
    };
    let config = RuntimeConfig {
        module_loader: Some(loader),
        ..RuntimeConfig::default()
    };
    let (_runtime, request) = daemon.serve_create_runtime(&connection, config, 1).await;
    let loader_id = request
        .options
        .callbacks
        .module_loader
        .expect("module loader id");

    for request_id in [580, 581] {
        daemon
            .send(invoke(
                request_id,
                loader_id,
                vec![rmpv::Value::from("./util.ts")],
            ))
            .await;
        match daemon.recv().await {
            Message::CallbackResponse(m) => {
                assert_eq!(
                    m.value.unwrap().as_str(),
                    Some("export default \"./util.ts\"")
                );
            }
            other => panic!("expected callback-response, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second hit must be cached");
}
