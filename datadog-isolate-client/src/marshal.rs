// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Marshalling bridge between rich host values and the wire encoding.
//!
//! Values the encoding cannot represent directly ride as maps with a
//! `$type` discriminator. Live host values (promises, async iterators,
//! functions) become numeric references; for each one the bridge registers
//! correlated callback ids that the daemon invokes later to resolve the
//! reference. The walker is fully recursive, so references nest inside
//! arbitrary container shapes.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::FutureExt;
use rmpv::Value as Wire;
use tracing::warn;

use crate::error::CallbackError;
use crate::http::{Body, HttpRequest, HttpResponse};

/// Host function exposed to isolates by id.
pub type HostFunction =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, CallbackError>> + Send + Sync>;

/// Host promise returned from a callback; resolved at most once.
pub type HostPromise = BoxFuture<'static, Result<Value, CallbackError>>;

/// Host async iterator exposed to isolates.
pub type HostStream = BoxStream<'static, Result<Value, CallbackError>>;

/// Wraps an async closure into a [`HostFunction`].
pub fn host_fn<F, Fut>(f: F) -> HostFunction
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, CallbackError>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileValue {
    pub name: String,
    pub mime: String,
    pub last_modified_ms: f64,
    pub bytes: Bytes,
}

/// A value crossing the host/isolate boundary.
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(String),
    String(String),
    Bytes(Bytes),
    Date(f64),
    Url(String),
    Regexp { source: String, flags: String },
    Headers(Vec<(String, String)>),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    Request(Box<HttpRequest>),
    Response(Box<HttpResponse>),
    File(FileValue),
    Promise(HostPromise),
    AsyncIterator(HostStream),
    Function(HostFunction),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Looks up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Bool(v) => write!(f, "Bool({v})"),
            Value::Int(v) => write!(f, "Int({v})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::BigInt(v) => write!(f, "BigInt({v})"),
            Value::String(v) => write!(f, "String({v:?})"),
            Value::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Value::Date(v) => write!(f, "Date({v})"),
            Value::Url(v) => write!(f, "Url({v})"),
            Value::Regexp { source, flags } => write!(f, "Regexp(/{source}/{flags})"),
            Value::Headers(v) => write!(f, "Headers({v:?})"),
            Value::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Value::Object(v) => f.debug_tuple("Object").field(v).finish(),
            Value::Request(v) => f.debug_tuple("Request").field(v).finish(),
            Value::Response(v) => f.debug_tuple("Response").field(v).finish(),
            Value::File(v) => f.debug_tuple("File").field(v).finish(),
            Value::Promise(_) => f.write_str("Promise(..)"),
            Value::AsyncIterator(_) => f.write_str("AsyncIterator(..)"),
            Value::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Ids handed out when a promise reference is registered.
pub(crate) struct PromiseIds {
    pub promise_id: u64,
    pub resolve_callback_id: u64,
}

/// Ids handed out when an async-iterator reference is registered.
pub(crate) struct IteratorIds {
    pub iterator_id: u64,
    pub next_callback_id: u64,
    pub return_callback_id: u64,
}

/// The three hooks the walker needs; implemented by the connection so the
/// bridge itself stays free of registry plumbing.
pub(crate) trait RegistrationScope: Send + Sync {
    fn register_function(&self, function: HostFunction) -> u64;
    fn register_promise(&self, promise: HostPromise) -> PromiseIds;
    fn register_iterator(&self, iterator: HostStream) -> IteratorIds;
}

const TYPE_KEY: &str = "$type";

fn tagged(tag: &str, fields: Vec<(Wire, Wire)>) -> Wire {
    let mut entries = Vec::with_capacity(fields.len() + 1);
    entries.push((Wire::from(TYPE_KEY), Wire::from(tag)));
    entries.extend(fields);
    Wire::Map(entries)
}

fn header_entries(headers: &[(String, String)]) -> Wire {
    Wire::Array(
        headers
            .iter()
            .map(|(k, v)| Wire::Array(vec![Wire::from(k.as_str()), Wire::from(v.as_str())]))
            .collect(),
    )
}

fn inline_body(body: &Body) -> Result<Wire, CallbackError> {
    match body {
        Body::Empty => Ok(Wire::Nil),
        Body::Bytes(bytes) => Ok(Wire::Binary(bytes.to_vec())),
        _ => Err(CallbackError::new(
            "TypeError",
            "cannot marshal a streaming body",
        )),
    }
}

/// Maps a host value onto the wire encoding, registering reference
/// callbacks through `scope` as it goes.
pub(crate) fn marshal(value: Value, scope: &dyn RegistrationScope) -> Result<Wire, CallbackError> {
    Ok(match value {
        Value::Undefined => tagged("undefined", vec![]),
        Value::Null => Wire::Nil,
        Value::Bool(b) => Wire::Boolean(b),
        Value::Int(n) => Wire::from(n),
        Value::Float(n) => Wire::F64(n),
        Value::BigInt(digits) => tagged("bigint", vec![(Wire::from("value"), Wire::from(digits))]),
        Value::String(s) => Wire::from(s),
        Value::Bytes(bytes) => Wire::Binary(bytes.to_vec()),
        Value::Date(ms) => tagged("date", vec![(Wire::from("ms"), Wire::F64(ms))]),
        Value::Url(href) => tagged("url", vec![(Wire::from("href"), Wire::from(href))]),
        Value::Regexp { source, flags } => tagged(
            "regexp",
            vec![
                (Wire::from("source"), Wire::from(source)),
                (Wire::from("flags"), Wire::from(flags)),
            ],
        ),
        Value::Headers(headers) => tagged(
            "headers",
            vec![(Wire::from("entries"), header_entries(&headers))],
        ),
        Value::Array(items) => Wire::Array(
            items
                .into_iter()
                .map(|item| marshal(item, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(entries) => Wire::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((Wire::from(k), marshal(v, scope)?)))
                .collect::<Result<_, CallbackError>>()?,
        ),
        Value::Request(request) => tagged(
            "request",
            vec![
                (Wire::from("method"), Wire::from(request.method.as_str())),
                (Wire::from("url"), Wire::from(request.url.as_str())),
                (Wire::from("headers"), header_entries(&request.headers)),
                (Wire::from("body"), inline_body(&request.body)?),
            ],
        ),
        Value::Response(response) => tagged(
            "response",
            vec![
                (Wire::from("status"), Wire::from(response.status as u64)),
                (
                    Wire::from("status_text"),
                    Wire::from(response.status_text.as_str()),
                ),
                (Wire::from("headers"), header_entries(&response.headers)),
                (Wire::from("body"), inline_body(&response.body)?),
            ],
        ),
        Value::File(file) => tagged(
            "file",
            vec![
                (Wire::from("name"), Wire::from(file.name)),
                (Wire::from("mime"), Wire::from(file.mime)),
                (
                    Wire::from("last_modified_ms"),
                    Wire::F64(file.last_modified_ms),
                ),
                (Wire::from("bytes"), Wire::Binary(file.bytes.to_vec())),
            ],
        ),
        Value::Promise(promise) => {
            let ids = scope.register_promise(promise);
            tagged(
                "promise",
                vec![
                    (Wire::from("promise_id"), Wire::from(ids.promise_id)),
                    (
                        Wire::from("resolve_callback_id"),
                        Wire::from(ids.resolve_callback_id),
                    ),
                ],
            )
        }
        Value::AsyncIterator(iterator) => {
            let ids = scope.register_iterator(iterator);
            tagged(
                "iterator",
                vec![
                    (Wire::from("iterator_id"), Wire::from(ids.iterator_id)),
                    (
                        Wire::from("next_callback_id"),
                        Wire::from(ids.next_callback_id),
                    ),
                    (
                        Wire::from("return_callback_id"),
                        Wire::from(ids.return_callback_id),
                    ),
                ],
            )
        }
        Value::Function(function) => {
            let callback_id = scope.register_function(function);
            tagged(
                "function",
                vec![(Wire::from("callback_id"), Wire::from(callback_id))],
            )
        }
    })
}

fn wire_str(wire: &Wire) -> String {
    wire.as_str().unwrap_or_default().to_owned()
}

fn wire_f64(wire: &Wire) -> f64 {
    match wire {
        Wire::F32(n) => *n as f64,
        Wire::F64(n) => *n,
        Wire::Integer(n) => n.as_f64().unwrap_or_default(),
        _ => 0.0,
    }
}

fn wire_headers(wire: Option<&Wire>) -> Vec<(String, String)> {
    let Some(Wire::Array(items)) = wire else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Wire::Array(pair) if pair.len() == 2 => {
                Some((wire_str(&pair[0]), wire_str(&pair[1])))
            }
            _ => None,
        })
        .collect()
}

fn wire_body(wire: Option<&Wire>) -> Body {
    match wire {
        Some(Wire::Binary(bytes)) => Body::Bytes(Bytes::from(bytes.clone())),
        _ => Body::Empty,
    }
}

fn unmarshal_tagged(tag: &str, fields: &[(Wire, Wire)]) -> Value {
    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
    };
    match tag {
        "undefined" => Value::Undefined,
        "date" => Value::Date(field("ms").map(wire_f64).unwrap_or_default()),
        "url" => Value::Url(field("href").map(wire_str).unwrap_or_default()),
        "regexp" => Value::Regexp {
            source: field("source").map(wire_str).unwrap_or_default(),
            flags: field("flags").map(wire_str).unwrap_or_default(),
        },
        "bigint" => Value::BigInt(field("value").map(wire_str).unwrap_or_default()),
        "headers" => Value::Headers(wire_headers(field("entries"))),
        "request" => Value::Request(Box::new(HttpRequest {
            method: field("method").map(wire_str).unwrap_or_default(),
            url: field("url").map(wire_str).unwrap_or_default(),
            headers: wire_headers(field("headers")),
            body: wire_body(field("body")),
        })),
        "response" => Value::Response(Box::new(HttpResponse {
            status: field("status").and_then(Wire::as_u64).unwrap_or_default() as u16,
            status_text: field("status_text").map(wire_str).unwrap_or_default(),
            headers: wire_headers(field("headers")),
            body: wire_body(field("body")),
        })),
        "file" => Value::File(FileValue {
            name: field("name").map(wire_str).unwrap_or_default(),
            mime: field("mime").map(wire_str).unwrap_or_default(),
            last_modified_ms: field("last_modified_ms").map(wire_f64).unwrap_or_default(),
            bytes: match field("bytes") {
                Some(Wire::Binary(bytes)) => Bytes::from(bytes.clone()),
                _ => Bytes::new(),
            },
        }),
        // References are owned by this side; the daemon has no business
        // sending them back as values.
        "promise" | "iterator" | "function" => {
            warn!(tag, "dropping unresolvable reference from daemon");
            Value::Undefined
        }
        other => {
            warn!(tag = other, "unknown $type tag, treating as undefined");
            Value::Undefined
        }
    }
}

/// Maps a wire value back into a host value.
pub(crate) fn unmarshal(wire: Wire) -> Value {
    match wire {
        Wire::Nil => Value::Null,
        Wire::Boolean(b) => Value::Bool(b),
        Wire::Integer(n) => match n.as_i64() {
            Some(v) => Value::Int(v),
            None => Value::Float(n.as_f64().unwrap_or_default()),
        },
        Wire::F32(n) => Value::Float(n as f64),
        Wire::F64(n) => Value::Float(n),
        Wire::String(s) => Value::String(s.into_str().unwrap_or_default()),
        Wire::Binary(bytes) => Value::Bytes(Bytes::from(bytes)),
        Wire::Array(items) => Value::Array(items.into_iter().map(unmarshal).collect()),
        Wire::Map(entries) => {
            if let Some(tag) = entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(TYPE_KEY))
                .and_then(|(_, v)| v.as_str())
            {
                let tag = tag.to_owned();
                return unmarshal_tagged(&tag, &entries);
            }
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (wire_str(&k), unmarshal(v)))
                    .collect(),
            )
        }
        Wire::Ext(kind, _) => {
            warn!(kind, "dropping unsupported ext value");
            Value::Undefined
        }
    }
}

pub(crate) fn unmarshal_args(args: Vec<Wire>) -> Vec<Value> {
    args.into_iter().map(unmarshal).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct NoRefs;

    impl RegistrationScope for NoRefs {
        fn register_function(&self, _function: HostFunction) -> u64 {
            71
        }

        fn register_promise(&self, _promise: HostPromise) -> PromiseIds {
            PromiseIds {
                promise_id: 81,
                resolve_callback_id: 82,
            }
        }

        fn register_iterator(&self, _iterator: HostStream) -> IteratorIds {
            IteratorIds {
                iterator_id: 91,
                next_callback_id: 92,
                return_callback_id: 93,
            }
        }
    }

    fn roundtrip(value: Value) -> Value {
        unmarshal(marshal(value, &NoRefs).unwrap())
    }

    #[test]
    fn roundtrips_scalars() {
        assert!(matches!(roundtrip(Value::Null), Value::Null));
        assert!(matches!(roundtrip(Value::Undefined), Value::Undefined));
        assert!(matches!(roundtrip(Value::Bool(true)), Value::Bool(true)));
        assert!(matches!(roundtrip(Value::Int(-3)), Value::Int(-3)));
        assert!(matches!(roundtrip(Value::Float(2.5)), Value::Float(v) if v == 2.5));
        assert!(matches!(
            roundtrip(Value::String("x".into())),
            Value::String(s) if s == "x"
        ));
    }

    #[test]
    fn roundtrips_rich_values() {
        match roundtrip(Value::Date(1_700_000_000_000.0)) {
            Value::Date(ms) => assert_eq!(ms, 1_700_000_000_000.0),
            other => panic!("expected date, got {other:?}"),
        }
        match roundtrip(Value::Regexp {
            source: "a+".into(),
            flags: "gi".into(),
        }) {
            Value::Regexp { source, flags } => {
                assert_eq!(source, "a+");
                assert_eq!(flags, "gi");
            }
            other => panic!("expected regexp, got {other:?}"),
        }
        match roundtrip(Value::BigInt("12345678901234567890".into())) {
            Value::BigInt(digits) => assert_eq!(digits, "12345678901234567890"),
            other => panic!("expected bigint, got {other:?}"),
        }
        match roundtrip(Value::Bytes(Bytes::from_static(b"\x00\xff"))) {
            Value::Bytes(bytes) => assert_eq!(&bytes[..], b"\x00\xff"),
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn walks_nested_containers() {
        let value = Value::Object(vec![
            (
                "list".into(),
                Value::Array(vec![Value::Int(1), Value::Date(5.0)]),
            ),
            ("url".into(), Value::Url("https://example.com/".into())),
        ]);
        match roundtrip(value) {
            Value::Object(entries) => {
                assert_eq!(entries.len(), 2);
                match &entries[0].1 {
                    Value::Array(items) => {
                        assert!(matches!(items[0], Value::Int(1)));
                        assert!(matches!(items[1], Value::Date(ms) if ms == 5.0));
                    }
                    other => panic!("expected array, got {other:?}"),
                }
            }
            other => panic!("expected object, got {other:?}"),
        }
    }

    #[test]
    fn references_register_callback_ids() {
        let function = host_fn(|_args| async { Ok(Value::Null) });
        let wire = marshal(Value::Function(function), &NoRefs).unwrap();
        let Wire::Map(entries) = wire else {
            panic!("expected map");
        };
        assert!(entries
            .iter()
            .any(|(k, v)| k.as_str() == Some("callback_id") && v.as_u64() == Some(71)));

        let promise: HostPromise = Box::pin(async { Ok(Value::Int(1)) });
        let wire = marshal(Value::Promise(promise), &NoRefs).unwrap();
        let Wire::Map(entries) = wire else {
            panic!("expected map");
        };
        assert!(entries
            .iter()
            .any(|(k, v)| k.as_str() == Some("promise_id") && v.as_u64() == Some(81)));
    }

    #[test]
    fn streaming_bodies_do_not_marshal() {
        let request = HttpRequest::new("POST", "http://x/").body(crate::http::Body::stream(
            futures::stream::empty().boxed(),
            None,
        ));
        assert!(marshal(Value::Request(Box::new(request)), &NoRefs).is_err());
    }
}
