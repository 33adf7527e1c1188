//! Request and response types moved through the transport
//!
//! Payload bodies use `serde_json::Value` as the common currency; raw
//! and streaming forms are carried alongside for callers that bypass
//! the codec.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::connection::Connection;

/// Boxed byte stream used for streaming request and response bodies.
pub type BodyStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static>>;

/// Outgoing request body.
///
/// `NdJson` and `NdText` are the bulk forms: each element is emitted on
/// its own line. Stream bodies are consumed once and therefore disable
/// retries for the request that carries them.
pub enum RequestBody {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    NdJson(Vec<Value>),
    NdText(Vec<String>),
    Stream(BodyStream),
}

impl RequestBody {
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }

    /// Whether the body is a bulk (newline-delimited) form
    pub fn is_bulk(&self) -> bool {
        matches!(self, RequestBody::NdJson(_) | RequestBody::NdText(_))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            RequestBody::Text(s) => f.debug_tuple("Text").field(s).finish(),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::NdJson(v) => f.debug_tuple("NdJson").field(&v.len()).finish(),
            RequestBody::NdText(v) => f.debug_tuple("NdText").field(&v.len()).finish(),
            RequestBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Parameters for one logical request
#[derive(Debug)]
pub struct RequestParams {
    pub method: Method,
    pub path: String,
    /// Query parameters as a JSON object; values may be scalars or arrays
    pub querystring: Option<Value>,
    pub body: Option<RequestBody>,
    pub headers: Option<HeaderMap>,
}

impl RequestParams {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: None,
            body: None,
            headers: None,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_querystring(mut self, querystring: Value) -> Self {
        self.querystring = Some(querystring);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Per-request options layered over the transport configuration
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Status codes the caller wants surfaced as success
    pub ignore: Vec<u16>,
    pub request_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Overrides the transport-level compression setting
    pub compression: Option<bool>,
    /// Deliver the raw response body without collection or decoding
    pub as_stream: bool,
    pub headers: Option<HeaderMap>,
    /// Merged shallowly over the request params querystring
    pub querystring: Option<Value>,
    /// Caller-supplied request id; generated when absent
    pub id: Option<String>,
    /// Opaque user value echoed back on the response meta
    pub context: Option<Value>,
    pub opaque_id: Option<String>,
}

/// Why a sniff was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffReason {
    SniffOnStart,
    SniffInterval,
    SniffOnConnectionFault,
    Default,
}

impl SniffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SniffReason::SniffOnStart => "sniff-on-start",
            SniffReason::SniffInterval => "sniff-interval",
            SniffReason::SniffOnConnectionFault => "sniff-on-connection-fault",
            SniffReason::Default => "default",
        }
    }
}

/// Sniff outcome recorded on the request meta when a sniff fired while
/// the request was in flight
#[derive(Debug, Clone)]
pub struct SniffMeta {
    pub hosts: usize,
    pub reason: SniffReason,
}

/// Bookkeeping for one in-flight request
#[derive(Debug)]
pub struct RequestMeta {
    pub request_id: String,
    pub name: String,
    pub context: Option<Value>,
    /// Number of retries performed (0 on the first attempt)
    pub attempts: u32,
    pub aborted: bool,
    pub connection: Option<Arc<Connection>>,
    pub sniff: Option<SniffMeta>,
}

impl RequestMeta {
    pub fn new(request_id: String, name: String) -> Self {
        Self {
            request_id,
            name,
            context: None,
            attempts: 0,
            aborted: false,
            connection: None,
            sniff: None,
        }
    }
}

/// Decoded response body
pub enum ResponseBody {
    Json(Value),
    Text(String),
    /// HEAD requests resolve to a boolean: true for 2xx, false for 404
    Bool(bool),
    /// Raw body stream, delivered when the caller asked for it
    Stream(BodyStream),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResponseBody::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ResponseBody::Text(s) => f.debug_tuple("Text").field(s).finish(),
            ResponseBody::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Terminal outcome of a request
#[derive(Debug)]
pub struct Response {
    pub body: ResponseBody,
    pub status_code: u16,
    pub headers: HeaderMap,
    /// Parsed `Warning` header values, when the service sent any
    pub warnings: Option<Vec<String>>,
    pub meta: RequestMeta,
}
