//! The request orchestrator
//!
//! `Transport` drives one logical request end to end: pick a live
//! connection, encode and optionally compress the payload, execute the
//! HTTP exchange, classify the outcome, and decide between surfacing,
//! retrying against another node, and triggering cluster discovery.
//!
//! Callers choose between two entry points: `request` resolves like a
//! plain future, `dispatch` hands back an abortable handle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, USER_AGENT, WARNING,
};
use reqwest::Method;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::ConnectionRequest;
use crate::error::{Result, TransportError};
use crate::events::{RequestEvent, ResponseEvent, SniffEvent, TransportEvent};
use crate::http::{self, HttpBody};
use crate::metrics;
use crate::pool::{now_ms, parse_sniff_nodes, ConnectionPool, SelectionOptions};
use crate::selector::{default_filter, NodeFilterFn, NodeSelector, RandomSelector, RoundRobinSelector};
use crate::serializer;
use crate::types::{
    BodyStream, RequestBody, RequestMeta, RequestOptions, RequestParams, Response, ResponseBody,
    SniffMeta, SniffReason,
};

static USER_AGENT_VALUE: Lazy<String> = Lazy::new(|| {
    format!(
        "{}/{} ({} {}; Rust)",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// Source of request ids
pub type RequestIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("name", &self.name).finish_non_exhaustive()
    }
}

pub struct Transport {
    weak: Weak<Transport>,
    pool: Arc<dyn ConnectionPool>,
    max_retries: u32,
    request_timeout: Duration,
    gzip_requests: bool,
    headers: HeaderMap,
    name: String,
    opaque_id_prefix: Option<String>,
    sniff_endpoint: String,
    sniff_on_connection_fault: bool,
    sniff_interval: Option<Duration>,
    next_sniff_at: AtomicU64,
    sniffing: AtomicBool,
    filter: NodeFilterFn,
    selector: Arc<dyn NodeSelector>,
    generate_request_id: RequestIdGenerator,
    events: broadcast::Sender<TransportEvent>,
}

/// Staged builder; lets callers swap in custom selection and id
/// generation before the transport starts working
pub struct TransportBuilder {
    pool: Arc<dyn ConnectionPool>,
    config: TransportConfig,
    filter: Option<NodeFilterFn>,
    selector: Option<Arc<dyn NodeSelector>>,
    generate_request_id: Option<RequestIdGenerator>,
}

impl TransportBuilder {
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn node_filter(mut self, filter: NodeFilterFn) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn node_selector(mut self, selector: Arc<dyn NodeSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn request_id_generator(mut self, generator: RequestIdGenerator) -> Self {
        self.generate_request_id = Some(generator);
        self
    }

    pub fn build(self) -> Result<Arc<Transport>> {
        let config = self.config;

        let gzip_requests = match config.compression.as_deref() {
            None => false,
            Some("gzip") => true,
            Some(other) => {
                return Err(TransportError::Configuration(format!(
                    "invalid compression '{}', expected \"gzip\"",
                    other
                )))
            }
        };

        let selector = match self.selector {
            Some(selector) => selector,
            None => match config.node_selector.as_str() {
                "round-robin" => Arc::new(RoundRobinSelector::new()) as Arc<dyn NodeSelector>,
                "random" => Arc::new(RandomSelector) as Arc<dyn NodeSelector>,
                other => {
                    return Err(TransportError::Configuration(format!(
                        "invalid node selector '{}'",
                        other
                    )))
                }
            },
        };

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(&USER_AGENT_VALUE).unwrap_or(HeaderValue::from_static("keel-transport")));
        if config.suggest_compression {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate"));
        }
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Configuration(format!("invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Configuration(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let generate_request_id = self.generate_request_id.unwrap_or_else(default_id_generator);

        let next_sniff_at = config
            .sniff_interval()
            .map(|i| now_ms() + i.as_millis() as u64)
            .unwrap_or(0);

        let (events, _) = broadcast::channel(256);

        let transport = Arc::new_cyclic(|weak: &Weak<Transport>| Transport {
            weak: weak.clone(),
            pool: Arc::clone(&self.pool),
            max_retries: config.max_retries,
            request_timeout: config.request_timeout(),
            gzip_requests,
            headers,
            name: config.name.clone(),
            opaque_id_prefix: config.opaque_id_prefix.clone(),
            sniff_endpoint: config.sniff_endpoint.clone(),
            sniff_on_connection_fault: config.sniff_on_connection_fault,
            sniff_interval: config.sniff_interval(),
            next_sniff_at: AtomicU64::new(next_sniff_at),
            sniffing: AtomicBool::new(false),
            filter: self.filter.unwrap_or_else(default_filter),
            selector,
            generate_request_id,
            events,
        });

        transport.pool.set_event_sink(transport.events.clone());

        if config.sniff_on_start {
            transport.spawn_sniff(SniffReason::SniffOnStart);
        }

        Ok(transport)
    }
}

/// Rolling 31-bit counter, the default request id source
fn default_id_generator() -> RequestIdGenerator {
    let counter = Arc::new(AtomicU32::new(0));
    Arc::new(move || {
        let next = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) & 0x7fff_ffff;
        next.to_string()
    })
}

/// Handle on a dispatched request
pub struct RequestHandle {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<Result<Response>>,
}

impl RequestHandle {
    /// Abort the request. Idempotent; safe to call after completion.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Wait for the terminal outcome
    pub async fn join(self) -> Result<Response> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TransportError::RequestAborted),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }
}

/// Outgoing body staged for the attempt loop. Buffered bodies replay
/// across retries; a stream can only be taken once.
enum PreparedBody {
    None,
    Buffer(Bytes),
    Stream(Option<BodyStream>),
}

impl Transport {
    pub fn builder(pool: Arc<dyn ConnectionPool>) -> TransportBuilder {
        TransportBuilder {
            pool,
            config: TransportConfig::default(),
            filter: None,
            selector: None,
            generate_request_id: None,
        }
    }

    pub fn new(pool: Arc<dyn ConnectionPool>, config: TransportConfig) -> Result<Arc<Self>> {
        Self::builder(pool).config(config).build()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Perform one logical request, resolving when it reaches a
    /// terminal outcome
    pub async fn request(&self, params: RequestParams, options: RequestOptions) -> Result<Response> {
        self.perform(params, options, CancellationToken::new()).await
    }

    /// Start a request and return an abortable handle
    pub fn dispatch(self: &Arc<Self>, params: RequestParams, options: RequestOptions) -> RequestHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let transport = Arc::clone(self);
        let handle =
            tokio::spawn(async move { transport.perform(params, options, child).await });
        RequestHandle { token, handle }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn perform(
        &self,
        params: RequestParams,
        options: RequestOptions,
        token: CancellationToken,
    ) -> Result<Response> {
        let request_id = options
            .id
            .clone()
            .unwrap_or_else(|| (self.generate_request_id)());
        let mut meta = RequestMeta::new(request_id, self.name.clone());
        meta.context = options.context.clone();

        let is_stream_body = matches!(params.body, Some(RequestBody::Stream(_)));
        // stream bodies are consumed by the first attempt and cannot
        // be replayed
        let max_retries = if is_stream_body {
            0
        } else {
            options.max_retries.unwrap_or(self.max_retries)
        };
        let compress = options.compression.unwrap_or(self.gzip_requests);
        let timeout = options.request_timeout.unwrap_or(self.request_timeout);

        let mut headers = self.headers.clone();
        if let Some(extra) = &params.headers {
            for (name, value) in extra.iter() {
                headers.insert(name, value.clone());
            }
        }
        if let Some(extra) = &options.headers {
            for (name, value) in extra.iter() {
                headers.insert(name, value.clone());
            }
        }
        if let Some(opaque_id) = &options.opaque_id {
            let value = match &self.opaque_id_prefix {
                Some(prefix) => format!("{}{}", prefix, opaque_id),
                None => opaque_id.clone(),
            };
            let value = HeaderValue::from_str(&value).map_err(|e| {
                TransportError::Configuration(format!("invalid opaque id: {}", e))
            })?;
            headers.insert(HeaderName::from_static("x-opaque-id"), value);
        }

        let mut body = prepare_body(params.body, compress, &mut headers)?;

        let querystring = match merge_querystring(params.querystring, options.querystring.clone()) {
            None => None,
            Some(qs) => {
                let encoded = serializer::qserialize(Some(&qs))?;
                (!encoded.is_empty()).then_some(encoded)
            }
        };

        let method = params.method;
        let path = params.path;
        let is_head = method == Method::HEAD;

        loop {
            if token.is_cancelled() {
                meta.aborted = true;
                return Err(TransportError::RequestAborted);
            }

            let now = now_ms();
            self.check_sniff_interval(now);

            let connection = self.pool.get_connection(SelectionOptions {
                filter: &self.filter,
                selector: &*self.selector,
                now_ms: now,
                request_id: &meta.request_id,
                name: &self.name,
            });
            let connection = match connection {
                Some(connection) => connection,
                None => {
                    warn!("No living connections for request {}", meta.request_id);
                    metrics::record_request(&self.name, "no_living_connections");
                    return Err(TransportError::NoLivingConnections);
                }
            };
            meta.connection = Some(Arc::clone(&connection));

            self.emit(TransportEvent::Request(RequestEvent {
                request_id: meta.request_id.clone(),
                name: meta.name.clone(),
                attempts: meta.attempts,
                connection_id: Some(connection.id()),
            }));

            let attempt_body = match &mut body {
                PreparedBody::None => None,
                PreparedBody::Buffer(bytes) => Some(HttpBody::Bytes(bytes.clone())),
                PreparedBody::Stream(stream) => stream.take().map(HttpBody::Stream),
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    // never fires the success path and never marks the
                    // node dead
                    meta.aborted = true;
                    return Err(TransportError::RequestAborted);
                }
                outcome = connection.request(ConnectionRequest {
                    method: method.clone(),
                    path: path.clone(),
                    querystring: querystring.clone(),
                    body: attempt_body,
                    headers: Some(headers.clone()),
                    timeout,
                }) => outcome,
            };
            metrics::record_request_duration(&self.name, started.elapsed());

            let raw = match outcome {
                Err(err) => {
                    debug!(
                        "Request {} failed against {}: {}",
                        meta.request_id,
                        connection.id(),
                        err
                    );
                    self.pool.mark_dead(&connection, now_ms());
                    if self.sniff_on_connection_fault {
                        self.spawn_sniff(SniffReason::SniffOnConnectionFault);
                    }
                    if meta.attempts < max_retries {
                        meta.attempts += 1;
                        metrics::record_retry(&self.name);
                        continue;
                    }
                    // timeouts keep their identity; everything else at
                    // this level is a connection failure
                    let err = match err {
                        TransportError::Timeout(ms) => TransportError::Timeout(ms),
                        TransportError::Connection(msg) => TransportError::Connection(msg),
                        other => TransportError::Connection(other.to_string()),
                    };
                    metrics::record_request(&self.name, err.error_type());
                    self.emit(TransportEvent::Response(ResponseEvent {
                        request_id: meta.request_id.clone(),
                        name: meta.name.clone(),
                        status_code: None,
                        error: Some(err.error_type().to_string()),
                    }));
                    return Err(err);
                }
                Ok(raw) => raw,
            };

            let status = raw.status;
            let warnings = parse_warnings(&raw.headers);

            if options.as_stream {
                let response = Response {
                    body: ResponseBody::Stream(raw.body),
                    status_code: status,
                    headers: raw.headers,
                    warnings,
                    meta,
                };
                metrics::record_request(&self.name, "success");
                self.emit(TransportEvent::Response(ResponseEvent {
                    request_id: response.meta.request_id.clone(),
                    name: response.meta.name.clone(),
                    status_code: Some(status),
                    error: None,
                }));
                return Ok(response);
            }

            let collected = tokio::select! {
                _ = token.cancelled() => {
                    meta.aborted = true;
                    return Err(TransportError::RequestAborted);
                }
                collected = http::read_body(raw.body, timeout.as_millis() as u64) => collected,
            };
            let collected = match collected {
                Ok(collected) => collected,
                Err(err) => {
                    self.pool.mark_dead(&connection, now_ms());
                    metrics::record_request(&self.name, err.error_type());
                    self.emit(TransportEvent::Response(ResponseEvent {
                        request_id: meta.request_id.clone(),
                        name: meta.name.clone(),
                        status_code: Some(status),
                        error: Some(err.error_type().to_string()),
                    }));
                    return Err(err);
                }
            };
            let decoded = http::decode_body(&raw.headers, collected)?;
            let payload = String::from_utf8_lossy(&decoded).into_owned();

            let content_type = raw
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let mut response_body =
                if content_type.contains("application/json") && !is_head && !payload.is_empty() {
                    ResponseBody::Json(serializer::deserialize(&payload)?)
                } else if is_head && (200..300).contains(&status) {
                    ResponseBody::Bool(true)
                } else {
                    ResponseBody::Text(payload)
                };

            let ignored =
                options.ignore.contains(&status) || (is_head && status == 404);

            if !ignored && matches!(status, 502 | 503 | 504) {
                self.pool.mark_dead(&connection, now_ms());
                if meta.attempts < max_retries && status != 429 {
                    meta.attempts += 1;
                    metrics::record_retry(&self.name);
                    debug!(
                        "Retrying request {} after status {} (attempt {})",
                        meta.request_id, status, meta.attempts
                    );
                    continue;
                }
            } else {
                self.pool.mark_alive(&connection);
            }

            if is_head && status == 404 {
                response_body = ResponseBody::Bool(false);
            }

            let response = Response {
                body: response_body,
                status_code: status,
                headers: raw.headers,
                warnings,
                meta,
            };

            if !ignored && status >= 400 {
                metrics::record_request(&self.name, "response_error");
                self.emit(TransportEvent::Response(ResponseEvent {
                    request_id: response.meta.request_id.clone(),
                    name: response.meta.name.clone(),
                    status_code: Some(status),
                    error: Some("response".to_string()),
                }));
                return Err(TransportError::from_response(response));
            }

            metrics::record_request(&self.name, "success");
            self.emit(TransportEvent::Response(ResponseEvent {
                request_id: response.meta.request_id.clone(),
                name: response.meta.name.clone(),
                status_code: Some(status),
                error: None,
            }));
            return Ok(response);
        }
    }

    /// Probe the cluster for current membership and swap it into the
    /// pool. Returns None when another sniff is already in flight.
    pub async fn sniff(&self, reason: SniffReason) -> Result<Option<Response>> {
        if self.sniffing.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let result = self.sniff_inner(reason).await;

        // schedule the next window regardless of outcome
        if let Some(interval) = self.sniff_interval {
            self.next_sniff_at
                .store(now_ms() + interval.as_millis() as u64, Ordering::SeqCst);
        }
        self.sniffing.store(false, Ordering::SeqCst);

        match result {
            Ok(response) => {
                let hosts = response
                    .meta
                    .sniff
                    .as_ref()
                    .map(|s| s.hosts)
                    .unwrap_or(0);
                info!("Sniff ({}) found {} nodes", reason.as_str(), hosts);
                metrics::record_sniff(reason.as_str(), true);
                self.emit(TransportEvent::Sniff(SniffEvent {
                    reason,
                    hosts,
                    error: None,
                }));
                Ok(Some(response))
            }
            Err(err) => {
                warn!("Sniff ({}) failed: {}", reason.as_str(), err);
                metrics::record_sniff(reason.as_str(), false);
                self.emit(TransportEvent::Sniff(SniffEvent {
                    reason,
                    hosts: 0,
                    error: Some(err.error_type().to_string()),
                }));
                Err(err)
            }
        }
    }

    async fn sniff_inner(&self, reason: SniffReason) -> Result<Response> {
        let params = RequestParams::new(Method::GET, self.sniff_endpoint.clone());
        let mut response = self
            .perform(params, RequestOptions::default(), CancellationToken::new())
            .await?;

        let scheme = response
            .meta
            .connection
            .as_ref()
            .map(|c| c.url().scheme().to_string())
            .unwrap_or_else(|| "http".to_string());
        let body = response.body.as_json().ok_or_else(|| {
            TransportError::Deserialization("discovery response is not a JSON object".to_string())
        })?;

        let hosts = parse_sniff_nodes(body, &scheme)?;
        response.meta.sniff = Some(SniffMeta {
            hosts: hosts.len(),
            reason,
        });
        self.pool.update(hosts)?;
        Ok(response)
    }

    fn check_sniff_interval(&self, now: u64) {
        if self.sniff_interval.is_none() {
            return;
        }
        if now < self.next_sniff_at.load(Ordering::SeqCst) {
            return;
        }
        self.spawn_sniff(SniffReason::SniffInterval);
    }

    fn spawn_sniff(&self, reason: SniffReason) {
        let transport = match self.weak.upgrade() {
            Some(transport) => transport,
            None => return,
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.sniff(reason).await;
            });
        }
    }
}

/// Encode the request body and stamp the entity headers
fn prepare_body(
    body: Option<RequestBody>,
    compress: bool,
    headers: &mut HeaderMap,
) -> Result<PreparedBody> {
    let body = match body {
        None => return Ok(PreparedBody::None),
        Some(body) => body,
    };

    let buffered: Bytes = match body {
        RequestBody::Json(value) => {
            default_content_type(headers, "application/json");
            Bytes::from(serializer::serialize(&value)?)
        }
        RequestBody::Text(text) => {
            default_content_type(headers, "application/json");
            Bytes::from(text)
        }
        RequestBody::Bytes(bytes) => {
            default_content_type(headers, "application/json");
            bytes
        }
        RequestBody::NdJson(items) => {
            default_content_type(headers, "application/x-ndjson");
            Bytes::from(serializer::ndserialize(&items)?)
        }
        RequestBody::NdText(lines) => {
            default_content_type(headers, "application/x-ndjson");
            Bytes::from(serializer::ndserialize_lines(&lines))
        }
        RequestBody::Stream(stream) => {
            default_content_type(headers, "application/json");
            return Ok(PreparedBody::Stream(Some(if compress {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                http::gzip_stream(stream)
            } else {
                stream
            })));
        }
    };

    if compress {
        let compressed = http::gzip(&buffered)?;
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        Ok(PreparedBody::Buffer(compressed))
    } else {
        if !buffered.is_empty() {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(buffered.len()));
        }
        Ok(PreparedBody::Buffer(buffered))
    }
}

fn default_content_type(headers: &mut HeaderMap, value: &'static str) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
    }
}

/// Shallow merge of the two querystring sources; per-request options
/// win key by key
fn merge_querystring(base: Option<Value>, extra: Option<Value>) -> Option<Value> {
    match (base, extra) {
        (None, None) => None,
        (Some(base), None) => Some(base),
        (None, Some(extra)) => Some(extra),
        (Some(Value::Object(mut base)), Some(Value::Object(extra))) => {
            for (key, value) in extra {
                base.insert(key, value);
            }
            Some(Value::Object(base))
        }
        (_, Some(extra)) => Some(extra),
    }
}

/// Collect `Warning` header values, splitting on commas outside quotes
fn parse_warnings(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut warnings = Vec::new();
    for value in headers.get_all(WARNING) {
        if let Ok(raw) = value.to_str() {
            warnings.extend(split_outside_quotes(raw));
        }
    }
    if warnings.is_empty() {
        None
    } else {
        Some(warnings)
    }
}

fn split_outside_quotes(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in input.chars() {
        match c {
            '\\' if !escaped => {
                escaped = true;
                current.push(c);
            }
            '"' if !escaped => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                let part = current.trim();
                if !part.is_empty() {
                    parts.push(part.to_string());
                }
                current.clear();
            }
            _ => {
                escaped = false;
                current.push(c);
            }
        }
        if c != '\\' {
            escaped = false;
        }
    }
    let part = current.trim();
    if !part.is_empty() {
        parts.push(part.to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PoolConfig, ResurrectStrategy};
    use crate::error::Result;
    use crate::http::{HttpRequest, HttpTransport, RawResponse};
    use crate::pool::NodePool;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    enum Script {
        Respond {
            status: u16,
            content_type: &'static str,
            body: String,
        },
        Fail(fn() -> TransportError),
        Hang,
    }

    struct CapturedRequest {
        method: Method,
        url: String,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    }

    struct ScriptedHttp {
        script: Mutex<VecDeque<Script>>,
        captured: Mutex<Vec<CapturedRequest>>,
    }

    impl ScriptedHttp {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                captured: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.captured.lock().len()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedHttp {
        async fn execute(&self, request: HttpRequest) -> Result<RawResponse> {
            let body = match request.body {
                None => None,
                Some(HttpBody::Bytes(b)) => Some(b.to_vec()),
                Some(HttpBody::Stream(s)) => {
                    Some(http::read_body(s, 0).await.unwrap().to_vec())
                }
            };
            self.captured.lock().push(CapturedRequest {
                method: request.method,
                url: request.url.to_string(),
                headers: request.headers,
                body,
            });

            let step = self.script.lock().pop_front();
            match step {
                None => Err(TransportError::Connection("script exhausted".into())),
                Some(Script::Fail(make)) => Err(make()),
                Some(Script::Hang) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Script::Respond {
                    status,
                    content_type,
                    body,
                }) => {
                    let mut headers = HeaderMap::new();
                    if !content_type.is_empty() {
                        headers
                            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                    }
                    Ok(RawResponse {
                        status,
                        headers,
                        body: Box::pin(futures::stream::once(async move {
                            Ok::<_, std::io::Error>(Bytes::from(body))
                        })),
                    })
                }
            }
        }
    }

    fn ok_json(body: &str) -> Script {
        Script::Respond {
            status: 200,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn status(code: u16) -> Script {
        Script::Respond {
            status: code,
            content_type: "application/json",
            body: "{}".to_string(),
        }
    }

    fn pool_of(http: &Arc<ScriptedHttp>, urls: &[&str]) -> Arc<NodePool> {
        let pool = NodePool::with_http_transport(
            PoolConfig {
                resurrect_strategy: ResurrectStrategy::None,
                ..Default::default()
            },
            Arc::clone(http) as Arc<dyn HttpTransport>,
        );
        pool.update(
            urls.iter()
                .map(|u| NodeConfig::from_url_str(u).unwrap())
                .collect(),
        )
        .unwrap();
        Arc::new(pool)
    }

    fn transport_over(
        http: &Arc<ScriptedHttp>,
        urls: &[&str],
        config: TransportConfig,
    ) -> Arc<Transport> {
        Transport::new(pool_of(http, urls), config).unwrap()
    }

    fn get(path: &str) -> RequestParams {
        RequestParams::new(Method::GET, path)
    }

    #[tokio::test]
    async fn test_basic_success() {
        let http = ScriptedHttp::new(vec![ok_json(r#"{"hello":"world"}"#)]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let response = transport
            .request(get("/"), RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.as_json().unwrap(), &json!({"hello": "world"}));
        assert!(response.warnings.is_none());
        assert_eq!(response.meta.attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_on_503_moves_to_next_node() {
        let http = ScriptedHttp::new(vec![status(503), ok_json(r#"{"ok":true}"#)]);
        let transport =
            transport_over(&http, &["http://a:9200", "http://b:9200"], TransportConfig::default());

        let response = transport
            .request(get("/"), RequestOptions::default())
            .await
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(response.meta.attempts, 1);
        assert_eq!(http.calls(), 2);

        let connections = transport.pool().connections();
        assert!(!connections[0].is_alive());
        assert!(connections[1].is_alive());
    }

    #[tokio::test]
    async fn test_429_is_not_retried() {
        let http = ScriptedHttp::new(vec![status(429), ok_json("{}")]);
        let transport =
            transport_over(&http, &["http://a:9200", "http://b:9200"], TransportConfig::default());

        let err = transport
            .request(get("/"), RequestOptions::default())
            .await
            .unwrap_err();

        match err {
            TransportError::Response { status, .. } => assert_eq!(status, 429),
            other => panic!("expected response error, got {:?}", other),
        }
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn test_connection_errors_exhaust_retries_then_surface() {
        let http = ScriptedHttp::new(vec![
            Script::Fail(|| TransportError::Connection("reset".into())),
            Script::Fail(|| TransportError::Connection("reset".into())),
        ]);
        let transport = transport_over(
            &http,
            &["http://a:9200", "http://b:9200"],
            TransportConfig {
                max_retries: 5,
                ..Default::default()
            },
        );

        // both nodes die, so the third attempt has nothing to select
        let err = transport
            .request(get("/"), RequestOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::NoLivingConnections));
        assert_eq!(http.calls(), 2);
        for conn in transport.pool().connections() {
            assert!(!conn.is_alive());
        }
    }

    #[tokio::test]
    async fn test_timeout_keeps_its_identity() {
        let http = ScriptedHttp::new(vec![Script::Fail(|| TransportError::Timeout(50))]);
        let transport = transport_over(
            &http,
            &["http://a:9200", "http://b:9200"],
            TransportConfig {
                max_retries: 0,
                ..Default::default()
            },
        );

        let err = transport
            .request(get("/"), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(50)));
    }

    #[tokio::test]
    async fn test_stream_body_disables_retries() {
        let http = ScriptedHttp::new(vec![
            Script::Fail(|| TransportError::Connection("reset".into())),
            ok_json("{}"),
        ]);
        let transport = transport_over(
            &http,
            &["http://a:9200", "http://b:9200"],
            TransportConfig {
                max_retries: 3,
                ..Default::default()
            },
        );

        let stream: BodyStream = Box::pin(futures::stream::once(async {
            Ok::<_, std::io::Error>(Bytes::from_static(b"{\"a\":1}"))
        }));
        let params = get("/_bulk").with_body(RequestBody::Stream(stream));

        let err = transport
            .request(params, RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn test_head_404_yields_false() {
        let http = ScriptedHttp::new(vec![Script::Respond {
            status: 404,
            content_type: "",
            body: String::new(),
        }]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let response = transport
            .request(
                RequestParams::new(Method::HEAD, "/index"),
                RequestOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.status_code, 404);
        assert_eq!(response.body.as_bool(), Some(false));
    }

    #[tokio::test]
    async fn test_head_success_yields_true() {
        let http = ScriptedHttp::new(vec![Script::Respond {
            status: 200,
            content_type: "",
            body: String::new(),
        }]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let response = transport
            .request(
                RequestParams::new(Method::HEAD, "/index"),
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.body.as_bool(), Some(true));
    }

    #[tokio::test]
    async fn test_ignore_list_turns_errors_into_success() {
        let http = ScriptedHttp::new(vec![status(404)]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let response = transport
            .request(
                get("/missing"),
                RequestOptions {
                    ignore: vec![404],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(response.status_code, 404);
        assert_eq!(response.body.as_json().unwrap(), &json!({}));
    }

    #[tokio::test]
    async fn test_response_error_carries_body_and_meta() {
        let http = ScriptedHttp::new(vec![Script::Respond {
            status: 400,
            content_type: "application/json",
            body: r#"{"error":{"type":"parsing_exception"}}"#.to_string(),
        }]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let err = transport
            .request(get("/bad"), RequestOptions::default())
            .await
            .unwrap_err();
        match err {
            TransportError::Response {
                status,
                reason,
                response,
            } => {
                assert_eq!(status, 400);
                assert_eq!(reason, "parsing_exception");
                assert!(response.meta.connection.is_some());
            }
            other => panic!("expected response error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_querystring_and_header_merging() {
        let http = ScriptedHttp::new(vec![ok_json("{}")]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let mut option_headers = HeaderMap::new();
        option_headers.insert("x-custom", HeaderValue::from_static("override"));

        let params = get("/test/_search")
            .with_querystring(json!({"q": "foo:bar", "size": 10}))
            .with_headers({
                let mut h = HeaderMap::new();
                h.insert("x-custom", HeaderValue::from_static("base"));
                h
            });
        transport
            .request(
                params,
                RequestOptions {
                    querystring: Some(json!({"size": 20})),
                    headers: Some(option_headers),
                    opaque_id: Some("trace-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let captured = http.captured.lock();
        let request = &captured[0];
        assert_eq!(request.method, Method::GET);
        assert!(request.url.contains("q=foo%3Abar"));
        assert!(request.url.contains("size=20"));
        assert_eq!(request.headers.get("x-custom").unwrap(), "override");
        assert_eq!(request.headers.get("x-opaque-id").unwrap(), "trace-1");
        let ua = request.headers.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.starts_with("keel-transport/"));
    }

    #[tokio::test]
    async fn test_gzip_request_body() {
        let http = ScriptedHttp::new(vec![ok_json("{}")]);
        let transport = transport_over(
            &http,
            &["http://a:9200"],
            TransportConfig {
                compression: Some("gzip".into()),
                ..Default::default()
            },
        );

        let params = get("/doc").with_body(RequestBody::Json(json!({"field": "value"})));
        transport.request(params, RequestOptions::default()).await.unwrap();

        let captured = http.captured.lock();
        let request = &captured[0];
        assert_eq!(request.headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        let body = request.body.as_ref().unwrap();
        assert_eq!(
            request.headers.get(CONTENT_LENGTH).unwrap().to_str().unwrap(),
            body.len().to_string()
        );

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        let decoded = http::decode_body(&headers, Bytes::from(body.clone())).unwrap();
        assert_eq!(decoded.as_ref(), br#"{"field":"value"}"#);
    }

    #[tokio::test]
    async fn test_bulk_body_sets_ndjson_content_type() {
        let http = ScriptedHttp::new(vec![ok_json("{}")]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let params = get("/_bulk").with_body(RequestBody::NdJson(vec![
            json!({"index": {}}),
            json!({"field": 1}),
        ]));
        transport.request(params, RequestOptions::default()).await.unwrap();

        let captured = http.captured.lock();
        let request = &captured[0];
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/x-ndjson"
        );
        assert_eq!(
            request.body.as_ref().unwrap().as_slice(),
            b"{\"index\":{}}\n{\"field\":1}\n"
        );
    }

    #[tokio::test]
    async fn test_invalid_compression_is_a_configuration_error() {
        let http = ScriptedHttp::new(vec![]);
        let err = Transport::new(
            pool_of(&http, &["http://a:9200"]),
            TransportConfig {
                compression: Some("brotli".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.error_type(), "configuration");
    }

    #[tokio::test]
    async fn test_abort_before_completion() {
        let http = ScriptedHttp::new(vec![Script::Hang]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let handle = transport.dispatch(get("/slow"), RequestOptions::default());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        // idempotent
        handle.abort();

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, TransportError::RequestAborted));
        // aborted requests never mark the node dead and never retry
        assert!(transport.pool().connections()[0].is_alive());
        assert_eq!(http.calls(), 1);
    }

    #[tokio::test]
    async fn test_abort_after_completion_is_harmless() {
        let http = ScriptedHttp::new(vec![ok_json("{}")]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());

        let handle = transport.dispatch(get("/"), RequestOptions::default());
        let response = handle.handle.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        handle.token.cancel();
    }

    #[tokio::test]
    async fn test_request_ids_roll_from_one() {
        let http = ScriptedHttp::new(vec![ok_json("{}"), ok_json("{}")]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());
        let mut events = transport.subscribe();

        transport.request(get("/"), RequestOptions::default()).await.unwrap();
        transport.request(get("/"), RequestOptions::default()).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::Request(ev) = event {
                seen.push(ev.request_id);
            }
        }
        assert_eq!(seen, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_events_fire_in_causal_order() {
        let http = ScriptedHttp::new(vec![ok_json("{}")]);
        let transport = transport_over(&http, &["http://a:9200"], TransportConfig::default());
        let mut events = transport.subscribe();

        transport.request(get("/"), RequestOptions::default()).await.unwrap();

        match events.try_recv().unwrap() {
            TransportEvent::Request(ev) => assert_eq!(ev.attempts, 0),
            other => panic!("expected request event, got {:?}", other),
        }
        match events.try_recv().unwrap() {
            TransportEvent::Response(ev) => {
                assert_eq!(ev.status_code, Some(200));
                assert!(ev.error.is_none());
            }
            other => panic!("expected response event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sniff_replaces_pool_membership() {
        let nodes_payload = json!({
            "nodes": {
                "node-a": {
                    "http": { "publish_address": "10.0.0.1:9200" },
                    "roles": ["master", "data", "ingest"]
                },
                "node-b": {
                    "http": { "publish_address": "10.0.0.2:9200" },
                    "roles": ["data"]
                }
            }
        });
        let http = ScriptedHttp::new(vec![ok_json(&nodes_payload.to_string())]);
        let transport = transport_over(&http, &["http://seed:9200"], TransportConfig::default());

        let response = transport
            .sniff(SniffReason::Default)
            .await
            .unwrap()
            .unwrap();

        let sniff = response.meta.sniff.as_ref().unwrap();
        assert_eq!(sniff.hosts, 2);
        assert_eq!(sniff.reason, SniffReason::Default);

        let mut ids: Vec<String> = transport
            .pool()
            .connections()
            .iter()
            .map(|c| c.id())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["node-a", "node-b"]);

        // the discovery request hit the configured endpoint
        let captured = http.captured.lock();
        assert!(captured[0].url.contains("_nodes/_all/http"));
    }

    #[tokio::test]
    async fn test_concurrent_sniffs_collapse_to_one() {
        let nodes_payload = json!({ "nodes": {} });
        let http = ScriptedHttp::new(vec![
            Script::Hang,
            ok_json(&nodes_payload.to_string()),
        ]);
        let transport = transport_over(&http, &["http://seed:9200"], TransportConfig::default());

        let first = {
            let t = Arc::clone(&transport);
            tokio::spawn(async move { t.sniff(SniffReason::SniffOnStart).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // second sniff is dropped silently while the first is in flight
        let second = transport.sniff(SniffReason::SniffInterval).await.unwrap();
        assert!(second.is_none());
        assert_eq!(http.calls(), 1);
        first.abort();
    }

    #[test]
    fn test_warnings_are_parsed_with_quoted_commas() {
        let warning =
            "299 keel \"Unknown parameter: \\\"winter\\\", sending it as query parameter\"";
        let mut headers = HeaderMap::new();
        headers.insert(WARNING, HeaderValue::from_str(warning).unwrap());
        headers.append(WARNING, HeaderValue::from_static("299 keel \"second\""));

        let parsed = parse_warnings(&headers).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].contains("winter"));
        assert_eq!(parsed[1], "299 keel \"second\"");

        assert!(parse_warnings(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_merge_querystring_option_wins() {
        let merged = merge_querystring(
            Some(json!({"a": 1, "b": 2})),
            Some(json!({"b": 3, "c": 4})),
        )
        .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));

        assert!(merge_querystring(None, None).is_none());
        assert_eq!(
            merge_querystring(Some(json!({"a": 1})), None).unwrap(),
            json!({"a": 1})
        );
    }

    #[test]
    fn test_split_outside_quotes() {
        let parts = split_outside_quotes("a, b \"x, y\", c");
        assert_eq!(parts, vec!["a", "b \"x, y\"", "c"]);
    }
}
