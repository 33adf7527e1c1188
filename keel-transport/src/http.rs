//! Pluggable HTTP layer
//!
//! `HttpTransport` is the single seam between the transport and the
//! network: one operation that turns a prepared request into a status,
//! headers, and a body stream. The default implementation wraps a
//! `reqwest` client; tests inject canned implementations.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_ENCODING};
use reqwest::Method;
use url::Url;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::{Result, TransportError};
use crate::types::BodyStream;

/// A prepared HTTP request, ready for the wire
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<HttpBody>,
    /// Per-attempt deadline
    pub timeout: Duration,
}

/// Outgoing body in wire form
pub enum HttpBody {
    Bytes(Bytes),
    Stream(BodyStream),
}

/// Undecoded response: status, headers, and the raw body stream
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

/// The low-level HTTP capability
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<RawResponse>;
}

/// Default HTTP layer backed by reqwest
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(tls: Option<&TlsConfig>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().tcp_nodelay(true);

        if let Some(tls) = tls {
            if tls.skip_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(path) = &tls.ca_cert_path {
                let pem = std::fs::read(path).map_err(|e| {
                    TransportError::Configuration(format!(
                        "unable to read CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| TransportError::Configuration(format!("invalid CA certificate: {}", e)))?;
                builder = builder.add_root_certificate(cert);
            }
            builder = match tls.min_version {
                Some(TlsVersion::Tls12) => builder.min_tls_version(reqwest::tls::Version::TLS_1_2),
                Some(TlsVersion::Tls13) => builder.min_tls_version(reqwest::tls::Version::TLS_1_3),
                None => builder,
            };
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Configuration(format!("http client build failed: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<RawResponse> {
        let timeout_ms = request.timeout.as_millis() as u64;

        let mut req = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .timeout(request.timeout);

        if let Some(body) = request.body {
            req = match body {
                HttpBody::Bytes(bytes) => req.body(bytes),
                HttpBody::Stream(stream) => req.body(reqwest::Body::wrap_stream(stream)),
            };
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body: BodyStream = Box::pin(response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                let kind = if e.is_timeout() {
                    std::io::ErrorKind::TimedOut
                } else {
                    std::io::ErrorKind::Other
                };
                std::io::Error::new(kind, e)
            })
        }));

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// Drain a body stream into one buffer
pub async fn read_body(mut stream: BodyStream, timeout_ms: u64) -> Result<Bytes> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;
        out.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(out))
}

/// Decode a collected body according to its `Content-Encoding`
pub fn decode_body(headers: &HeaderMap, raw: Bytes) -> Result<Bytes> {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut decoded = Vec::new();
    if encoding.contains("gzip") {
        GzDecoder::new(raw.as_ref())
            .read_to_end(&mut decoded)
            .map_err(|e| TransportError::Connection(format!("gzip decode failed: {}", e)))?;
    } else if encoding.contains("deflate") {
        DeflateDecoder::new(raw.as_ref())
            .read_to_end(&mut decoded)
            .map_err(|e| TransportError::Connection(format!("deflate decode failed: {}", e)))?;
    } else {
        return Ok(raw);
    }
    Ok(Bytes::from(decoded))
}

/// Gzip a request body held in memory
pub fn gzip(raw: &[u8]) -> Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(raw)
        .map_err(|e| TransportError::Serialization(format!("gzip encode failed: {}", e)))?;
    encoder
        .finish()
        .map(Bytes::from)
        .map_err(|e| TransportError::Serialization(format!("gzip encode failed: {}", e)))
}

/// Gzip a body stream chunk by chunk, emitting the trailer when the
/// inner stream ends
pub fn gzip_stream(input: BodyStream) -> BodyStream {
    let state = Some((input, GzEncoder::new(Vec::new(), Compression::default())));
    Box::pin(futures::stream::unfold(state, |state| async move {
        let (mut input, mut encoder) = state?;
        loop {
            match input.next().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = encoder.write_all(&chunk) {
                        return Some((Err(e), None));
                    }
                    let pending = encoder.get_mut();
                    if !pending.is_empty() {
                        let out = Bytes::from(std::mem::take(pending));
                        return Some((Ok(out), Some((input, encoder))));
                    }
                    // encoder buffered the chunk; keep feeding
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    return match encoder.finish() {
                        Ok(tail) => Some((Ok(Bytes::from(tail)), None)),
                        Err(e) => Some((Err(e), None)),
                    };
                }
            }
        }
    }))
}
