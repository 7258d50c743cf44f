//! HTTP plumbing shared by every API.
//!
//! A [`Transport`] moves one [`HttpRequest`] to a host and hands back the
//! status, headers and a streaming body. Two backends exist: [`BasicTransport`]
//! opens a fresh TCP connection per request, [`PooledTransport`] keeps a
//! reqwest connection pool. Callers never see which one is in use; both turn
//! connection failures into client errors and leave status handling to
//! [`check_status`].

mod basic;
pub mod form;
mod pooled;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, USER_AGENT};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::progress::ProgressHandler;
use crate::{ByteStream, TransportKind, UpyunConfig, UpyunError, UpyunResult};

pub use basic::BasicTransport;
pub use pooled::PooledTransport;

/// Header carrying UPYUN's request id
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Prefix of object metadata headers
pub const META_PREFIX: &str = "x-upyun-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with `value`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `x-upyun-*` headers with the prefix stripped and names lowercased
    pub fn upyun_meta(&self) -> crate::Metadata {
        self.0
            .iter()
            .filter(|(k, _)| {
                k.get(..META_PREFIX.len())
                    .is_some_and(|p| p.eq_ignore_ascii_case(META_PREFIX))
            })
            .map(|(k, v)| (k[META_PREFIX.len()..].to_ascii_lowercase(), v.clone()))
            .collect()
    }
}

impl From<&http::HeaderMap> for Headers {
    fn from(map: &http::HeaderMap) -> Self {
        map.iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Request body. Streams must announce their length up front.
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream { stream: ByteStream, length: u64 },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(b) => b.len() as u64,
            RequestBody::Stream { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies that can be sent again after a failed connect
    pub fn try_clone(&self) -> Option<RequestBody> {
        match self {
            RequestBody::Empty => Some(RequestBody::Empty),
            RequestBody::Bytes(b) => Some(RequestBody::Bytes(b.clone())),
            RequestBody::Stream { .. } => None,
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            RequestBody::Stream { length, .. } => write!(f, "Stream({length} bytes)"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        RequestBody::Bytes(value)
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        RequestBody::Bytes(Bytes::from(value))
    }
}

/// One HTTP exchange to `host` (`name` or `name:port`)
#[derive(Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub host: String,
    /// Path plus query, already percent-encoded
    pub uri: String,
    pub headers: Headers,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, host: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method,
            host: host.into(),
            uri: uri.into(),
            headers: Headers::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn headers(mut self, headers: &Headers) -> Self {
        for (k, v) in headers.iter() {
            self.headers.set(k, v);
        }
        self
    }

    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// `application/x-www-form-urlencoded` body
    pub fn form(self, fields: &[(&str, &str)]) -> Self {
        self.header("Content-Type", "application/x-www-form-urlencoded")
            .body(form::urlencoded(fields))
    }

    /// `multipart/form-data` body
    pub fn multipart(self, form: form::MultipartForm) -> Self {
        let (content_type, body) = form.finish();
        self.header("Content-Type", content_type).body(body)
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: ByteStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }

    pub fn request_id(&self) -> Option<String> {
        self.headers.get(REQUEST_ID_HEADER).map(str::to_string)
    }

    /// Declared body length, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// Collect the whole body
    pub async fn bytes(mut self) -> UpyunResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk.map_err(|e| UpyunError::transport("failed to read response body", e))?;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    pub async fn text(self) -> UpyunResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parse a JSON body. A JSON `error_code` on a 2xx answer is a service error.
    pub async fn json<T: DeserializeOwned>(self) -> UpyunResult<T> {
        let status = self.status;
        let request_id = self.request_id();
        let text = self.text().await?;
        let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            UpyunError::service(
                request_id.clone(),
                status,
                format!("invalid JSON in response: {e}"),
                text.clone(),
            )
        })?;
        if value.get("error_code").is_some() {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("request rejected")
                .to_string();
            return Err(UpyunError::service(request_id, status, message, text));
        }
        serde_json::from_value(value).map_err(|e| {
            UpyunError::service(request_id, status, format!("unexpected response: {e}"), text)
        })
    }
}

/// Headers as both backends put them on the wire: the caller's headers, a
/// default `User-Agent` and a `Content-Length`.
///
/// The length is declared for every non-empty body and for `PUT`, `POST` and
/// `DELETE` even when empty; body-less `GET` and `HEAD` declare none.
pub(crate) fn wire_headers(
    method: Method,
    headers: &Headers,
    body: &RequestBody,
    user_agent: &str,
) -> UpyunResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UpyunError::transport(format!("invalid header name '{name}'"), e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| UpyunError::transport(format!("invalid value for header '{name}'"), e))?;
        map.append(name, value);
    }
    if !map.contains_key(USER_AGENT) {
        let agent = HeaderValue::from_str(user_agent)
            .map_err(|e| UpyunError::transport("invalid user agent", e))?;
        map.insert(USER_AGENT, agent);
    }
    let declares_length =
        !body.is_empty() || matches!(method, Method::Put | Method::Post | Method::Delete);
    if declares_length && !map.contains_key(CONTENT_LENGTH) {
        map.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    }
    Ok(map)
}

/// Moves requests over the wire
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> UpyunResult<HttpResponse>;
}

/// Build the backend the config asks for
pub fn from_config(config: &UpyunConfig) -> UpyunResult<Arc<dyn Transport>> {
    Ok(match config.transport {
        TransportKind::Basic => Arc::new(BasicTransport::new(config)),
        TransportKind::Pooled => Arc::new(PooledTransport::new(config)?),
    })
}

/// Pass 2xx responses through; turn anything else into a service error
/// carrying the drained error body.
pub async fn check_status(response: HttpResponse) -> UpyunResult<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status;
    let reason = response.reason.clone();
    let request_id = response.request_id();
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status, request_id = ?request_id, "request rejected");
    Err(UpyunError::service(request_id, status, reason, body))
}

/// Send and require a 2xx answer
pub async fn execute(transport: &dyn Transport, request: HttpRequest) -> UpyunResult<HttpResponse> {
    tracing::debug!(method = %request.method, host = %request.host, uri = %request.uri, "sending request");
    check_status(transport.send(request).await?).await
}

/// Write a response body to `sink` in pieces of exactly `chunk_size` bytes
/// (the last one may be shorter), whatever sizes the network delivers.
///
/// With a handler and a known non-zero `total`, `update` runs after every
/// piece that leaves bytes outstanding and `finish` once the count reaches
/// `total`. Returns the number of bytes written.
pub async fn copy_to_sink<W>(
    mut body: ByteStream,
    sink: &mut W,
    chunk_size: usize,
    total: Option<u64>,
    mut progress: Option<&mut (dyn ProgressHandler + '_)>,
) -> UpyunResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut pending = BytesMut::new();
    let mut written = 0u64;
    let mut done = false;

    while !done {
        match body.next().await {
            Some(chunk) => {
                let chunk =
                    chunk.map_err(|e| UpyunError::transport("failed to read response body", e))?;
                pending.extend_from_slice(&chunk);
            }
            None => done = true,
        }
        while pending.len() >= chunk_size || (done && !pending.is_empty()) {
            let take = chunk_size.min(pending.len());
            let piece = pending.split_to(take);
            sink.write_all(&piece).await?;
            written += piece.len() as u64;
            if let (Some(handler), Some(total)) = (progress.as_deref_mut(), total) {
                crate::progress::report(handler, written, total);
            }
        }
    }
    sink.flush().await?;
    Ok(written)
}
