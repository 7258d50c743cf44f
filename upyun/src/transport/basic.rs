use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{HeaderValue, CONNECTION, HOST};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use super::{wire_headers, Headers, HttpRequest, HttpResponse, RequestBody, Transport};
use crate::{ByteStream, UpyunConfig, UpyunError, UpyunResult};

type OutgoingBody = UnsyncBoxBody<Bytes, io::Error>;

/// HTTP/1.1 over a fresh TCP connection per request (`Connection: close`).
///
/// Connecting, waiting for the response head and every body read are each
/// bounded by the configured timeout. An upload only counts as idle while no
/// body bytes move.
#[derive(Debug, Clone)]
pub struct BasicTransport {
    timeout: Duration,
    user_agent: String,
}

impl BasicTransport {
    pub fn new(config: &UpyunConfig) -> Self {
        Self {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
        }
    }

    fn build(
        &self,
        request: HttpRequest,
        sent: Arc<AtomicU64>,
    ) -> UpyunResult<hyper::Request<OutgoingBody>> {
        let mut headers =
            wire_headers(request.method, &request.headers, &request.body, &self.user_agent)?;
        let host = HeaderValue::from_str(&request.host)
            .map_err(|e| UpyunError::transport(format!("invalid host '{}'", request.host), e))?;
        headers.insert(HOST, host);
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let body = match request.body {
            RequestBody::Empty => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            RequestBody::Bytes(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
            RequestBody::Stream { stream, .. } => {
                let frames = stream.map_ok(move |chunk| {
                    sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    Frame::data(chunk)
                });
                StreamBody::new(frames).boxed_unsync()
            }
        };

        let mut outgoing = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(request.uri.as_str())
            .body(body)
            .map_err(|e| UpyunError::transport(format!("invalid request uri '{}'", request.uri), e))?;
        *outgoing.headers_mut() = headers;
        Ok(outgoing)
    }

    async fn timed<F, T, E>(&self, what: &str, fut: F) -> UpyunResult<T>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(UpyunError::transport(format!("{what} failed"), e)),
            Err(_) => Err(timed_out(what)),
        }
    }
}

#[async_trait]
impl Transport for BasicTransport {
    async fn send(&self, request: HttpRequest) -> UpyunResult<HttpResponse> {
        let addr = with_default_port(&request.host);
        let sent = Arc::new(AtomicU64::new(0));
        let outgoing = self.build(request, sent.clone())?;

        let stream = self.timed("connect", TcpStream::connect(addr.as_str())).await?;
        let (mut sender, connection) = self
            .timed("handshake", hyper::client::conn::http1::handshake(TokioIo::new(stream)))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });

        let exchange = sender.send_request(outgoing);
        tokio::pin!(exchange);
        let response = loop {
            match tokio::time::timeout(self.timeout, &mut exchange).await {
                Ok(result) => {
                    break result
                        .map_err(|e| UpyunError::transport(format!("request to {addr} failed"), e))?
                }
                // request body still moving
                Err(_) if sent.swap(0, Ordering::Relaxed) > 0 => continue,
                Err(_) => return Err(timed_out("response")),
            }
        };

        let status = response.status();
        let headers = Headers::from(response.headers());
        tracing::trace!(%addr, status = status.as_u16(), "basic transport response");

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: response_body(response.into_body(), self.timeout),
        })
    }
}

fn timed_out(what: &str) -> UpyunError {
    UpyunError::transport(
        format!("{what} timed out"),
        io::Error::new(io::ErrorKind::TimedOut, "timed out"),
    )
}

fn with_default_port(host: &str) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:80")
    }
}

/// Data frames of `body`, each read bounded by `timeout`
fn response_body(body: Incoming, timeout: Duration) -> ByteStream {
    Box::pin(async_stream::try_stream! {
        let mut frames = BodyStream::new(body);
        loop {
            let next = tokio::time::timeout(timeout, frames.next())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?;
            let Some(frame) = next else {
                break;
            };
            if let Ok(data) = frame.map_err(io::Error::other)?.into_data() {
                yield data;
            }
        }
    })
}
