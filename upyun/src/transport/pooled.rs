use async_trait::async_trait;
use futures_util::TryStreamExt;

use super::{wire_headers, Headers, HttpRequest, HttpResponse, Method, RequestBody, Transport};
use crate::{UpyunConfig, UpyunError, UpyunResult};

/// reqwest-backed transport with a keep-alive connection pool.
///
/// The timeout bounds connecting and each read, never the whole exchange,
/// so long transfers behave as on [`super::BasicTransport`].
///
/// Connection failures are retried up to `connect_retries` times when the
/// body can be replayed; once bytes reach the server nothing is retried.
#[derive(Debug, Clone)]
pub struct PooledTransport {
    client: reqwest::Client,
    connect_retries: u32,
    user_agent: String,
}

impl PooledTransport {
    pub fn new(config: &UpyunConfig) -> UpyunResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .pool_idle_timeout(config.timeout)
            .build()
            .map_err(|e| UpyunError::transport("failed to build HTTP client", e))?;
        Ok(Self {
            client,
            connect_retries: config.connect_retries,
            user_agent: config.user_agent.clone(),
        })
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        headers: &Headers,
        body: RequestBody,
    ) -> UpyunResult<reqwest::RequestBuilder> {
        let map = wire_headers(method, headers, &body, &self.user_agent)?;
        let builder = self.client.request(reqwest_method(method), url);
        let builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Stream { stream, .. } => builder.body(reqwest::Body::wrap_stream(stream)),
        };
        Ok(builder.headers(map))
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Put => reqwest::Method::PUT,
        Method::Post => reqwest::Method::POST,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn send(&self, request: HttpRequest) -> UpyunResult<HttpResponse> {
        let url = format!("http://{}{}", request.host, request.uri);
        let HttpRequest {
            method,
            headers,
            body,
            ..
        } = request;

        let mut attempt = 0u32;
        let mut pending = Some(body);
        let response = loop {
            let Some(body) = pending.take() else {
                return Err(UpyunError::client("request body already consumed"));
            };
            let replay = body.try_clone();
            let builder = self.build(method, &url, &headers, body)?;

            match builder.send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < self.connect_retries && replay.is_some() => {
                    attempt += 1;
                    tracing::debug!(%url, attempt, error = %e, "connect failed, retrying");
                    pending = replay;
                }
                Err(e) => {
                    let message = if e.is_timeout() {
                        format!("request to {url} timed out")
                    } else {
                        format!("request to {url} failed")
                    };
                    return Err(UpyunError::transport(message, e));
                }
            }
        };

        let status = response.status();
        let headers = Headers::from(response.headers());
        let body = response.bytes_stream().map_err(std::io::Error::other);

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: Box::pin(body),
        })
    }
}
