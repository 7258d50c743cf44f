//! Operator-authenticated REST calls against `/<bucket>/<key>`.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::AsyncWrite;

use crate::client::ClientContext;
use crate::hasher::{content_md5, md5_hex};
use crate::progress::{reader_stream, ProgressHandler};
use crate::sign::{http_date, Operator};
use crate::transport::{self, Headers, HttpRequest, HttpResponse, Method, RequestBody};
use crate::{EntryKind, ListEntry, Metadata, UpyunError, UpyunResult};

/// Options for a plain REST `PUT`
#[derive(Default)]
pub struct RestPut {
    /// Send `Content-MD5` so the server verifies the body
    pub checksum: bool,
    /// `Content-Secret` protecting the object URL
    pub secret: Option<String>,
    /// Extra headers, e.g. `x-gmkerl-rotate`
    pub headers: Headers,
    /// Progress while a file body is sent
    pub progress: Option<Box<dyn ProgressHandler>>,
}

/// REST API bound to an operator
#[derive(Clone)]
pub struct RestApi {
    ctx: Arc<ClientContext>,
    operator: Operator,
}

impl RestApi {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> UpyunResult<Self> {
        let operator = ctx.operator()?.clone();
        Ok(Self { ctx, operator })
    }

    pub fn bucket(&self) -> &str {
        &self.ctx.bucket
    }

    /// A signed request for `key` on the REST host. `query` is appended
    /// verbatim and covered by the signature.
    pub(crate) fn signed(&self, method: Method, key: &str, query: &str, length: u64) -> HttpRequest {
        let uri = format!("{}{query}", self.ctx.uri(key));
        let date = http_date(Utc::now());
        let authorization = self
            .operator
            .rest_authorization(method.as_str(), &uri, &date, length);
        HttpRequest::new(method, self.ctx.config.rest_host(), uri)
            .header("Date", date)
            .header("Authorization", authorization)
    }

    pub(crate) async fn execute(&self, request: HttpRequest) -> UpyunResult<HttpResponse> {
        transport::execute(self.ctx.transport.as_ref(), request).await
    }

    /// Space used under `key`, in bytes
    pub async fn usage(&self, key: &str) -> UpyunResult<u64> {
        let response = self.execute(self.signed(Method::Get, key, "?usage", 0)).await?;
        let status = response.status;
        let request_id = response.request_id();
        let text = response.text().await?;
        text.trim().parse().map_err(|_| {
            UpyunError::service(request_id, status, "usage is not a number", text.clone())
        })
    }

    /// Upload `data` to `key`; returns the `x-upyun-*` metadata
    pub async fn put_bytes(&self, key: &str, data: Bytes, options: RestPut) -> UpyunResult<Metadata> {
        let checksum = options.checksum.then(|| md5_hex(&data));
        let length = data.len() as u64;
        self.put(key, RequestBody::Bytes(data), length, checksum, options)
            .await
    }

    /// Stream a local file to `key`
    pub async fn put_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        mut options: RestPut,
    ) -> UpyunResult<Metadata> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        let length = file.metadata().await?.len();
        let checksum = if options.checksum {
            Some(content_md5(&mut file, self.ctx.config.chunk_size).await?)
        } else {
            None
        };
        let stream = reader_stream(file, length, self.ctx.config.chunk_size, options.progress.take());
        self.put(key, RequestBody::Stream { stream, length }, length, checksum, options)
            .await
    }

    async fn put(
        &self,
        key: &str,
        body: RequestBody,
        length: u64,
        checksum: Option<String>,
        options: RestPut,
    ) -> UpyunResult<Metadata> {
        let mut request = self
            .signed(Method::Put, key, "", length)
            .headers(&options.headers)
            .header("Mkdir", "true");
        if let Some(md5) = checksum {
            request = request.header("Content-MD5", md5);
        }
        if let Some(secret) = options.secret {
            request = request.header("Content-Secret", secret);
        }
        let response = self.execute(request.body(body)).await?;
        Ok(response.headers.upyun_meta())
    }

    /// Download `key` into memory
    pub async fn get(&self, key: &str) -> UpyunResult<Bytes> {
        self.execute(self.signed(Method::Get, key, "", 0))
            .await?
            .bytes()
            .await
    }

    /// Stream `key` into `sink`, reporting progress when the size is known.
    /// Returns the number of bytes written.
    pub async fn get_to<W>(
        &self,
        key: &str,
        sink: &mut W,
        progress: Option<&mut (dyn ProgressHandler + '_)>,
    ) -> UpyunResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let response = self.execute(self.signed(Method::Get, key, "", 0)).await?;
        let total = response.content_length();
        transport::copy_to_sink(
            response.body,
            sink,
            self.ctx.config.chunk_size,
            total,
            progress,
        )
        .await
    }

    pub async fn delete(&self, key: &str) -> UpyunResult<()> {
        self.execute(self.signed(Method::Delete, key, "", 0)).await?;
        Ok(())
    }

    /// Create a directory
    pub async fn mkdir(&self, key: &str) -> UpyunResult<()> {
        let request = self.signed(Method::Post, key, "", 0).header("Folder", "true");
        self.execute(request).await?;
        Ok(())
    }

    /// Entries directly under the directory `key`
    pub async fn list(&self, key: &str) -> UpyunResult<Vec<ListEntry>> {
        let response = self.execute(self.signed(Method::Get, key, "", 0)).await?;
        let status = response.status;
        let request_id = response.request_id();
        let text = response.text().await?;
        parse_listing(&text)
            .map_err(|message| UpyunError::service(request_id, status, message, text.clone()))
    }

    /// Object metadata from a `HEAD`
    pub async fn info(&self, key: &str) -> UpyunResult<Metadata> {
        let response = self.execute(self.signed(Method::Head, key, "", 0)).await?;
        Ok(response.headers.upyun_meta())
    }

    /// Ask the CDN to refresh `keys`. `domain` defaults to
    /// `<bucket>.b0.upaiyun.com`. Returns the keys UPYUN refused.
    pub async fn purge<S: AsRef<str> + Sync>(&self, keys: &[S], domain: Option<&str>) -> UpyunResult<Vec<String>> {
        if keys.is_empty() {
            return Err(UpyunError::client("nothing to purge"));
        }
        let default_domain = format!("{}.b0.upaiyun.com", self.ctx.bucket);
        let domain = domain.unwrap_or(&default_domain);
        let urls = purge_urls(domain, keys);

        let date = http_date(Utc::now());
        let authorization = self
            .operator
            .purge_authorization(&self.ctx.bucket, &urls, &date);
        let request = HttpRequest::new(Method::Post, self.ctx.config.hosts.purge.clone(), "/purge/")
            .header("Date", date)
            .header("Authorization", authorization)
            .header("Accept", "application/json")
            .form(&[("purge", urls.as_str())]);

        let reply: PurgeReply = self.execute(request).await?.json().await?;
        let prefix = format!("http://{domain}");
        Ok(reply
            .invalid_domain_of_url
            .into_iter()
            .map(|url| url.strip_prefix(&prefix).map(str::to_string).unwrap_or(url))
            .collect())
    }
}

#[derive(Deserialize)]
struct PurgeReply {
    #[serde(default)]
    invalid_domain_of_url: Vec<String>,
}

fn purge_urls<S: AsRef<str>>(domain: &str, keys: &[S]) -> String {
    keys.iter()
        .map(|k| format!("http://{domain}/{}\n", k.as_ref().trim_start_matches('/')))
        .collect()
}

/// Parse a directory listing: one `name\ttype\tsize\ttime` record per line.
/// An empty body is an empty directory.
pub fn parse_listing(body: &str) -> Result<Vec<ListEntry>, String> {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(parse_listing_line)
        .collect()
}

fn parse_listing_line(line: &str) -> Result<ListEntry, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [name, kind, size, time] = fields[..] else {
        return Err(format!("malformed listing line: {line:?}"));
    };
    let kind = match kind {
        "F" => EntryKind::Folder,
        "N" => EntryKind::File,
        other => return Err(format!("unknown entry type {other:?}")),
    };
    Ok(ListEntry {
        name: name.to_string(),
        kind,
        size: size.parse().map_err(|_| format!("bad size {size:?}"))?,
        time: time.parse().map_err(|_| format!("bad time {time:?}"))?,
    })
}
