use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::form::FormUploader;
use crate::multipart::MultipartUploader;
use crate::pretreat::Pretreatment;
use crate::progress::ProgressHandler;
use crate::receipt::{UploadMode, UploadReceipt};
use crate::rest::{RestApi, RestPut};
use crate::resumable::{ResumableOptions, ResumableUploader};
use crate::sign::Operator;
use crate::transport::{self, Headers, Transport};
use crate::{ListEntry, Metadata, UploadSource, UpyunConfig, UpyunError, UpyunResult};

/// State shared by every API handle of one client
pub(crate) struct ClientContext {
    pub(crate) bucket: String,
    operator: Option<Operator>,
    form_secret: Option<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: UpyunConfig,
}

impl ClientContext {
    pub(crate) fn operator(&self) -> UpyunResult<&Operator> {
        self.operator
            .as_ref()
            .ok_or_else(|| UpyunError::client("operator username and password are required"))
    }

    pub(crate) fn form_secret(&self) -> UpyunResult<&str> {
        self.form_secret
            .as_deref()
            .ok_or_else(|| UpyunError::client("form API secret is required"))
    }

    /// Percent-encoded `/<bucket>/<key>`
    pub(crate) fn uri(&self, key: &str) -> String {
        let key = key.strip_prefix('/').unwrap_or(key);
        encode_path(&format!("/{}/{key}", self.bucket))
    }
}

/// Percent-encode every path segment, keeping `/` and `~`
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Options for [`Upyun::put`].
///
/// With no upload flag the object goes through a plain REST `PUT`. Otherwise
/// the first flag set in the order `form`, `multipart`, `resumable` wins.
#[derive(Default)]
pub struct PutOptions {
    pub form: bool,
    pub multipart: bool,
    pub resumable: bool,
    /// REST only: send `Content-MD5`
    pub checksum: bool,
    /// REST only: `Content-Secret`
    pub secret: Option<String>,
    /// REST only: extra request headers
    pub headers: Headers,
    /// Block or part size for multipart and resumable uploads
    pub block_size: Option<u64>,
    /// Form only: extra policy fields
    pub policy: Map<String, Value>,
    /// REST only: progress while a file is sent
    pub progress: Option<Box<dyn ProgressHandler>>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The upload path these options select
    pub fn mode(&self) -> UploadMode {
        if self.form {
            UploadMode::Form
        } else if self.multipart {
            UploadMode::Multipart
        } else if self.resumable {
            UploadMode::Resumable
        } else {
            UploadMode::Rest
        }
    }

    pub fn with_form(mut self) -> Self {
        self.form = true;
        self
    }

    pub fn with_multipart(mut self) -> Self {
        self.multipart = true;
        self
    }

    pub fn with_resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    pub fn with_checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = Some(bytes);
        self
    }

    pub fn with_progress(mut self, handler: impl ProgressHandler + 'static) -> Self {
        self.progress = Some(Box::new(handler));
        self
    }
}

/// Builder for [`Upyun`]
pub struct UpyunBuilder {
    bucket: String,
    operator: Option<Operator>,
    form_secret: Option<String>,
    config: UpyunConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl UpyunBuilder {
    /// Operator credentials for REST, resumable and pretreatment calls
    pub fn operator(mut self, username: impl Into<String>, password: &str) -> Self {
        self.operator = Some(Operator::new(username, password));
        self
    }

    /// Form API secret for form and multipart uploads
    pub fn form_secret(mut self, secret: impl Into<String>) -> Self {
        self.form_secret = Some(secret.into());
        self
    }

    pub fn config(mut self, config: UpyunConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a ready-made transport instead of the one the config names
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> UpyunResult<Upyun> {
        if self.bucket.is_empty() || self.bucket.contains('/') {
            return Err(UpyunError::client(format!(
                "invalid bucket name {:?}",
                self.bucket
            )));
        }
        let transport = match self.transport {
            Some(transport) => transport,
            None => transport::from_config(&self.config)?,
        };
        Ok(Upyun {
            ctx: Arc::new(ClientContext {
                bucket: self.bucket,
                operator: self.operator,
                form_secret: self.form_secret,
                transport,
                config: self.config,
            }),
        })
    }
}

/// UPYUN client for one bucket.
///
/// Cheap to clone; every clone shares the transport and credentials.
#[derive(Clone)]
pub struct Upyun {
    ctx: Arc<ClientContext>,
}

impl Upyun {
    pub fn builder(bucket: impl Into<String>) -> UpyunBuilder {
        UpyunBuilder {
            bucket: bucket.into(),
            operator: None,
            form_secret: None,
            config: UpyunConfig::default(),
            transport: None,
        }
    }

    /// Client from `UPYUN_BUCKET`, `UPYUN_USERNAME`, `UPYUN_PASSWORD`,
    /// `UPYUN_SECRET` and the config overrides of [`UpyunConfig::from_env`]
    pub fn from_env() -> UpyunResult<Self> {
        let bucket = std::env::var("UPYUN_BUCKET")
            .map_err(|_| UpyunError::client("UPYUN_BUCKET is not set"))?;
        let mut builder = Self::builder(bucket).config(UpyunConfig::from_env()?);
        if let (Ok(username), Ok(password)) =
            (std::env::var("UPYUN_USERNAME"), std::env::var("UPYUN_PASSWORD"))
        {
            builder = builder.operator(username, &password);
        }
        if let Ok(secret) = std::env::var("UPYUN_SECRET") {
            builder = builder.form_secret(secret);
        }
        builder.build()
    }

    pub fn bucket(&self) -> &str {
        &self.ctx.bucket
    }

    pub fn config(&self) -> &UpyunConfig {
        &self.ctx.config
    }

    /// REST API; needs operator credentials
    pub fn rest(&self) -> UpyunResult<RestApi> {
        RestApi::new(self.ctx.clone())
    }

    /// Form API uploads; need the form secret
    pub fn form(&self) -> UpyunResult<FormUploader> {
        FormUploader::new(self.ctx.clone())
    }

    /// Multipart uploads; need the form secret
    pub fn multipart(&self) -> UpyunResult<MultipartUploader> {
        MultipartUploader::new(self.ctx.clone())
    }

    /// Resumable sessions; need operator credentials
    pub fn resumable(&self) -> UpyunResult<ResumableUploader> {
        Ok(ResumableUploader::new(
            self.rest()?,
            self.ctx.config.chunk_size,
            self.ctx.config.multipart.concurrency,
        ))
    }

    /// Media pretreatment; needs operator credentials
    pub fn pretreatment(&self) -> UpyunResult<Pretreatment> {
        Pretreatment::new(self.ctx.clone())
    }

    pub async fn usage(&self, key: &str) -> UpyunResult<u64> {
        self.rest()?.usage(key).await
    }

    /// Store `source` at `key` through the path `options` selects
    pub async fn put(
        &self,
        key: &str,
        source: impl Into<UploadSource>,
        options: PutOptions,
    ) -> UpyunResult<UploadReceipt> {
        let source = source.into();
        let mode = options.mode();
        debug!(key, ?mode, "put");

        match mode {
            UploadMode::Rest => {
                let rest = self.rest()?;
                let rest_options = RestPut {
                    checksum: options.checksum,
                    secret: options.secret,
                    headers: options.headers,
                    progress: options.progress,
                };
                let meta = match source {
                    UploadSource::Bytes(data) => rest.put_bytes(key, data, rest_options).await?,
                    UploadSource::File(path) => rest.put_file(key, path, rest_options).await?,
                };
                Ok(UploadReceipt::from_headers(key, mode, meta))
            }
            UploadMode::Form => {
                let form = self.form()?;
                let data = match source {
                    UploadSource::Bytes(data) => data,
                    UploadSource::File(path) => Bytes::from(tokio::fs::read(path).await?),
                };
                let reply = form.upload(key, data, &options.policy).await?;
                Ok(UploadReceipt::from_json(key, mode, reply))
            }
            UploadMode::Multipart => {
                let multipart = self.multipart()?;
                let meta = match source {
                    UploadSource::Bytes(data) => {
                        multipart.upload_bytes(key, data, options.block_size).await?
                    }
                    UploadSource::File(path) => {
                        multipart.upload_file(key, path, options.block_size).await?
                    }
                };
                Ok(UploadReceipt::from_json(key, mode, meta))
            }
            UploadMode::Resumable => {
                let resumable = self.resumable()?;
                let meta = match source {
                    UploadSource::Bytes(data) => {
                        let size = data.len() as u64;
                        let session = resumable
                            .initiate(
                                key,
                                ResumableOptions {
                                    part_size: options.block_size,
                                    total_length: Some(size),
                                    content_type: None,
                                },
                            )
                            .await?;
                        resumable
                            .upload_reader(&session, Cursor::new(data), size)
                            .await?
                    }
                    UploadSource::File(path) => {
                        let session = resumable.start_file(key, &path, options.block_size).await?;
                        resumable.upload_file(&session, &path).await?
                    }
                };
                Ok(UploadReceipt::from_headers(key, mode, meta))
            }
        }
    }

    pub async fn get(&self, key: &str) -> UpyunResult<Bytes> {
        self.rest()?.get(key).await
    }

    /// Stream `key` into `sink`; see [`RestApi::get_to`]
    pub async fn get_to<W>(
        &self,
        key: &str,
        sink: &mut W,
        progress: Option<&mut (dyn ProgressHandler + '_)>,
    ) -> UpyunResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.rest()?.get_to(key, sink, progress).await
    }

    pub async fn delete(&self, key: &str) -> UpyunResult<()> {
        self.rest()?.delete(key).await
    }

    pub async fn mkdir(&self, key: &str) -> UpyunResult<()> {
        self.rest()?.mkdir(key).await
    }

    pub async fn list(&self, key: &str) -> UpyunResult<Vec<ListEntry>> {
        self.rest()?.list(key).await
    }

    pub async fn info(&self, key: &str) -> UpyunResult<Metadata> {
        self.rest()?.info(key).await
    }

    pub async fn purge<S: AsRef<str> + Sync>(
        &self,
        keys: &[S],
        domain: Option<&str>,
    ) -> UpyunResult<Vec<String>> {
        self.rest()?.purge(keys, domain).await
    }

    pub async fn pretreat(
        &self,
        tasks: &[Value],
        source: &str,
        notify_url: Option<&str>,
        app_name: Option<&str>,
    ) -> UpyunResult<Vec<String>> {
        self.pretreatment()?.submit(tasks, source, notify_url, app_name).await
    }

    pub async fn status<S: AsRef<str> + Sync>(&self, task_ids: &[S]) -> UpyunResult<Map<String, Value>> {
        self.pretreatment()?.status(task_ids).await
    }

    /// False when credentials are missing or the signature does not match
    pub fn verify_callback(&self, callback: &Map<String, Value>) -> bool {
        self.pretreatment()
            .map(|p| p.verify_callback(callback))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Upyun {
        Upyun::builder("demo").build().unwrap()
    }

    #[test]
    fn keys_are_percent_encoded() {
        let c = client();
        assert_eq!(c.ctx.uri("/a b/ü~.txt"), "/demo/a%20b/%C3%BC~.txt");
        assert_eq!(c.ctx.uri("x"), "/demo/x");
        assert_eq!(c.ctx.uri("/"), "/demo/");
    }

    #[test]
    fn routing_priority() {
        assert_eq!(PutOptions::new().mode(), UploadMode::Rest);
        assert_eq!(PutOptions::new().with_multipart().mode(), UploadMode::Multipart);
        assert_eq!(
            PutOptions::new().with_form().with_multipart().mode(),
            UploadMode::Form
        );
        assert_eq!(
            PutOptions::new().with_resumable().with_multipart().mode(),
            UploadMode::Multipart
        );
    }

    #[test]
    fn missing_capabilities_are_client_errors() {
        let c = client();
        assert!(c.rest().err().unwrap().is_client());
        assert!(c.form().err().unwrap().is_client());
        assert!(c.multipart().err().unwrap().is_client());
        assert!(c.pretreatment().err().unwrap().is_client());
        assert!(!c.verify_callback(&Map::new()));
    }

    #[test]
    fn bucket_name_is_validated() {
        assert!(Upyun::builder("").build().is_err());
        assert!(Upyun::builder("a/b").build().is_err());
    }
}
