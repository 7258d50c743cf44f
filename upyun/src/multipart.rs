//! Legacy multipart upload against `m0.api.upyun.com`.
//!
//! An upload walks `Sized → Initiated → Uploading(pass) → Finalizing → Done`
//! and may drop into `Failed` from any step:
//!
//! 1. initiate with a policy signed by the form secret; the server hands
//!    back a save token, a token secret and an all-false block status;
//! 2. upload every pending block (policy signed by the token secret) through
//!    a bounded worker pool; each reply carries the server's full status and
//!    the best snapshot of a pass replaces the local one;
//! 3. finalize once every block is acknowledged.
//!
//! Passes are capped by [`MultipartRules::max_passes`](crate::MultipartRules).

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::{debug, info, instrument, warn};

use crate::client::ClientContext;
use crate::hasher::{md5_hex, BlockReader};
use crate::sign::{encode_policy, policy_signature};
use crate::transport::{self, form::MultipartForm, HttpRequest, Method};
use crate::{UpyunError, UpyunResult};

/// Keys the finalize reply carries that are not object metadata
pub const SYSTEM_KEYS: [&str; 4] = ["last_modified", "signature", "bucket_name", "path"];

/// Where an upload currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartState {
    Sized,
    Initiated,
    Uploading { pass: u32 },
    Finalizing,
    Done,
    Failed,
}

/// Per-block acknowledgement flags, indexed by block number
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockStatus(Vec<bool>);

impl BlockStatus {
    /// All blocks pending
    pub fn new(blocks: usize) -> Self {
        Self(vec![false; blocks])
    }

    /// Accepts a JSON array of booleans or 0/1 integers
    pub fn from_json(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        items
            .iter()
            .map(|item| match item {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => match n.as_u64() {
                    Some(0) => Some(false),
                    Some(1) => Some(true),
                    _ => None,
                },
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of acknowledged blocks
    pub fn completed(&self) -> usize {
        self.0.iter().filter(|done| **done).count()
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|done| *done)
    }

    /// Indexes still waiting for an acknowledgement
    pub fn pending(&self) -> Vec<u64> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i as u64)
            .collect()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }
}

/// Session issued by the initiate call
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub remote_key: String,
    pub total_size: u64,
    pub block_size: u64,
    pub block_count: u64,
    pub expiration: i64,
    pub save_token: String,
    token_secret: String,
}

impl UploadSession {
    fn block_range(&self, index: u64) -> (u64, u64) {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.total_size);
        (start, end.max(start))
    }
}

struct PolicyReply {
    status: u16,
    request_id: Option<String>,
    body: Map<String, Value>,
}

struct BlockAck {
    status: u16,
    request_id: Option<String>,
    snapshot: BlockStatus,
}

/// Outcome of one block upload
enum BlockFailure {
    /// Counts as a missing acknowledgement; the next pass tries again
    Retry(UpyunError),
    /// Stops the whole upload
    Fatal(UpyunError),
}

/// Uploads files through the multipart API
#[derive(Clone)]
pub struct MultipartUploader {
    ctx: Arc<ClientContext>,
    secret: String,
}

impl MultipartUploader {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> UpyunResult<Self> {
        let secret = ctx.form_secret()?.to_string();
        Ok(Self { ctx, secret })
    }

    /// Upload a local file
    pub async fn upload_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        block_size: Option<u64>,
    ) -> UpyunResult<Map<String, Value>> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        self.upload(key, file, size, block_size).await
    }

    /// Upload an in-memory buffer
    pub async fn upload_bytes(
        &self,
        key: &str,
        data: Bytes,
        block_size: Option<u64>,
    ) -> UpyunResult<Map<String, Value>> {
        let size = data.len() as u64;
        self.upload(key, std::io::Cursor::new(data), size, block_size)
            .await
    }

    /// Upload `size` bytes from `reader` to `key`; returns the object
    /// metadata reported by the finalize call.
    #[instrument(skip(self, reader), fields(bucket = %self.ctx.bucket))]
    pub async fn upload<R>(
        &self,
        key: &str,
        reader: R,
        size: u64,
        block_size: Option<u64>,
    ) -> UpyunResult<Map<String, Value>>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let rules = &self.ctx.config.multipart;
        if size > rules.max_file_size {
            return Err(UpyunError::client(format!(
                "file size {size} exceeds the {} byte limit",
                rules.max_file_size
            )));
        }

        let block_size = rules.block_size(block_size);
        let block_count = rules.block_count(size, block_size);
        debug!(state = ?MultipartState::Sized, size, block_size, block_count);

        let reader = BlockReader::new(reader, size);
        match self.run(key, &reader, block_size, block_count).await {
            Ok(meta) => {
                info!(state = ?MultipartState::Done, key, "multipart upload finished");
                Ok(meta)
            }
            Err(e) => {
                warn!(state = ?MultipartState::Failed, key, error = %e, "multipart upload failed");
                Err(e)
            }
        }
    }

    async fn run<R>(
        &self,
        key: &str,
        reader: &BlockReader<R>,
        block_size: u64,
        block_count: u64,
    ) -> UpyunResult<Map<String, Value>>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let rules = &self.ctx.config.multipart;
        let file_hash = reader.content_md5(self.ctx.config.chunk_size).await?;
        let (session, mut status) = self
            .initiate(key, reader.size(), block_size, block_count, file_hash)
            .await?;
        debug!(state = ?MultipartState::Initiated, save_token = %session.save_token);

        let mut pass = 0u32;
        let mut last_status = 200u16;
        let mut last_request_id = None;
        while !status.is_complete() {
            if pass >= rules.max_passes {
                return Err(UpyunError::service(
                    last_request_id,
                    last_status,
                    "upload failed within retry budget",
                    format!(
                        "{} of {} blocks acknowledged after {pass} passes",
                        status.completed(),
                        status.len()
                    ),
                ));
            }
            pass += 1;
            let pending = status.pending();
            debug!(state = ?MultipartState::Uploading { pass }, pending = pending.len());

            let results: Vec<Result<BlockAck, BlockFailure>> = stream::iter(pending)
                .map(|index| self.upload_block(&session, reader, index))
                .buffer_unordered(rules.concurrency.max(1))
                .collect()
                .await;

            let mut best: Option<BlockStatus> = None;
            for result in results {
                match result {
                    Ok(ack) => {
                        last_status = ack.status;
                        last_request_id = ack.request_id;
                        if best
                            .as_ref()
                            .map_or(true, |b| ack.snapshot.completed() > b.completed())
                        {
                            best = Some(ack.snapshot);
                        }
                    }
                    Err(BlockFailure::Retry(e)) => {
                        if let Some(code) = e.status() {
                            last_status = code;
                            last_request_id = e.request_id().map(str::to_string);
                        }
                        warn!(pass, error = %e, "block upload failed, will retry");
                    }
                    Err(BlockFailure::Fatal(e)) => return Err(e),
                }
            }
            if let Some(best) = best {
                status = best;
            }
        }

        debug!(state = ?MultipartState::Finalizing);
        self.finalize(&session).await
    }

    async fn initiate(
        &self,
        key: &str,
        total_size: u64,
        block_size: u64,
        block_count: u64,
        file_hash: String,
    ) -> UpyunResult<(UploadSession, BlockStatus)> {
        let remote_key = format!("/{}", key.trim_start_matches('/'));
        let expiration = Utc::now().timestamp() + self.ctx.config.multipart.expiration_secs;
        let mut fields = Map::new();
        fields.insert("expiration".into(), json!(expiration));
        fields.insert("file_blocks".into(), json!(block_count));
        fields.insert("file_hash".into(), json!(file_hash));
        fields.insert("file_size".into(), json!(total_size));
        fields.insert("path".into(), json!(remote_key));

        let reply = self.post_policy(&fields, &self.secret, None).await?;
        let invalid = |message: &str| {
            UpyunError::service(
                reply.request_id.clone(),
                reply.status,
                message.to_string(),
                Value::Object(reply.body.clone()).to_string(),
            )
        };

        let save_token = reply
            .body
            .get("save_token")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("initiate reply lacks save_token"))?
            .to_string();
        let token_secret = reply
            .body
            .get("token_secret")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("initiate reply lacks token_secret"))?
            .to_string();
        let status = reply
            .body
            .get("status")
            .and_then(BlockStatus::from_json)
            .ok_or_else(|| invalid("initiate reply has no block status"))?;
        if status.len() as u64 != block_count {
            return Err(invalid(&format!(
                "server reports {} blocks, expected {block_count}",
                status.len()
            )));
        }

        Ok((
            UploadSession {
                remote_key,
                total_size,
                block_size,
                block_count,
                expiration,
                save_token,
                token_secret,
            },
            status,
        ))
    }

    async fn upload_block<R>(
        &self,
        session: &UploadSession,
        reader: &BlockReader<R>,
        index: u64,
    ) -> Result<BlockAck, BlockFailure>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let (start, end) = session.block_range(index);
        let data = reader
            .read_range(start, end)
            .await
            .map_err(BlockFailure::Fatal)?;

        let mut fields = Map::new();
        fields.insert("expiration".into(), json!(session.expiration));
        fields.insert("block_index".into(), json!(index));
        fields.insert("block_hash".into(), json!(md5_hex(&data)));
        fields.insert("save_token".into(), json!(session.save_token));

        let (policy, signature) =
            sign_policy(&fields, &session.token_secret).map_err(BlockFailure::Fatal)?;
        let reply = self
            .send_policy(policy, signature, Some(data))
            .await
            .map_err(BlockFailure::Retry)?;

        let snapshot = reply
            .body
            .get("status")
            .and_then(BlockStatus::from_json)
            .filter(|s| s.len() as u64 == session.block_count)
            .ok_or_else(|| {
                BlockFailure::Fatal(UpyunError::service(
                    reply.request_id.clone(),
                    reply.status,
                    format!("malformed block status for block {index}"),
                    Value::Object(reply.body.clone()).to_string(),
                ))
            })?;
        debug!(index, completed = snapshot.completed(), "block acknowledged");

        Ok(BlockAck {
            status: reply.status,
            request_id: reply.request_id,
            snapshot,
        })
    }

    async fn finalize(&self, session: &UploadSession) -> UpyunResult<Map<String, Value>> {
        let mut fields = Map::new();
        fields.insert("expiration".into(), json!(session.expiration));
        fields.insert("save_token".into(), json!(session.save_token));

        let mut meta = self
            .post_policy(&fields, &session.token_secret, None)
            .await?
            .body;
        for key in SYSTEM_KEYS {
            meta.remove(key);
        }
        Ok(meta)
    }

    /// POST a signed policy, urlencoded or with a `file` part
    async fn post_policy(
        &self,
        fields: &Map<String, Value>,
        secret: &str,
        file: Option<Bytes>,
    ) -> UpyunResult<PolicyReply> {
        let (policy, signature) = sign_policy(fields, secret)?;
        self.send_policy(policy, signature, file).await
    }

    async fn send_policy(
        &self,
        policy: String,
        signature: String,
        file: Option<Bytes>,
    ) -> UpyunResult<PolicyReply> {
        let host = self.ctx.config.hosts.multipart.clone();
        let uri = format!("/{}/", self.ctx.bucket);

        let request = match file {
            None => HttpRequest::new(Method::Post, host, uri)
                .form(&[("policy", policy.as_str()), ("signature", signature.as_str())]),
            Some(data) => HttpRequest::new(Method::Post, host, uri).multipart(
                MultipartForm::new()
                    .text("policy", policy)
                    .text("signature", signature)
                    .file("file", "file", data),
            ),
        };

        let response = transport::execute(self.ctx.transport.as_ref(), request).await?;
        let status = response.status;
        let request_id = response.request_id();
        let body = response.json::<Map<String, Value>>().await?;
        Ok(PolicyReply {
            status,
            request_id,
            body,
        })
    }
}

fn sign_policy(fields: &Map<String, Value>, secret: &str) -> UpyunResult<(String, String)> {
    Ok((encode_policy(fields)?, policy_signature(fields, secret)?))
}
