//! Resumable uploads over the REST API.
//!
//! A session is opened with `X-Upyun-Multi-Stage: initiate`, fed with parts
//! in any order and closed with `complete` or `cancel`. Only the 36-character
//! upload id has to survive a restart; [`ResumableUpload`] serializes to
//! exactly what [`ResumableUploader::resume`] needs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek};
use tracing::{debug, instrument};

use crate::hasher::BlockReader;
use crate::rest::RestApi;
use crate::transport::Method;
use crate::{Metadata, UpyunError, UpyunResult, UploadId, UploadedPart};

pub const STAGE_HEADER: &str = "X-Upyun-Multi-Stage";
pub const UUID_HEADER: &str = "X-Upyun-Multi-Uuid";
pub const PART_ID_HEADER: &str = "X-Upyun-Part-Id";
pub const PART_SIZE_HEADER: &str = "X-Upyun-Multi-Part-Size";
pub const LENGTH_HEADER: &str = "X-Upyun-Multi-Length";
pub const TYPE_HEADER: &str = "X-Upyun-Multi-Type";
pub const DISORDER_HEADER: &str = "X-Upyun-Multi-Disorder";
pub const MD5_HEADER: &str = "X-Upyun-Multi-Md5";

/// Part size used when none is requested
pub const DEFAULT_PART_SIZE: u64 = 1024 * 1024;

/// A resumable session, fresh or restored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableUpload {
    pub key: String,
    pub upload_id: UploadId,
    pub part_size: u64,
    pub file_size: Option<u64>,
}

impl ResumableUpload {
    /// Number of parts a file of `file_size` bytes splits into
    pub fn part_count(&self) -> Option<u64> {
        self.file_size
            .map(|size| size.div_ceil(self.part_size.max(1)).max(1))
    }
}

/// What to announce when opening a session
#[derive(Debug, Clone, Default)]
pub struct ResumableOptions {
    pub part_size: Option<u64>,
    pub total_length: Option<u64>,
    pub content_type: Option<String>,
}

#[derive(Deserialize)]
struct PartsReply {
    #[serde(default)]
    parts: BTreeMap<String, PartEntry>,
}

#[derive(Deserialize)]
struct PartEntry {
    size: u64,
    #[serde(default, alias = "checksum")]
    md5: String,
}

/// Drives resumable sessions for one bucket
#[derive(Clone)]
pub struct ResumableUploader {
    rest: RestApi,
    chunk_size: usize,
    concurrency: usize,
}

impl ResumableUploader {
    pub(crate) fn new(rest: RestApi, chunk_size: usize, concurrency: usize) -> Self {
        Self {
            rest,
            chunk_size,
            concurrency: concurrency.max(1),
        }
    }

    /// Open a session for `key`
    #[instrument(skip(self, options), fields(bucket = %self.rest.bucket()))]
    pub async fn initiate(&self, key: &str, options: ResumableOptions) -> UpyunResult<ResumableUpload> {
        let part_size = options.part_size.unwrap_or(DEFAULT_PART_SIZE);
        let mut request = self
            .rest
            .signed(Method::Put, key, "", 0)
            .header(STAGE_HEADER, "initiate")
            .header(DISORDER_HEADER, "true")
            .header(PART_SIZE_HEADER, part_size.to_string());
        if let Some(length) = options.total_length {
            request = request.header(LENGTH_HEADER, length.to_string());
        }
        if let Some(content_type) = options.content_type {
            request = request.header(TYPE_HEADER, content_type);
        }

        let response = self.rest.execute(request).await?;
        let raw = response.headers.get(UUID_HEADER).unwrap_or_default().to_string();
        let upload_id = UploadId::parse(raw.clone()).map_err(|_| {
            UpyunError::service(
                response.request_id(),
                response.status,
                format!("invalid upload id {raw:?} in initiate reply"),
                String::new(),
            )
        })?;
        debug!(%upload_id, "resumable session opened");

        Ok(ResumableUpload {
            key: key.to_string(),
            upload_id,
            part_size,
            file_size: options.total_length,
        })
    }

    /// Rebuild a session from a persisted id. Ids that are not 36
    /// characters are rejected without contacting the server.
    pub fn resume(
        &self,
        key: &str,
        upload_id: &str,
        part_size: u64,
        file_size: Option<u64>,
    ) -> UpyunResult<ResumableUpload> {
        Ok(ResumableUpload {
            key: key.to_string(),
            upload_id: UploadId::parse(upload_id)?,
            part_size,
            file_size,
        })
    }

    /// Store one part. Sending the same `part_id` again overwrites it.
    pub async fn upload(&self, upload: &ResumableUpload, part_id: u64, data: Bytes) -> UpyunResult<()> {
        let request = self
            .rest
            .signed(Method::Put, &upload.key, "", data.len() as u64)
            .header(STAGE_HEADER, "upload")
            .header(UUID_HEADER, upload.upload_id.as_str())
            .header(PART_ID_HEADER, part_id.to_string())
            .body(data);
        self.rest.execute(request).await?;
        debug!(upload_id = %upload.upload_id, part_id, "part stored");
        Ok(())
    }

    /// Close the session; the optional MD5 lets the server verify the whole object
    pub async fn complete(&self, upload: &ResumableUpload, md5: Option<&str>) -> UpyunResult<Metadata> {
        let mut request = self
            .rest
            .signed(Method::Put, &upload.key, "", 0)
            .header(STAGE_HEADER, "complete")
            .header(UUID_HEADER, upload.upload_id.as_str());
        if let Some(md5) = md5 {
            request = request.header(MD5_HEADER, md5);
        }
        let response = self.rest.execute(request).await?;
        Ok(response.headers.upyun_meta())
    }

    /// Abandon the session and discard stored parts
    pub async fn cancel(&self, upload: &ResumableUpload) -> UpyunResult<()> {
        let request = self
            .rest
            .signed(Method::Delete, &upload.key, "", 0)
            .header(UUID_HEADER, upload.upload_id.as_str());
        self.rest.execute(request).await?;
        Ok(())
    }

    /// Parts the server already holds, ordered by id
    pub async fn list_uploaded_parts(&self, upload: &ResumableUpload) -> UpyunResult<Vec<UploadedPart>> {
        let request = self
            .rest
            .signed(Method::Get, &upload.key, "", 0)
            .header(UUID_HEADER, upload.upload_id.as_str());
        let response = self.rest.execute(request).await?;
        let status = response.status;
        let request_id = response.request_id();
        let reply: PartsReply = response.json().await?;

        let mut parts = reply
            .parts
            .into_iter()
            .map(|(id, entry)| {
                let id = id.parse::<u64>().map_err(|_| {
                    UpyunError::service(
                        request_id.clone(),
                        status,
                        format!("invalid part id {id:?}"),
                        String::new(),
                    )
                })?;
                Ok(UploadedPart {
                    id,
                    size: entry.size,
                    checksum: entry.md5,
                })
            })
            .collect::<UpyunResult<Vec<_>>>()?;
        parts.sort_by_key(|p| p.id);
        Ok(parts)
    }

    /// Open a session sized for the file at `path`
    pub async fn start_file(
        &self,
        key: &str,
        path: impl AsRef<Path>,
        part_size: Option<u64>,
    ) -> UpyunResult<ResumableUpload> {
        let size = tokio::fs::metadata(path.as_ref()).await?.len();
        self.initiate(
            key,
            ResumableOptions {
                part_size,
                total_length: Some(size),
                content_type: None,
            },
        )
        .await
    }

    /// Send every part of `path` the server does not hold yet, then
    /// complete with the whole-file MD5. Safe to call again after a failure.
    pub async fn upload_file(&self, upload: &ResumableUpload, path: impl AsRef<Path>) -> UpyunResult<Metadata> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();
        if let Some(expected) = upload.file_size.filter(|expected| *expected != size) {
            return Err(UpyunError::client(format!(
                "file is {size} bytes but the session was opened for {expected}"
            )));
        }
        self.upload_reader(upload, file, size).await
    }

    /// [`upload_file`](Self::upload_file) over any seekable reader
    pub async fn upload_reader<R>(&self, upload: &ResumableUpload, reader: R, size: u64) -> UpyunResult<Metadata>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let part_size = upload.part_size.max(1);
        let part_count = size.div_ceil(part_size).max(1);
        let stored: BTreeSet<u64> = self
            .list_uploaded_parts(upload)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let missing: Vec<u64> = (0..part_count).filter(|id| !stored.contains(id)).collect();
        debug!(upload_id = %upload.upload_id, part_count, missing = missing.len(), "uploading parts");

        let reader = BlockReader::new(reader, size);
        let results: Vec<UpyunResult<()>> = stream::iter(missing)
            .map(|id| {
                let reader = &reader;
                async move {
                    let start = id * part_size;
                    let end = (start + part_size).min(size);
                    let data = reader.read_range(start, end).await?;
                    self.upload(upload, id, data).await
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.into_iter().collect::<UpyunResult<Vec<()>>>()?;

        let md5 = reader.content_md5(self.chunk_size).await?;
        self.complete(upload, Some(&md5)).await
    }
}
