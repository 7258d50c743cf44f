//! MD5 digests over bytes and seekable streams, plus lock-guarded range
//! reads used to cut upload blocks out of a shared file handle.

use std::io::SeekFrom;

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;

use crate::{UpyunError, UpyunResult};

/// Sub-chunk size used by [`BlockReader::read_range`]
pub const RANGE_READ_CHUNK: usize = 3 * 8192;

/// Lowercase hex MD5 of a byte slice
pub fn md5_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", Md5::digest(data.as_ref()))
}

/// MD5 of everything from the current position to EOF.
///
/// The reader is always seeked back to where it started, so the caller can
/// hand the same handle to an upload afterwards.
pub async fn content_md5<R>(reader: &mut R, chunk_size: usize) -> UpyunResult<String>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let origin = reader.stream_position().await?;
    let digest = digest_to_end(reader, chunk_size.max(1)).await;
    reader.seek(SeekFrom::Start(origin)).await?;
    digest
}

async fn digest_to_end<R>(reader: &mut R, chunk_size: usize) -> UpyunResult<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// A seekable reader shared by concurrent block uploads.
///
/// The lock is held for one seek + read and released before the caller goes
/// to the network.
pub struct BlockReader<R> {
    inner: Mutex<R>,
    size: u64,
}

impl<R> BlockReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send,
{
    pub fn new(reader: R, size: u64) -> Self {
        Self {
            inner: Mutex::new(reader),
            size,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Digest of the whole stream from offset 0, taken under the same lock
    /// as range reads
    pub async fn content_md5(&self, chunk_size: usize) -> UpyunResult<String> {
        let mut reader = self.inner.lock().await;
        reader.seek(SeekFrom::Start(0)).await?;
        content_md5(&mut *reader, chunk_size).await
    }

    /// Bytes in `[start, end)`. Hitting EOF early is an error.
    pub async fn read_range(&self, start: u64, end: u64) -> UpyunResult<Bytes> {
        if end < start {
            return Err(UpyunError::client(format!(
                "invalid range {start}..{end}"
            )));
        }
        let wanted = (end - start) as usize;
        let mut out = BytesMut::with_capacity(wanted);
        let mut buf = vec![0u8; RANGE_READ_CHUNK.min(wanted.max(1))];

        let mut reader = self.inner.lock().await;
        reader.seek(SeekFrom::Start(start)).await?;
        while out.len() < wanted {
            let take = (wanted - out.len()).min(buf.len());
            let n = reader.read(&mut buf[..take]).await?;
            if n == 0 {
                return Err(UpyunError::client(format!(
                    "unexpected end of file at byte {} (wanted {end})",
                    start + out.len() as u64
                )));
            }
            out.extend_from_slice(&buf[..n]);
        }
        drop(reader);

        Ok(out.freeze())
    }
}
