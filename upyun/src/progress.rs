use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ByteStream;

/// Receives transfer progress for uploads and downloads
pub trait ProgressHandler: Send {
    /// Called after each chunk while bytes remain
    fn update(&mut self, transferred: u64, total: u64);

    /// Called once when `transferred` reaches `total`
    fn finish(&mut self, total: u64);
}

/// Route one progress tick to `update` or `finish`
pub(crate) fn report(handler: &mut dyn ProgressHandler, transferred: u64, total: u64) {
    if total == 0 {
        return;
    }
    if transferred >= total {
        handler.finish(total);
    } else {
        handler.update(transferred, total);
    }
}

/// Body stream over `reader` that yields `chunk_size` pieces and reports
/// progress against `length` as the transport pulls it.
pub fn reader_stream<R>(
    mut reader: R,
    length: u64,
    chunk_size: usize,
    mut handler: Option<Box<dyn ProgressHandler>>,
) -> ByteStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let chunk_size = chunk_size.max(1);
    Box::pin(async_stream::try_stream! {
        let mut sent = 0u64;
        let mut buf = vec![0u8; chunk_size];
        while sent < length {
            let want = chunk_size.min((length - sent) as usize);
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                Err::<(), _>(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source ended after {sent} of {length} bytes"),
                ))?;
            }
            sent += n as u64;
            if let Some(handler) = handler.as_deref_mut() {
                report(handler, sent, length);
            }
            yield Bytes::copy_from_slice(&buf[..n]);
        }
    })
}
