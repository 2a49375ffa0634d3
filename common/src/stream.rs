use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::io::AsyncWriteExt;

use crate::pool::PooledClient;

/// Chunked body of a download.
///
/// Holds the pooled session lease and the open-stream permit for as long as the consumer keeps
/// reading. A failure after some chunks were delivered shows up as a final `Err` item.
pub struct ByteStream {
    inner: BoxStream<'static, std::io::Result<Bytes>>,
    _lease: Option<PooledClient>,
    _permit: Option<throttle::OpenStreamGuard>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("lease", &self._lease)
            .finish_non_exhaustive()
    }
}

impl ByteStream {
    pub fn new(
        inner: impl Stream<Item = std::io::Result<Bytes>> + Send + 'static,
        lease: Option<PooledClient>,
        permit: Option<throttle::OpenStreamGuard>,
    ) -> Self {
        Self {
            inner: inner.boxed(),
            _lease: lease,
            _permit: permit,
        }
    }

    /// Drains the stream into `out`, returning the number of bytes written.
    pub async fn write_to<W>(mut self, out: &mut W) -> std::io::Result<u64>
    where
        W: tokio::io::AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        Ok(written)
    }
}

impl Stream for ByteStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_to_stops_at_first_error() {
        let items = vec![
            Ok(Bytes::from_static(b"abc")),
            Err(std::io::Error::other("archive failed")),
            Ok(Bytes::from_static(b"never")),
        ];
        let stream = ByteStream::new(futures::stream::iter(items), None, None);
        let mut out = Vec::new();
        let error = stream
            .write_to(&mut out)
            .await
            .expect_err("second chunk is an error");
        assert_eq!(error.to_string(), "archive failed");
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn write_to_counts_bytes() -> Result<(), anyhow::Error> {
        let items = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cde"))];
        let stream = ByteStream::new(futures::stream::iter(items), None, None);
        let mut out = Vec::new();
        assert_eq!(stream.write_to(&mut out).await?, 5);
        assert_eq!(out, b"abcde");
        Ok(())
    }
}
