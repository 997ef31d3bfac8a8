//! HTTP chunked-transfer-encoding writer.
//!
//! Buffers appended text/bytes and flushes them as `<hexlen>\r\n<payload>\r\n`
//! chunks over the connection's write half. Write errors are logged and
//! swallowed: the caller tears the connection down regardless, so there is
//! nothing useful to propagate.

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BUFFER_CAPACITY: usize = 4096;

pub struct ChunkedWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(BUFFER_CAPACITY),
        }
    }

    pub fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn push_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    /// Drains the internal buffer as one chunk. Does not close the stream.
    pub async fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let chunk = self.buf.split();
        if let Err(e) = self.write_chunk(&chunk).await {
            debug!("chunked writer flush failed: {e}");
        }
    }

    async fn write_chunk(&mut self, payload: &[u8]) -> std::io::Result<()> {
        let header = format!("{:x}\r\n", payload.len());
        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(payload).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await
    }

    /// Writes raw bytes bypassing chunk framing entirely (binary icon
    /// bodies, or a media body already governed by Content-Length).
    pub async fn raw_write(&mut self, b: &[u8]) {
        if let Err(e) = self.inner.write_all(b).await {
            debug!("raw write failed: {e}");
        }
    }

    /// Flushes any buffered data, then emits the terminating `0\r\n\r\n`.
    pub async fn finish(mut self) -> W {
        self.flush().await;
        if let Err(e) = self.inner.write_all(b"0\r\n\r\n").await {
            debug!("chunked writer finish failed: {e}");
        }
        let _ = self.inner.flush().await;
        self.inner
    }
}
