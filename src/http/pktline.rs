//! Git smart HTTP packet-line framing for outbound responses.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! the prefix itself; `0000` is the flush packet that ends a section.  Only
//! the response side is framed here: request bodies are handed to `git`
//! untouched.
//!
//! The smart protocol is conversational, so a client may act on the first
//! bytes of a response before the server has produced the rest.  Response
//! bytes therefore go through a [`FlushingWriter`], which pushes every write
//! out to the transport immediately instead of letting it sit in a buffer.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// The flush packet.
pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest total packet-line length (prefix included) the format can express.
const MAX_PKT_LEN: usize = 0xFFFF;

/// Buffered bytes at which [`ResponseSink`] sends a chunk even without an
/// explicit flush.
const SINK_HIGH_WATER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Frame `payload` as a single packet line.
pub fn pkt_line(payload: &[u8]) -> io::Result<Vec<u8>> {
    let total_len = payload.len() + 4;
    if total_len > MAX_PKT_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("packet-line payload too large ({} bytes)", payload.len()),
        ));
    }
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write `payload` to `w` as one packet line.
pub async fn encode_line<W>(w: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = pkt_line(payload)?;
    w.write_all(&line).await
}

/// Write the flush packet to `w`.
pub async fn encode_flush<W>(w: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    w.write_all(FLUSH_PKT).await
}

// ---------------------------------------------------------------------------
// Response transport
// ---------------------------------------------------------------------------

/// Write half of a streamed HTTP response body.
///
/// Writes accumulate in a local buffer; `flush` hands the buffered bytes to
/// the response body as one chunk.  The paired receiver feeds
/// `axum::body::Body::from_stream`.  Once the receiver is gone (client
/// disconnected) every flush fails with `BrokenPipe`.
pub struct ResponseSink {
    tx: PollSender<Result<Bytes, io::Error>>,
    buf: BytesMut,
}

impl ResponseSink {
    /// Create a sink and the receiving end of its chunk channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Result<Bytes, io::Error>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx: PollSender::new(tx),
            buf: BytesMut::new(),
        };
        (sink, rx)
    }

    fn poll_send(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Poll::Ready(Ok(()));
        }
        ready!(self.tx.poll_reserve(cx)).map_err(|_| closed())?;
        let chunk = self.buf.split().freeze();
        self.tx.send_item(Ok(chunk)).map_err(|_| closed())?;
        Poll::Ready(Ok(()))
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "response body receiver dropped")
}

impl AsyncWrite for ResponseSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.buf.len() >= SINK_HIGH_WATER {
            ready!(this.poll_send(cx))?;
        }
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_send(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send(cx))?;
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Flush-after-every-write adapter
// ---------------------------------------------------------------------------

/// Wraps a writer so that every successful write is followed by a flush of
/// the inner writer before the write reports completion.
pub struct FlushingWriter<W> {
    inner: W,
    /// Bytes accepted by the inner writer whose flush has not completed yet.
    pending: Option<usize>,
}

impl<W> FlushingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FlushingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let written = match this.pending {
            Some(n) => n,
            None => {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
                this.pending = Some(n);
                n
            }
        };
        let flushed = ready!(Pin::new(&mut this.inner).poll_flush(cx));
        this.pending = None;
        flushed?;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
