//! Client-side interception of the first outbound HTTP request.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::strategy::HttpStrategy;
use crate::transport::HEADER_TERMINATOR;

/// A byte stream that rewrites the first outbound HTTP request.
///
/// The WebSocket client library writes its upgrade request through this
/// wrapper in one or more calls. Writes are buffered until the header
/// terminator `\r\n\r\n` has been seen, at which point the whole request is
/// handed to the strategy and the transformed bytes go on the wire. From
/// then on — including the upgrade response and every frame after it — the
/// wrapper is a transparent pass-through.
///
/// `poll_write` reports the number of bytes the *caller* supplied, not the
/// number of transformed bytes written. A generic HTTP client treats a short
/// write as a fatal protocol error, so the pre-transform count is the only
/// answer that preserves the byte-stream abstraction.
///
/// Without a strategy the wrapper is the identity.
pub struct TransformStream<S> {
    inner: S,
    strategy: Option<Arc<dyn HttpStrategy>>,
    state: WriteState,
}

// One-way: Buffering -> Flushing (-> Flushed) -> PassThrough, or Failed.
enum WriteState {
    // Accumulating the first request. `scanned` records how far the buffer
    // has been searched for the terminator so repeated small writes don't
    // rescan from the start.
    Buffering { buf: BytesMut, scanned: usize },
    // Transformed bytes are being written to the wire. `accepted` is the
    // caller's byte count to report once the flush completes.
    Flushing { pending: Bytes, accepted: usize },
    // The flush completed inside poll_flush/poll_shutdown; the next
    // poll_write still owes the caller `accepted`.
    Flushed { accepted: usize },
    PassThrough,
    Failed,
}

impl<S> TransformStream<S> {
    /// Wrap `inner`. With `strategy == None` every write is forwarded
    /// unchanged.
    pub fn new(inner: S, strategy: Option<Arc<dyn HttpStrategy>>) -> Self {
        Self {
            inner,
            strategy,
            state: WriteState::Buffering {
                buf: BytesMut::new(),
                scanned: 0,
            },
        }
    }

    /// Get a reference to the inner stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the inner stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the wrapper and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
}

fn failed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        "transform strategy failed; connection unusable",
    )
}

impl<S: AsyncRead + Unpin> AsyncRead for TransformStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TransformStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriteState::PassThrough => {
                    return Pin::new(&mut this.inner).poll_write(cx, buf);
                }
                WriteState::Buffering { .. } if this.strategy.is_none() || buf.is_empty() => {
                    return Pin::new(&mut this.inner).poll_write(cx, buf);
                }
                WriteState::Buffering { buf: acc, scanned } => {
                    acc.extend_from_slice(buf);
                    // Back up past the overlap so a terminator split across
                    // writes is still seen.
                    let start = scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
                    if find_terminator(&acc[start..]).is_none() {
                        *scanned = acc.len().saturating_sub(HEADER_TERMINATOR.len() - 1);
                        return Poll::Ready(Ok(buf.len()));
                    }

                    let strategy = this
                        .strategy
                        .as_ref()
                        .expect("checked above that a strategy is configured");
                    match strategy.apply(acc) {
                        Ok(transformed) => {
                            this.state = WriteState::Flushing {
                                pending: Bytes::from(transformed),
                                accepted: buf.len(),
                            };
                        }
                        Err(e) => {
                            this.state = WriteState::Failed;
                            return Poll::Ready(Err(e.into()));
                        }
                    }
                }
                WriteState::Flushing { pending, accepted } => {
                    while !pending.is_empty() {
                        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, pending))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        pending.advance(n);
                    }
                    let accepted = *accepted;
                    this.state = WriteState::PassThrough;
                    return Poll::Ready(Ok(accepted));
                }
                WriteState::Flushed { accepted } => {
                    let accepted = *accepted;
                    this.state = WriteState::PassThrough;
                    return Poll::Ready(Ok(accepted));
                }
                WriteState::Failed => return Poll::Ready(Err(failed_error())),
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let WriteState::Flushing { pending, accepted } = &mut this.state {
            while !pending.is_empty() {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, pending))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                pending.advance(n);
            }
            let accepted = *accepted;
            this.state = WriteState::Flushed { accepted };
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
