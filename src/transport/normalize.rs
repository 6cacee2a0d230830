//! Server-side normalization of the first inbound HTTP request.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::strategy::RequestNormalizer;
use crate::transport::HEADER_TERMINATOR;

// Wire reads are chunked; the scan carries a token-sized overlap between
// chunks so a token straddling a boundary is still found.
const READ_CHUNK: usize = 1024;

/// Reads from a source until a token appears in the accumulated bytes.
///
/// The state survives `Poll::Pending`, so the scan resumes where it left off
/// instead of restarting. Bytes read past the token in the final chunk are
/// kept — the caller decides what to do with them.
#[derive(Debug)]
pub(crate) struct ReadUntil {
    token: Vec<u8>,
    buf: BytesMut,
    scanned: usize,
    found_end: Option<usize>,
}

impl ReadUntil {
    pub(crate) fn new(token: &[u8]) -> Self {
        Self {
            token: token.to_vec(),
            buf: BytesMut::new(),
            scanned: 0,
            found_end: None,
        }
    }

    /// Drive reads from `src` until the token is seen.
    ///
    /// Resolves with the total number of bytes accumulated. End of stream
    /// before the token is an error wrapping [`io::ErrorKind::UnexpectedEof`].
    pub(crate) fn poll_fill<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        src: &mut R,
    ) -> Poll<io::Result<usize>> {
        if self.found_end.is_some() {
            return Poll::Ready(Ok(self.buf.len()));
        }
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let mut read_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut *src).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before the token was found",
                )));
            }
            self.buf.extend_from_slice(filled);

            let start = self.scanned.saturating_sub(self.token.len() - 1);
            if let Some(pos) = find(&self.buf[start..], &self.token) {
                self.found_end = Some(start + pos + self.token.len());
                return Poll::Ready(Ok(self.buf.len()));
            }
            self.scanned = self.buf.len();
        }
    }

    /// Index one past the end of the token, once found.
    pub(crate) fn token_end(&self) -> Option<usize> {
        self.found_end
    }

    pub(crate) fn into_buf(self) -> BytesMut {
        self.buf
    }
}

fn find(haystack: &[u8], token: &[u8]) -> Option<usize> {
    haystack.windows(token.len()).position(|w| w == token)
}

/// A byte stream whose first inbound HTTP request is normalized.
///
/// The first read pulls at least the request line and headers off the wire,
/// runs them through the normalizer, and then serves the normalized head
/// followed by any body bytes that were read past the terminator. Once that
/// buffer drains the wrapper is a transparent pass-through; it never refills
/// the buffer from the wire.
///
/// Whatever an on-path observer saw, the request delivered to the reader is
/// valid, well-formed HTTP — exact recovery of the original bytes is not
/// guaranteed and not attempted.
pub struct NormalizeStream<S> {
    inner: S,
    normalizer: Option<Arc<dyn RequestNormalizer>>,
    state: ReadState,
}

// One-way: ReadingFirst -> Draining -> PassThrough, or Failed.
enum ReadState {
    ReadingFirst(ReadUntil),
    Draining { buf: BytesMut },
    PassThrough,
    Failed,
}

impl<S> NormalizeStream<S> {
    /// Wrap `inner`. With `normalizer == None` every read is forwarded
    /// unchanged.
    pub fn new(inner: S, normalizer: Option<Arc<dyn RequestNormalizer>>) -> Self {
        Self {
            inner,
            normalizer,
            state: ReadState::ReadingFirst(ReadUntil::new(HEADER_TERMINATOR)),
        }
    }

    /// Get a reference to the inner stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consume the wrapper and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn failed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "request normalization failed; connection unusable",
    )
}

impl<S: AsyncRead + Unpin> AsyncRead for NormalizeStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::PassThrough => {
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }
                ReadState::ReadingFirst(_) if this.normalizer.is_none() => {
                    this.state = ReadState::PassThrough;
                }
                ReadState::ReadingFirst(read_until) => {
                    ready!(read_until.poll_fill(cx, &mut this.inner))?;
                    let end = read_until
                        .token_end()
                        .expect("poll_fill resolved, so the token was found");

                    let normalizer = this
                        .normalizer
                        .as_ref()
                        .expect("checked above that a normalizer is configured");
                    let raw = std::mem::replace(read_until, ReadUntil::new(HEADER_TERMINATOR))
                        .into_buf();
                    match normalizer.normalize(&raw[..end]) {
                        Ok(normalized) => {
                            // Normalized head first, then any over-read body
                            // bytes, in wire order.
                            let mut staged = BytesMut::from(&normalized[..]);
                            staged.extend_from_slice(&raw[end..]);
                            this.state = ReadState::Draining { buf: staged };
                        }
                        Err(e) => {
                            this.state = ReadState::Failed;
                            return Poll::Ready(Err(e.into()));
                        }
                    }
                }
                ReadState::Draining { buf: staged } => {
                    if staged.is_empty() {
                        this.state = ReadState::PassThrough;
                        continue;
                    }
                    let n = staged.len().min(buf.remaining());
                    buf.put_slice(&staged.split_to(n));
                    return Poll::Ready(Ok(()));
                }
                ReadState::Failed => return Poll::Ready(Err(failed_error())),
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NormalizeStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
