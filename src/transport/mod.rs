//! Stream wrappers that sit between raw sockets and the WebSocket library.
//!
//! Dialing composes bottom-up: raw TCP (optionally TLS) is wrapped in a
//! [`TransformStream`] so the strategy can rewrite the upgrade request, the
//! WebSocket handshake runs through it, and the resulting conversation is
//! adapted back into a byte pipe by [`WsByteStream`]. Accepting mirrors the
//! order with a [`NormalizeStream`] undoing whatever the client did.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Application bytes                │
//! ├──────────────────────────────────────────────┤
//! │  CipherStream (optional AES-OFB overlay)     │
//! ├──────────────────────────────────────────────┤
//! │  WsByteStream (binary frames ⇄ byte pipe)    │
//! ├──────────────────────────────────────────────┤
//! │  TransformStream / NormalizeStream           │
//! │  (first-request mangling / repair)           │
//! ├──────────────────────────────────────────────┤
//! │  TCP, optionally under TLS                   │
//! └──────────────────────────────────────────────┘
//! ```

mod normalize;
mod transform;
mod ws;

pub use normalize::NormalizeStream;
pub use transform::TransformStream;
pub use ws::WsByteStream;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// End of an HTTP/1.1 request head.
pub(crate) const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Marker for duplex byte streams that can cross the API boundary.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A fully established flow, handed out by [`dial`] and
/// [`WsListener::accept`].
///
/// Behaves as an ordinary duplex byte stream; the transform, WebSocket, and
/// cipher layers underneath are already composed. Dropping the connection
/// closes the underlying socket.
///
/// [`dial`]: crate::dial
/// [`WsListener::accept`]: crate::WsListener::accept
pub struct Conn {
    io: Box<dyn Io>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Conn {
    pub(crate) fn new(
        io: Box<dyn Io>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            io,
            local_addr,
            peer_addr,
        }
    }

    /// Local address of the underlying socket, if known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the underlying socket, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().io).poll_shutdown(cx)
    }
}
