//! WebSocket flows presented as plain byte streams.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// Adapter presenting a post-handshake WebSocket conversation as an
/// [`AsyncRead`] + [`AsyncWrite`] byte pipe.
///
/// Each write becomes one binary frame; reads concatenate incoming binary
/// frames into a continuous stream, holding any surplus for later reads.
/// Text, ping, and pong frames are skipped. A Close frame — or the library's
/// connection-closed condition — reads as a clean end of stream rather than
/// an error, and `poll_shutdown` performs the closing handshake.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    leftover: BytesMut,
}

impl<S> WsByteStream<S> {
    /// Wrap a completed WebSocket conversation.
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            leftover: BytesMut::new(),
        }
    }
}

fn into_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

fn is_normal_close(err: &WsError) -> bool {
    matches!(err, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsByteStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.leftover.is_empty() {
                let n = this.leftover.len().min(buf.remaining());
                buf.put_slice(&this.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() <= buf.remaining() {
                        buf.put_slice(&data);
                        return Poll::Ready(Ok(()));
                    }
                    this.leftover.extend_from_slice(&data);
                }
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {} // text/ping/pong carry no stream bytes
                Some(Err(e)) if is_normal_close(&e) => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(into_io_error(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsByteStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(into_io_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(into_io_error)?;
        // Nudge the frame toward the wire; a pending flush completes on a
        // later poll.
        if let Poll::Ready(Err(e)) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(Err(into_io_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_flush(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_normal_close(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_close(cx)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if is_normal_close(&e) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(into_io_error(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{accept_async, client_async};

    use super::*;

    // An in-memory client/server WebSocket pair.
    async fn ws_pair() -> (
        WsByteStream<tokio::io::DuplexStream>,
        WsByteStream<tokio::io::DuplexStream>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move { accept_async(server_io).await.unwrap() });
        let (client_ws, _) = client_async("ws://localhost/", client_io).await.unwrap();
        let server_ws = server.await.unwrap();
        (WsByteStream::new(client_ws), WsByteStream::new(server_ws))
    }

    #[tokio::test]
    async fn test_bytes_round_trip() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"ping over frames").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 16];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping over frames");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_small_reads_concatenate_frames() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"abc").await.unwrap();
        client.write_all(b"defg").await.unwrap();
        client.flush().await.unwrap();

        // Two frames, read back through a tiny buffer as one byte sequence.
        let mut collected = Vec::new();
        let mut buf = [0u8; 2];
        while collected.len() < 7 {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(collected, b"abcdefg");
    }

    #[tokio::test]
    async fn test_close_reads_as_eof() {
        let (mut client, mut server) = ws_pair().await;

        client.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "close frame must read as clean EOF");
    }
}
