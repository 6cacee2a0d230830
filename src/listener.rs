//! Server-side listener: normalization, WebSocket accept, and hand-off.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;

use crate::crypto::CipherStream;
use crate::error::{Error, Result};
use crate::strategy::RequestNormalizer;
use crate::transport::{Conn, Io, NormalizeStream, WsByteStream};
use crate::{CONN_QUEUE_CAPACITY, ERROR_QUEUE_CAPACITY, HANDSHAKE_TIMEOUT};

/// Options recognized by [`WsListener::bind`] and [`WsListener::wrap`].
#[derive(Clone, Default)]
pub struct ListenOpts {
    /// Normalizer applied to the first request of every accepted flow. The
    /// server cannot know which strategy a client ran, so this must repair
    /// any mangling the deployed client population produces. Without it,
    /// first requests are passed to the handshake untouched.
    pub normalizer: Option<Arc<dyn RequestNormalizer>>,

    /// Pre-shared key for the AES-OFB overlay; must match the dialers'.
    pub encryption_key: Option<Vec<u8>>,

    /// TLS acceptor for listeners that terminate TLS themselves.
    pub tls: Option<TlsAcceptor>,
}

/// A listener whose accepted connections are post-handshake WebSocket flows
/// with a normalized first request.
///
/// Every raw socket is clothed in a [`NormalizeStream`] and driven through a
/// time-bounded WebSocket accept in its own task; completed flows wait on a
/// bounded queue until [`accept`] picks them up. Handshake failures do not
/// disturb the listener — they are reported on a bounded side channel and
/// the flow is discarded.
///
/// [`accept`]: WsListener::accept
pub struct WsListener {
    local_addr: SocketAddr,
    conns: AsyncMutex<mpsc::Receiver<Conn>>,
    errors: AsyncMutex<mpsc::Receiver<Error>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    close_once: parking_lot::Mutex<bool>,
}

impl WsListener {
    /// Bind a TCP listener on `addr` and wrap it.
    pub async fn bind(addr: impl ToSocketAddrs, opts: ListenOpts) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::wrap(listener, opts)
    }

    /// Wrap an already-bound TCP listener.
    pub fn wrap(listener: TcpListener, opts: ListenOpts) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::channel(CONN_QUEUE_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            opts,
            conn_tx,
            err_tx,
            closed_rx.clone(),
        ));

        Ok(Self {
            local_addr,
            conns: AsyncMutex::new(conn_rx),
            errors: AsyncMutex::new(err_rx),
            closed_tx,
            closed_rx,
            close_once: parking_lot::Mutex::new(false),
        })
    }

    /// Wait for the next fully handshaken flow.
    ///
    /// After [`close`], every call returns [`Error::ListenerClosed`].
    ///
    /// [`close`]: WsListener::close
    pub async fn accept(&self) -> Result<Conn> {
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(Error::ListenerClosed),
            conn = async { self.conns.lock().await.recv().await } => {
                conn.ok_or(Error::ListenerClosed)
            }
        }
    }

    /// Receive the next non-fatal handshake error.
    ///
    /// The side channel holds at most [`ERROR_QUEUE_CAPACITY`] entries;
    /// errors raised while it is full are dropped without further signal.
    ///
    /// [`ERROR_QUEUE_CAPACITY`]: crate::ERROR_QUEUE_CAPACITY
    pub async fn next_handshake_error(&self) -> Option<Error> {
        self.errors.lock().await.recv().await
    }

    /// Stop accepting and tear down flows that were never handed out.
    ///
    /// Idempotent: a second call returns success without doing anything.
    /// Connections already returned by [`accept`] belong to their callers
    /// and are left alone.
    ///
    /// [`accept`]: WsListener::accept
    pub async fn close(&self) -> Result<()> {
        {
            let mut closed = self.close_once.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        let _ = self.closed_tx.send(true);

        // Refuse late deliveries, then close flows whose handshake succeeded
        // but whose accept() caller never arrived.
        let mut conns = self.conns.lock().await;
        conns.close();
        while let Ok(mut conn) = conns.try_recv() {
            let _ = conn.shutdown().await;
        }
        Ok(())
    }

    /// The wrapped listener's address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    opts: ListenOpts,
    conn_tx: mpsc::Sender<Conn>,
    err_tx: mpsc::Sender<Error>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let (socket, peer_addr) = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    continue;
                }
            },
        };
        let _ = socket.set_nodelay(true);

        tokio::spawn(handshake(
            socket,
            peer_addr,
            opts.clone(),
            conn_tx.clone(),
            err_tx.clone(),
            closed.clone(),
        ));
    }
}

async fn handshake(
    socket: TcpStream,
    peer_addr: SocketAddr,
    opts: ListenOpts,
    conn_tx: mpsc::Sender<Conn>,
    err_tx: mpsc::Sender<Error>,
    mut closed: watch::Receiver<bool>,
) {
    let local_addr = socket.local_addr().ok();

    let io: Box<dyn Io> = match &opts.tls {
        Some(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)).await {
            Ok(Ok(tls)) => Box::new(tls),
            Ok(Err(e)) => {
                report(&err_tx, peer_addr, Error::tls(e.to_string()));
                return;
            }
            Err(_) => {
                report(&err_tx, peer_addr, timeout_error());
                return;
            }
        },
        None => Box::new(socket),
    };

    let normalized = NormalizeStream::new(io, opts.normalizer.clone());
    let ws = match timeout(HANDSHAKE_TIMEOUT, accept_async(normalized)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            report(&err_tx, peer_addr, e.into());
            return;
        }
        Err(_) => {
            report(&err_tx, peer_addr, timeout_error());
            return;
        }
    };

    let stream = WsByteStream::new(ws);
    let io: Box<dyn Io> = match &opts.encryption_key {
        Some(key) => match CipherStream::new(stream, key) {
            Ok(cipher) => Box::new(cipher),
            Err(e) => {
                report(&err_tx, peer_addr, e);
                return;
            }
        },
        None => Box::new(stream),
    };
    let conn = Conn::new(io, local_addr, Some(peer_addr));

    enum Outcome {
        Delivered(std::result::Result<(), mpsc::error::SendError<Conn>>),
        Closed,
    }

    let outcome = tokio::select! {
        delivered = conn_tx.send(conn) => Outcome::Delivered(delivered),
        _ = closed.wait_for(|closed| *closed) => Outcome::Closed,
    };

    match outcome {
        Outcome::Delivered(Err(mpsc::error::SendError(mut conn))) => {
            // The listener went away before delivery.
            let _ = conn.shutdown().await;
            report(&err_tx, peer_addr, Error::ListenerClosed);
        }
        Outcome::Delivered(Ok(())) => {}
        Outcome::Closed => {
            // Undelivered flow dies with the listener.
            report(&err_tx, peer_addr, Error::ListenerClosed);
        }
    }
}

fn timeout_error() -> Error {
    Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64)
}

// Never block a healthy listener on a full side channel.
fn report(err_tx: &mpsc::Sender<Error>, peer_addr: SocketAddr, err: Error) {
    tracing::debug!(%peer_addr, "handshake failed: {}", err);
    if let Err(dropped) = err_tx.try_send(err) {
        tracing::debug!(%peer_addr, "error side channel full, dropping: {}", dropped);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::dialer::{dial, DialOpts};

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        listener.close().await.unwrap();
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_after_close_returns_terminal_error() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        listener.close().await.unwrap();
        for _ in 0..3 {
            assert!(matches!(
                listener.accept().await,
                Err(Error::ListenerClosed)
            ));
        }
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let listener = Arc::new(
            WsListener::bind("127.0.0.1:0", ListenOpts::default())
                .await
                .unwrap(),
        );
        let accepting = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.close().await.unwrap();

        let result = timeout(Duration::from_secs(5), accepting)
            .await
            .expect("accept must unblock on close")
            .unwrap();
        assert!(matches!(result, Err(Error::ListenerClosed)));
    }

    #[tokio::test]
    async fn test_failed_handshake_reaches_side_channel() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        raw.write_all(b"NOT A WEBSOCKET UPGRADE\r\n\r\n").await.unwrap();
        raw.flush().await.unwrap();
        drop(raw);

        let err = timeout(Duration::from_secs(5), listener.next_handshake_error())
            .await
            .expect("handshake failure must be reported")
            .expect("side channel open");
        assert!(err.is_per_flow());
    }

    #[tokio::test]
    async fn test_failed_handshake_does_not_poison_listener() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        // A broken client first...
        let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
        raw.write_all(b"garbage\r\n\r\n").await.unwrap();
        drop(raw);

        // ...then a healthy one still gets through.
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ok");
        });

        let mut conn = dial("tcp", &addr, DialOpts::default()).await.unwrap();
        conn.write_all(b"ok").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_undelivered_flows_are_closed_on_shutdown() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        // Handshake completes and the flow sits in the ready queue.
        let mut conn = dial("tcp", &addr, DialOpts::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        listener.close().await.unwrap();

        // The queued server half was shut down, so the client reads EOF.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .expect("read must complete after listener close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_local_addr_reports_bound_port() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }
}
