//! Client-side dialing and stack composition.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use zeroize::Zeroize;

use crate::crypto::CipherStream;
use crate::error::{Error, Result};
use crate::strategy::StrategyEngine;
use crate::transport::{Conn, Io, TransformStream, WsByteStream};
use crate::HANDSHAKE_TIMEOUT;

/// Options recognized by [`dial`].
#[derive(Clone, Default)]
pub struct DialOpts {
    /// Strategy program to apply to the upgrade request. Compiled once per
    /// dial through [`DialOpts::engine`]; naming a strategy without an
    /// engine is a configuration error.
    pub strategy: Option<String>,

    /// The external transform engine used to compile [`DialOpts::strategy`].
    pub engine: Option<Arc<dyn StrategyEngine>>,

    /// Pre-shared key for the AES-OFB overlay: 16, 24, or 32 bytes for
    /// AES-128, AES-192, or AES-256. Ignored when the scheme carries TLS.
    pub encryption_key: Option<Vec<u8>>,

    /// TLS configuration for `https`/`wss` addresses. When the scheme
    /// demands TLS and this is unset, a default configuration trusting the
    /// webpki roots is used.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

/// Establish a flow to a remote listener.
///
/// The address may use the `http`, `https`, `ws`, or `wss` scheme; a bare
/// `host:port` is treated as `http`. The WebSocket upgrade request is
/// written through a [`TransformStream`] carrying the compiled strategy, so
/// the on-wire request is the strategy's output while the handshake machinery
/// above remains oblivious.
///
/// Any failure aborts the dial; no partial stream is ever returned.
pub async fn dial(network: &str, address: &str, mut opts: DialOpts) -> Result<Conn> {
    match network {
        "tcp" | "tcp4" | "tcp6" => {}
        other => return Err(Error::UnsupportedProtocol(other.to_string())),
    }

    let (scheme, rest) = match address.split_once("://") {
        Some((scheme @ ("http" | "https" | "ws" | "wss"), rest)) => (scheme, rest),
        Some((other, _)) => return Err(Error::UnsupportedProtocol(other.to_string())),
        None => ("http", address),
    };
    let use_tls = matches!(scheme, "https" | "wss");

    let strategy = match (&opts.strategy, &opts.engine) {
        (Some(name), Some(engine)) => Some(engine.compile(name)?),
        (Some(_), None) => {
            return Err(Error::config(
                "a transform strategy was named but no engine was provided",
            ))
        }
        (None, _) => None,
    };

    let (authority, path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, format!("/{path}")),
        None => (rest, String::new()),
    };
    let connect_addr = if authority.contains(':') {
        authority.to_string()
    } else if use_tls {
        format!("{authority}:443")
    } else {
        format!("{authority}:80")
    };

    let tcp = TcpStream::connect(&connect_addr).await?;
    tcp.set_nodelay(true)?;
    let local_addr = tcp.local_addr().ok();
    let peer_addr = tcp.peer_addr().ok();

    // The transform must observe the plaintext upgrade request, so it wraps
    // the TLS stream rather than the raw socket.
    let io: Box<dyn Io> = if use_tls {
        let config = opts.tls.clone().unwrap_or_else(default_tls_config);
        let host = authority.rsplit_once(':').map_or(authority, |(h, _)| h);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::tls(format!("invalid server name {host:?}: {e}")))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::tls(e.to_string()))?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let transformed = TransformStream::new(io, strategy);

    let ws_scheme = if use_tls { "wss" } else { "ws" };
    let request = format!("{ws_scheme}://{authority}{path}").into_client_request()?;
    let (ws, _response) = timeout(HANDSHAKE_TIMEOUT, client_async(request, transformed))
        .await
        .map_err(|_| Error::Timeout(HANDSHAKE_TIMEOUT.as_millis() as u64))??;
    tracing::debug!(address, "websocket established");

    let stream = WsByteStream::new(ws);
    let io: Box<dyn Io> = match opts.encryption_key.take() {
        Some(mut key) if !use_tls => {
            // A wrap failure drops (and thereby closes) the flow.
            let wrapped = CipherStream::new(stream, &key);
            key.zeroize();
            Box::new(wrapped?)
        }
        _ => Box::new(stream),
    };

    Ok(Conn::new(io, local_addr, peer_addr))
}

fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    // Advertising h2 can make a fronting CDN select HTTP/2, which the
    // HTTP/1.1 upgrade parser cannot speak.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::listener::{ListenOpts, WsListener};
    use crate::test::{CountingStrategy, TestEngine};

    #[tokio::test]
    async fn test_rejects_unsupported_network() {
        let err = dial("udp", "127.0.0.1:1", DialOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(p) if p == "udp"));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_scheme() {
        let err = dial("tcp", "ftp://127.0.0.1:1", DialOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(p) if p == "ftp"));
    }

    #[tokio::test]
    async fn test_strategy_without_engine_is_config_error() {
        let opts = DialOpts {
            strategy: Some("anything".into()),
            ..DialOpts::default()
        };
        let err = dial("tcp", "127.0.0.1:1", opts).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_strategy_compile_failure_aborts_dial() {
        let opts = DialOpts {
            strategy: Some("invalid".into()),
            engine: Some(Arc::new(TestEngine::default())),
            ..DialOpts::default()
        };
        let err = dial("tcp", "127.0.0.1:1", opts).await.unwrap_err();
        assert!(matches!(err, Error::Strategy(_)));
    }

    #[tokio::test]
    async fn test_invalid_key_length_aborts_dial() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let accepting = tokio::spawn(async move {
            // The handshake itself succeeds; only the client-side wrap fails.
            let _ = listener.accept().await;
        });

        let opts = DialOpts {
            encryption_key: Some(vec![0u8; 5]),
            ..DialOpts::default()
        };
        let err = dial("tcp", &addr, opts).await.unwrap_err();
        assert!(matches!(err, Error::EncryptionKey(5)));
        accepting.abort();
    }

    async fn echo_once(listener: WsListener, expect: &'static [u8], reply: &'static [u8]) {
        let mut conn = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], expect);
        conn.write_all(reply).await.unwrap();
        conn.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_plain() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();
        let server = tokio::spawn(echo_once(listener, b"hello", b"world"));

        let mut conn = dial("tcp", &addr, DialOpts::default()).await.unwrap();
        conn.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_with_strategy_and_cipher() {
        let engine = Arc::new(TestEngine::default());
        let key = b"0123456789abcdef".to_vec();

        let listener = WsListener::bind(
            "127.0.0.1:0",
            ListenOpts {
                normalizer: Some(engine.normalizer()),
                encryption_key: Some(key.clone()),
                ..ListenOpts::default()
            },
        )
        .await
        .unwrap();
        let addr = listener.local_addr().to_string();

        let server = tokio::spawn(echo_once(
            listener,
            b"up-up-down-down-left-right-left-right-b-a-start",
            b"cheat activated",
        ));

        let opts = DialOpts {
            strategy: Some("decoy-header".into()),
            engine: Some(engine.clone()),
            encryption_key: Some(key),
            ..DialOpts::default()
        };
        let mut conn = dial("tcp", &addr, opts).await.unwrap();

        conn.write_all(b"up-up-down-down-left-right-left-right-b-a-start")
            .await
            .unwrap();

        let mut buf = [0u8; 15];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cheat activated");
        server.await.unwrap();

        // The strategy ran exactly once, over the full upgrade request.
        let seen = engine.last_strategy().unwrap().seen();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with(b"GET /"));
        assert!(seen[0].windows(4).any(|w| w == b"\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_scheme_variants_accepted() {
        for scheme in ["http://", "ws://", ""] {
            let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
                .await
                .unwrap();
            let addr = format!("{scheme}{}", listener.local_addr());
            let server = tokio::spawn(echo_once(listener, b"x", b"y"));

            let mut conn = dial("tcp", &addr, DialOpts::default()).await.unwrap();
            conn.write_all(b"x").await.unwrap();
            let mut buf = [0u8; 1];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"y");
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dial_reports_addresses() {
        let listener = WsListener::bind("127.0.0.1:0", ListenOpts::default())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let server = tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
        });

        let conn = dial("tcp", &addr.to_string(), DialOpts::default())
            .await
            .unwrap();
        assert_eq!(conn.peer_addr(), Some(addr));
        assert!(conn.local_addr().is_some());
        server.await.unwrap();
    }

    // Keep the counting double exercised against the real handshake path.
    #[tokio::test]
    async fn test_strategy_not_reapplied_after_upgrade() {
        let engine = Arc::new(TestEngine::default());
        let listener = WsListener::bind(
            "127.0.0.1:0",
            ListenOpts {
                normalizer: Some(engine.normalizer()),
                ..ListenOpts::default()
            },
        )
        .await
        .unwrap();
        let addr = listener.local_addr().to_string();
        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            for _ in 0..3 {
                let n = conn.read(&mut buf).await.unwrap();
                conn.write_all(&buf[..n]).await.unwrap();
            }
        });

        let opts = DialOpts {
            strategy: Some("decoy-header".into()),
            engine: Some(engine.clone()),
            ..DialOpts::default()
        };
        let mut conn = dial("tcp", &addr, opts).await.unwrap();
        let strategy: Arc<CountingStrategy> = engine.last_strategy().unwrap();

        for msg in [&b"one"[..], b"two", b"three"] {
            conn.write_all(msg).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg);
        }
        assert_eq!(strategy.seen().len(), 1);
        server.await.unwrap();
    }
}
