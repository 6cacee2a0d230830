//! AES-OFB keystream cipher over an async byte stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::{Aes128, Aes192, Aes256};
use bytes::{Buf, BytesMut};
use ofb::cipher::{KeyIvInit, StreamCipher};
use ofb::Ofb;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::{AES_128_KEY_SIZE, AES_192_KEY_SIZE, AES_256_KEY_SIZE, BLOCK_SIZE};
use crate::error::{Error, Result};

/// An AES output-feedback keystream seeded with an all-zero IV.
///
/// The key length selects the variant: 16, 24, or 32 bytes for AES-128,
/// AES-192, or AES-256. Two endpoints that construct keystreams from the
/// same key produce identical streams, so no IV or state is exchanged on
/// the wire.
pub struct OfbKeystream(Variant);

enum Variant {
    Aes128(Ofb<Aes128>),
    Aes192(Ofb<Aes192>),
    Aes256(Ofb<Aes256>),
}

impl OfbKeystream {
    /// Create a keystream from raw key bytes.
    ///
    /// Fails with [`Error::EncryptionKey`] if the length does not select an
    /// AES variant.
    pub fn new(key: &[u8]) -> Result<Self> {
        let iv = [0u8; BLOCK_SIZE];
        let variant = match key.len() {
            AES_128_KEY_SIZE => Variant::Aes128(
                Ofb::new_from_slices(key, &iv).map_err(|_| Error::EncryptionKey(key.len()))?,
            ),
            AES_192_KEY_SIZE => Variant::Aes192(
                Ofb::new_from_slices(key, &iv).map_err(|_| Error::EncryptionKey(key.len()))?,
            ),
            AES_256_KEY_SIZE => Variant::Aes256(
                Ofb::new_from_slices(key, &iv).map_err(|_| Error::EncryptionKey(key.len()))?,
            ),
            n => return Err(Error::EncryptionKey(n)),
        };
        Ok(Self(variant))
    }

    /// XOR `data` in place with the next `data.len()` keystream bytes.
    ///
    /// OFB is symmetric: the same operation encrypts and decrypts.
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.0 {
            Variant::Aes128(c) => c.apply_keystream(data),
            Variant::Aes192(c) => c.apply_keystream(data),
            Variant::Aes256(c) => c.apply_keystream(data),
        }
    }
}

impl std::fmt::Debug for OfbKeystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self.0 {
            Variant::Aes128(_) => "Aes128",
            Variant::Aes192(_) => "Aes192",
            Variant::Aes256(_) => "Aes256",
        };
        f.debug_tuple("OfbKeystream").field(&variant).finish()
    }
}

/// A byte stream whose two directions run through independent AES-OFB
/// keystreams.
///
/// Reads decrypt, writes encrypt. Ciphertext length equals plaintext length
/// and byte boundaries are preserved, so the wrapper is transparent to
/// everything above it.
///
/// The write side consumes keystream the moment a buffer is accepted, so the
/// usual [`AsyncWrite`] contract applies strictly: after `Poll::Pending` the
/// caller must retry with the same buffer.
#[derive(Debug)]
pub struct CipherStream<S> {
    inner: S,
    read_stream: OfbKeystream,
    write_stream: OfbKeystream,
    // Ciphertext not yet accepted by `inner`, and the plaintext length it
    // stands for.
    pending: BytesMut,
    pending_plain: usize,
}

impl<S> CipherStream<S> {
    /// Wrap `inner`, deriving both directional keystreams from `key`.
    pub fn new(inner: S, key: &[u8]) -> Result<Self> {
        Ok(Self {
            inner,
            read_stream: OfbKeystream::new(key)?,
            write_stream: OfbKeystream::new(key)?,
            pending: BytesMut::new(),
            pending_plain: 0,
        })
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

impl<S: AsyncRead + AsyncWrite + Unpin> CipherStream<S> {
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CipherStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.read_stream.apply(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CipherStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            // A flush may have drained ciphertext the caller was never
            // credited for; settle that before consuming more keystream.
            if this.pending_plain > 0 {
                return Poll::Ready(Ok(std::mem::take(&mut this.pending_plain)));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            this.pending.extend_from_slice(buf);
            this.write_stream.apply(&mut this.pending[..]);
            this.pending_plain = buf.len();
        }
        ready!(this.poll_drain_pending(cx))?;
        Poll::Ready(Ok(std::mem::take(&mut this.pending_plain)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
