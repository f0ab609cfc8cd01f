//! Encrypted frame transport.
//!
//! [`SecureReader`] and [`SecureWriter`] wrap the two halves of a socket. They
//! pass bytes through untouched until the connection's session holds keys,
//! then decrypt and encrypt `[len][ciphertext][tag]` frames. The HTTP code on
//! top only ever sees plaintext.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use hap_core::error::TransportError;
use hap_core::ids::ConnectionId;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::SessionRegistry;

const READ_CHUNK: usize = 4096;

/// Decrypting side of a connection.
pub struct SecureReader<R> {
    inner: R,
    conn: ConnectionId,
    registry: Arc<SessionRegistry>,
    raw: Vec<u8>,
    plain: Vec<u8>,
    plain_pos: usize,
}

impl<R> SecureReader<R> {
    pub fn new(inner: R, conn: ConnectionId, registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner,
            conn,
            registry,
            raw: Vec::new(),
            plain: Vec::new(),
            plain_pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SecureReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plain_pos < this.plain.len() {
                let available = &this.plain[this.plain_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.plain_pos += n;
                return Poll::Ready(Ok(()));
            }

            if !this.raw.is_empty() {
                let plain = this
                    .registry
                    .open(this.conn, &mut this.raw)
                    .map_err(transport_to_io)?;
                if !plain.is_empty() {
                    this.plain = plain;
                    this.plain_pos = 0;
                    continue;
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            let filled = chunk_buf.filled();
            if filled.is_empty() {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                // EOF inside a frame.
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    TransportError::ConnectionClosed,
                )));
            }
            this.raw.extend_from_slice(filled);
        }
    }
}

/// Encrypting side of a connection.
///
/// Encryption happens under the registry lock inside `poll_write`; the socket
/// write happens afterwards without it.
pub struct SecureWriter<W> {
    inner: W,
    conn: ConnectionId,
    registry: Arc<SessionRegistry>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<W> SecureWriter<W> {
    pub fn new(inner: W, conn: ConnectionId, registry: Arc<SessionRegistry>) -> Self {
        Self {
            inner,
            conn,
            registry,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> SecureWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SecureWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.pending = this
            .registry
            .seal(this.conn, buf)
            .map_err(transport_to_io)?;
        this.pending_pos = 0;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

fn transport_to_io(err: TransportError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Recover the transport error carried by an I/O error, if any.
pub fn transport_error(err: &io::Error) -> Option<&TransportError> {
    err.get_ref()?.downcast_ref::<TransportError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hap_crypto::chacha::FrameCipher;
    use hap_crypto::keys::{EncryptionKey, SessionKeys};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const CONN: ConnectionId = ConnectionId(1);

    fn registry(encrypted: bool) -> Arc<SessionRegistry> {
        let registry = Arc::new(SessionRegistry::new());
        registry.with_session(CONN, |_| ());
        if encrypted {
            registry.stage_keys(
                CONN,
                "ctrl".to_string(),
                SessionKeys {
                    encrypt_key: EncryptionKey::new([1; 32]),
                    decrypt_key: EncryptionKey::new([2; 32]),
                },
            );
            registry.activate_staged(CONN);
        }
        registry
    }

    fn controller_cipher() -> FrameCipher {
        FrameCipher::new([2; 32], [1; 32])
    }

    mod reader {
        use super::*;

        #[tokio::test]
        async fn passes_plaintext_before_verify() {
            let (mut peer, local) = duplex(64);
            let mut reader = SecureReader::new(local, CONN, registry(false));

            peer.write_all(b"hello").await.unwrap();
            drop(peer);

            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, b"hello");
        }

        #[tokio::test]
        async fn decrypts_frames_split_across_reads() {
            let (mut peer, local) = duplex(16);
            let mut reader = SecureReader::new(local, CONN, registry(true));
            let message: Vec<u8> = (0..2100u32).map(|i| (i % 251) as u8).collect();
            let wire = controller_cipher().encrypt(&message).unwrap();

            let writer = tokio::spawn(async move {
                for piece in wire.chunks(7) {
                    peer.write_all(piece).await.unwrap();
                }
            });

            let mut out = vec![0u8; message.len()];
            reader.read_exact(&mut out).await.unwrap();
            writer.await.unwrap();
            assert_eq!(out, message);
        }

        #[tokio::test]
        async fn tampered_frame_fails_read() {
            let (mut peer, local) = duplex(4096);
            let mut reader = SecureReader::new(local, CONN, registry(true));
            let mut wire = controller_cipher().encrypt(b"GET /accessories").unwrap();
            wire[3] ^= 1;
            peer.write_all(&wire).await.unwrap();

            let mut out = [0u8; 16];
            let err = reader.read(&mut out).await.unwrap_err();
            assert!(matches!(
                transport_error(&err),
                Some(TransportError::FrameIntegrity)
            ));
        }

        #[tokio::test]
        async fn eof_inside_frame_is_error() {
            let (mut peer, local) = duplex(4096);
            let mut reader = SecureReader::new(local, CONN, registry(true));
            let wire = controller_cipher().encrypt(b"partial").unwrap();
            peer.write_all(&wire[..wire.len() - 3]).await.unwrap();
            drop(peer);

            let mut out = Vec::new();
            let err = reader.read_to_end(&mut out).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        }
    }

    mod writer {
        use super::*;

        #[tokio::test]
        async fn encrypts_after_verify() {
            let (local, mut peer) = duplex(8192);
            let registry = registry(true);
            let mut writer = SecureWriter::new(local, CONN, registry.clone());
            let message = vec![0x42u8; 2500];

            writer.write_all(&message).await.unwrap();
            writer.flush().await.unwrap();
            drop(writer);

            let mut wire = Vec::new();
            peer.read_to_end(&mut wire).await.unwrap();
            assert_eq!(wire.len(), message.len() + 3 * 18);
            assert_eq!(controller_cipher().decrypt(&wire).unwrap(), message);
            assert_eq!(
                registry.with_session(CONN, |s| s.counters()),
                Some((3, 0))
            );
        }

        #[tokio::test]
        async fn plaintext_before_verify() {
            let (local, mut peer) = duplex(64);
            let mut writer = SecureWriter::new(local, CONN, registry(false));
            writer.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
            writer.shutdown().await.unwrap();

            let mut wire = Vec::new();
            peer.read_to_end(&mut wire).await.unwrap();
            assert_eq!(wire, b"HTTP/1.1 200 OK\r\n");
        }

        #[tokio::test]
        async fn round_trip_through_both_halves() {
            let (a, b) = duplex(256);
            let accessory = registry(true);
            let mut writer = SecureWriter::new(a, CONN, accessory.clone());

            // The controller end reads with mirrored keys.
            let controller = Arc::new(SessionRegistry::new());
            controller.stage_keys(
                CONN,
                "accessory".to_string(),
                SessionKeys {
                    encrypt_key: EncryptionKey::new([2; 32]),
                    decrypt_key: EncryptionKey::new([1; 32]),
                },
            );
            controller.activate_staged(CONN);
            let mut reader = SecureReader::new(b, CONN, controller);

            let message = vec![7u8; 3000];
            let expected = message.clone();
            let send = tokio::spawn(async move {
                writer.write_all(&message).await.unwrap();
                writer.flush().await.unwrap();
            });

            let mut out = vec![0u8; 3000];
            reader.read_exact(&mut out).await.unwrap();
            send.await.unwrap();
            assert_eq!(out, expected);
        }
    }
}
