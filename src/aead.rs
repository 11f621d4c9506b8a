//! The AEAD record layer.
//!
//! [`AeadStream`] frames a duplex byte stream into length-prefixed
//! encrypted chunks. Each direction starts with a cleartext salt from
//! which the directional key is derived; after that the wire carries
//! pairs of records, `Encrypt(len)` then `Encrypt(data)`, sealed under a
//! strictly increasing counter nonce. A length of zero is a chunk in its
//! own right (no data record follows) and is surfaced to the caller as
//! the distinguished zero-chunk error; snell v2 uses it as the
//! end-of-request marker.
//!
//! The receive side optionally carries a fallback cipher: the first
//! length record is tried under the primary and, if authentication
//! fails, retried once under the fallback. Whichever succeeds is
//! committed for the lifetime of the connection. This is how the server
//! accepts v1 (ChaCha20-Poly1305) and v2 (AES-128-GCM) clients on one
//! port.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::buffer::{self, PooledBuf};
use crate::crypto::{AeadCipher, PskCipher, LENGTH_RECORD_SIZE, MAX_CHUNK, SALT_SIZE, TAG_SIZE};
use crate::error::Error;

/// A duplex stream wrapped in the snell AEAD record framing.
pub struct AeadStream<S> {
    inner: S,
    send: SendHalf,
    recv: RecvHalf,
}

impl<S> AeadStream<S> {
    /// Wrap `inner` with the same cipher for both directions (client side).
    pub fn new(inner: S, cipher: PskCipher) -> Self {
        Self {
            inner,
            send: SendHalf::new(Some(cipher.clone())),
            recv: RecvHalf::new(cipher, None),
        }
    }

    /// Wrap `inner` with a receive-side fallback (server side).
    ///
    /// The send direction adopts whichever cipher the peer's first record
    /// resolves to, so replies are always readable by the client.
    pub fn with_fallback(inner: S, primary: PskCipher, fallback: PskCipher) -> Self {
        Self {
            inner,
            send: SendHalf::new(None),
            recv: RecvHalf::new(primary, Some(fallback)),
        }
    }

    /// Number of chunks sealed on the send direction so far.
    pub fn send_counter(&self) -> u64 {
        self.send.sealer.as_ref().map_or(0, AeadCipher::counter)
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AeadStream<S> {
    /// Emit a zero-length chunk, the v2 end-of-request marker, and flush.
    pub async fn write_zero_chunk(&mut self) -> io::Result<()> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_write(cx, &[])).await?;
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_flush(cx)).await
    }
}

struct SendHalf {
    /// `None` on the server until the receive side resolves its cipher.
    descriptor: Option<PskCipher>,
    sealer: Option<AeadCipher>,
    pending: BytesMut,
    accepted: Option<usize>,
}

impl SendHalf {
    fn new(descriptor: Option<PskCipher>) -> Self {
        Self {
            descriptor,
            sealer: None,
            pending: BytesMut::new(),
            accepted: None,
        }
    }

    fn poll_drain<S: AsyncWrite + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        inner: &mut S,
    ) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut *inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Frame at most one chunk of `buf` into the pending wire buffer.
    fn encode_chunk(&mut self, buf: &[u8]) -> crate::error::Result<()> {
        if self.sealer.is_none() {
            let descriptor = self
                .descriptor
                .as_ref()
                .ok_or_else(|| Error::protocol("send cipher not resolved yet"))?;
            let mut salt = [0u8; SALT_SIZE];
            rand::thread_rng().fill_bytes(&mut salt);
            let sealer = descriptor.derive(&salt)?;
            self.pending.extend_from_slice(&salt);
            self.sealer = Some(sealer);
        }
        let sealer = self.sealer.as_mut().expect("sealer set above");

        let take = buf.len().min(MAX_CHUNK);

        let start = self.pending.len();
        self.pending.extend_from_slice(&(take as u16).to_be_bytes());
        let tag = sealer.seal_detached(&mut self.pending[start..])?;
        self.pending.extend_from_slice(&tag);

        // A zero-length chunk is the length record alone.
        if take > 0 {
            let start = self.pending.len();
            self.pending.extend_from_slice(&buf[..take]);
            let tag = sealer.seal_detached(&mut self.pending[start..])?;
            self.pending.extend_from_slice(&tag);
        }

        self.accepted = Some(take);
        Ok(())
    }
}

enum RecvStage {
    /// Waiting for the cleartext salt.
    Salt,
    /// Waiting for an encrypted length record.
    Length,
    /// Waiting for a data record of `len` plaintext bytes.
    Data { len: usize },
    /// Decrypted plaintext buffered for the caller.
    Serve,
}

enum Fill {
    Done,
    /// Underlying EOF before the first byte of the current target.
    Eof,
}

struct RecvHalf {
    primary: PskCipher,
    fallback: Option<PskCipher>,
    opener: Option<AeadCipher>,
    resolved: Option<PskCipher>,
    salt: [u8; SALT_SIZE],
    first_record: bool,
    poisoned: bool,
    stage: RecvStage,
    scratch: PooledBuf,
    filled: usize,
    out_pos: usize,
    out_len: usize,
}

impl RecvHalf {
    fn new(primary: PskCipher, fallback: Option<PskCipher>) -> Self {
        Self {
            primary,
            fallback,
            opener: None,
            resolved: None,
            salt: [0u8; SALT_SIZE],
            first_record: true,
            poisoned: false,
            stage: RecvStage::Salt,
            scratch: buffer::take(),
            filled: 0,
            out_pos: 0,
            out_len: 0,
        }
    }

    fn poll_fill<S: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        inner: &mut S,
        target: usize,
    ) -> Poll<io::Result<Fill>> {
        while self.filled < target {
            let mut rb = ReadBuf::new(&mut self.scratch[self.filled..target]);
            ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb))?;
            let n = rb.filled().len();
            if n == 0 {
                if self.filled == 0 {
                    return Poll::Ready(Ok(Fill::Eof));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed mid-record",
                )));
            }
            self.filled += n;
        }
        Poll::Ready(Ok(Fill::Done))
    }

    /// Decrypt the buffered length record, resolving the cipher on the
    /// first record when a fallback is configured.
    fn open_length(&mut self) -> crate::error::Result<usize> {
        let mut record = [0u8; LENGTH_RECORD_SIZE];
        record.copy_from_slice(&self.scratch[..LENGTH_RECORD_SIZE]);
        let (body, tag) = record.split_at_mut(2);

        if self.opener.is_none() {
            self.opener = Some(self.primary.derive(&self.salt)?);
            self.resolved = Some(self.primary.clone());
        }

        match self.opener.as_mut().expect("opener set above").open_detached(body, tag) {
            Ok(()) => {}
            Err(Error::AuthFailure) if self.first_record && self.fallback.is_some() => {
                // Retry the exact same record under the fallback, then
                // commit to whichever cipher succeeded.
                let alt_desc = self.fallback.as_ref().expect("checked above").clone();
                let mut alt = alt_desc.derive(&self.salt)?;
                let mut retry = [0u8; LENGTH_RECORD_SIZE];
                retry.copy_from_slice(&self.scratch[..LENGTH_RECORD_SIZE]);
                let (body, tag) = retry.split_at_mut(2);
                alt.open_detached(body, tag)?;
                self.opener = Some(alt);
                self.resolved = Some(alt_desc);
                self.first_record = false;
                return Ok(u16::from_be_bytes([body[0], body[1]]) as usize);
            }
            Err(e) => return Err(e),
        }

        self.first_record = false;
        Ok(u16::from_be_bytes([body[0], body[1]]) as usize)
    }

    fn open_data(&mut self, len: usize) -> crate::error::Result<()> {
        let (body, rest) = self.scratch[..len + TAG_SIZE].split_at_mut(len);
        let opener = self
            .opener
            .as_mut()
            .ok_or_else(|| Error::protocol("data record before salt"))?;
        opener.open_detached(body, rest)?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let recv = &mut this.recv;
        let inner = &mut this.inner;

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if recv.poisoned {
            return Poll::Ready(Err(Error::AuthFailure.into_io()));
        }

        loop {
            match recv.stage {
                RecvStage::Serve => {
                    let n = (recv.out_len - recv.out_pos).min(buf.remaining());
                    buf.put_slice(&recv.scratch[recv.out_pos..recv.out_pos + n]);
                    recv.out_pos += n;
                    if recv.out_pos == recv.out_len {
                        recv.stage = RecvStage::Length;
                        recv.filled = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                RecvStage::Salt => {
                    match ready!(recv.poll_fill(cx, inner, SALT_SIZE))? {
                        Fill::Eof => return Poll::Ready(Ok(())),
                        Fill::Done => {}
                    }
                    let mut salt = [0u8; SALT_SIZE];
                    salt.copy_from_slice(&recv.scratch[..SALT_SIZE]);
                    recv.salt = salt;
                    recv.stage = RecvStage::Length;
                    recv.filled = 0;
                }
                RecvStage::Length => {
                    match ready!(recv.poll_fill(cx, inner, LENGTH_RECORD_SIZE))? {
                        // EOF between records is a normal stream end.
                        Fill::Eof => return Poll::Ready(Ok(())),
                        Fill::Done => {}
                    }
                    let len = match recv.open_length() {
                        Ok(len) => len,
                        Err(e) => {
                            recv.poisoned = true;
                            return Poll::Ready(Err(e.into_io()));
                        }
                    };
                    recv.filled = 0;
                    if len == 0 {
                        // End-of-request marker; the stream stays usable.
                        recv.stage = RecvStage::Length;
                        return Poll::Ready(Err(Error::ZeroChunk.into_io()));
                    }
                    if len > MAX_CHUNK {
                        recv.poisoned = true;
                        return Poll::Ready(Err(
                            Error::protocol("oversized record length").into_io()
                        ));
                    }
                    recv.stage = RecvStage::Data { len };
                }
                RecvStage::Data { len } => {
                    match ready!(recv.poll_fill(cx, inner, len + TAG_SIZE))? {
                        Fill::Eof => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "stream closed mid-record",
                            )));
                        }
                        Fill::Done => {}
                    }
                    if let Err(e) = recv.open_data(len) {
                        recv.poisoned = true;
                        return Poll::Ready(Err(e.into_io()));
                    }
                    recv.out_pos = 0;
                    recv.out_len = len;
                    recv.stage = RecvStage::Serve;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            ready!(this.send.poll_drain(cx, &mut this.inner))?;
            if let Some(n) = this.send.accepted.take() {
                return Poll::Ready(Ok(n));
            }
            if this.send.sealer.is_none() && this.send.descriptor.is_none() {
                // Server side: reply under the cipher the peer resolved to.
                match this.recv.resolved.clone() {
                    Some(desc) => this.send.descriptor = Some(desc),
                    None => {
                        return Poll::Ready(Err(
                            Error::protocol("write before receive cipher resolution").into_io(),
                        ));
                    }
                }
            }
            if let Err(e) = this.send.encode_chunk(buf) {
                return Poll::Ready(Err(e.into_io()));
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.send.poll_drain(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.send.poll_drain(cx, &mut this.inner))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::crypto::CipherKind;

    fn psk(kind: CipherKind) -> PskCipher {
        PskCipher::new(kind, b"pass".to_vec())
    }

    #[tokio::test]
    async fn test_round_trip_both_ciphers() {
        for kind in [CipherKind::Aes128Gcm, CipherKind::ChaCha20Poly1305] {
            let (a, b) = duplex(256 * 1024);
            let mut left = AeadStream::new(a, psk(kind));
            let mut right = AeadStream::new(b, psk(kind));

            let payload = vec![0x5Au8; 40_000];
            let expected = payload.clone();
            let writer = tokio::spawn(async move {
                left.write_all(&payload).await.unwrap();
                left.flush().await.unwrap();
                left
            });

            let mut got = vec![0u8; expected.len()];
            right.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);

            // And the reverse direction over the same pair.
            let mut left = writer.await.unwrap();
            right.write_all(b"pong").await.unwrap();
            right.flush().await.unwrap();
            let mut got = [0u8; 4];
            left.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"pong");
        }
    }

    #[tokio::test]
    async fn test_exact_chunk_is_one_record() {
        let (a, mut raw) = duplex(256 * 1024);
        let mut stream = AeadStream::new(a, psk(CipherKind::Aes128Gcm));

        stream.write_all(&vec![1u8; MAX_CHUNK]).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(
            wire.len(),
            SALT_SIZE + LENGTH_RECORD_SIZE + MAX_CHUNK + TAG_SIZE
        );
    }

    #[tokio::test]
    async fn test_chunk_boundary_splits_into_two_records() {
        let (a, mut raw) = duplex(256 * 1024);
        let mut stream = AeadStream::new(a, psk(CipherKind::Aes128Gcm));

        stream.write_all(&vec![1u8; MAX_CHUNK + 1]).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(
            wire.len(),
            SALT_SIZE
                + (LENGTH_RECORD_SIZE + MAX_CHUNK + TAG_SIZE)
                + (LENGTH_RECORD_SIZE + 1 + TAG_SIZE)
        );
    }

    #[tokio::test]
    async fn test_zero_chunk_is_a_lone_length_record() {
        let (a, mut raw) = duplex(64 * 1024);
        let mut stream = AeadStream::new(a, psk(CipherKind::ChaCha20Poly1305));

        stream.write_zero_chunk().await.unwrap();
        drop(stream);

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), SALT_SIZE + LENGTH_RECORD_SIZE);
    }

    #[tokio::test]
    async fn test_zero_chunk_surfaces_and_stream_survives() {
        let (a, b) = duplex(64 * 1024);
        let mut left = AeadStream::new(a, psk(CipherKind::Aes128Gcm));
        let mut right = AeadStream::new(b, psk(CipherKind::Aes128Gcm));

        left.write_all(b"first").await.unwrap();
        left.write_zero_chunk().await.unwrap();
        left.write_all(b"second").await.unwrap();
        left.flush().await.unwrap();

        let mut got = [0u8; 5];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"first");

        let err = right.read(&mut [0u8; 16]).await.unwrap_err();
        assert!(Error::is_zero_chunk(&err));

        let mut got = [0u8; 6];
        right.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"second");
    }

    #[tokio::test]
    async fn test_server_fallback_resolves_either_cipher() {
        for kind in [CipherKind::Aes128Gcm, CipherKind::ChaCha20Poly1305] {
            let (a, b) = duplex(64 * 1024);
            let mut client = AeadStream::new(a, psk(kind));
            let mut server = AeadStream::with_fallback(
                b,
                psk(CipherKind::Aes128Gcm),
                psk(CipherKind::ChaCha20Poly1305),
            );

            client.write_all(b"hello").await.unwrap();
            client.flush().await.unwrap();

            let mut got = [0u8; 5];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"hello");

            // The reply direction adopts the resolved cipher.
            server.write_all(b"world").await.unwrap();
            server.flush().await.unwrap();
            let mut got = [0u8; 5];
            client.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"world");

            // Later records decode under the committed cipher alone.
            client.write_all(b"again").await.unwrap();
            client.flush().await.unwrap();
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"again");
        }
    }

    #[tokio::test]
    async fn test_wrong_psk_poisons_the_stream() {
        let (a, b) = duplex(64 * 1024);
        let mut left = AeadStream::new(a, psk(CipherKind::Aes128Gcm));
        let mut right = AeadStream::new(b, PskCipher::new(CipherKind::Aes128Gcm, b"nope".to_vec()));

        left.write_all(b"secret").await.unwrap();
        left.flush().await.unwrap();

        let err = right.read(&mut [0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // Poisoned: every subsequent read fails too.
        let err = right.read(&mut [0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_send_counter_is_monotonic() {
        let (a, _b) = duplex(256 * 1024);
        let mut stream = AeadStream::new(a, psk(CipherKind::Aes128Gcm));
        assert_eq!(stream.send_counter(), 0);

        stream.write_all(b"one").await.unwrap();
        assert_eq!(stream.send_counter(), 2); // length + data

        stream.write_zero_chunk().await.unwrap();
        assert_eq!(stream.send_counter(), 3); // lone length record

        stream.write_all(b"two").await.unwrap();
        assert_eq!(stream.send_counter(), 5);
    }

    #[tokio::test]
    async fn test_short_caller_reads_drain_the_residual() {
        let (a, b) = duplex(64 * 1024);
        let mut left = AeadStream::new(a, psk(CipherKind::ChaCha20Poly1305));
        let mut right = AeadStream::new(b, psk(CipherKind::ChaCha20Poly1305));

        left.write_all(b"abcdefgh").await.unwrap();
        left.flush().await.unwrap();

        let mut out = Vec::new();
        let mut one = [0u8; 3];
        for _ in 0..2 {
            let n = right.read(&mut one).await.unwrap();
            out.extend_from_slice(&one[..n]);
        }
        let mut rest = [0u8; 2];
        right.read_exact(&mut rest).await.unwrap();
        out.extend_from_slice(&rest);
        assert_eq!(out, b"abcdefgh");
    }
}
