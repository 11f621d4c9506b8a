//! Fake-TLS obfuscation.
//!
//! Application data is framed as TLS 1.2 application-data records. The
//! first flight in each direction is a fabricated handshake: the client
//! emits a ClientHello whose session-ticket extension carries the real
//! payload, the server answers with a canned ServerHello + ChangeCipherSpec
//! and its first payload dressed as an encrypted-handshake record. The
//! templates (and therefore the byte-exact skip arithmetic on the reading
//! side) are fixed; neither side parses real TLS.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Maximum payload carried by one application-data record.
const RECORD_CHUNK: usize = 16 * 1024;

/// ClientHello prefix before the session-ticket length: record header (5),
/// handshake header (4), version (2), random (32), session id (1 + 32),
/// cipher suites (2 + 56), compression (2), extensions length (2),
/// ticket extension type (2).
const CLIENT_HELLO_SKIP: usize = 9 * 16 - 4;

/// Bytes between the SNI block and the first follow-up record: the four
/// trailing extensions (66) plus the next record's 3-byte header.
const AFTER_SNI_SKIP: usize = 4 * 16 + 2 + 3;

/// Server first-flight prefix before the payload length: ServerHello
/// record (96), ChangeCipherSpec (6), encrypted-handshake header (3).
const SERVER_HELLO_SKIP: usize = 96 + 6 + 3;

/// Header skip of a steady-state record (content type + version).
const RECORD_SKIP: usize = 3;

const CIPHER_SUITES: [u8; 56] = [
    0xc0, 0x2c, 0xc0, 0x30, 0x00, 0x9f, 0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0xaa, 0xc0, 0x2b, 0xc0,
    0x2f, 0x00, 0x9e, 0xc0, 0x24, 0xc0, 0x28, 0x00, 0x6b, 0xc0, 0x23, 0xc0, 0x27, 0x00, 0x67,
    0xc0, 0x0a, 0xc0, 0x14, 0x00, 0x39, 0xc0, 0x09, 0xc0, 0x13, 0x00, 0x33, 0x00, 0x9d, 0x00,
    0x9c, 0x00, 0x3d, 0x00, 0x3c, 0x00, 0x35, 0x00, 0x2f, 0x00, 0xff,
];

/// ec-point-formats, supported-groups, signature-algorithms,
/// encrypt-then-mac, extended-master-secret.
const TRAILING_EXTENSIONS: [u8; 66] = [
    0x00, 0x0b, 0x00, 0x04, 0x03, 0x01, 0x00, 0x02, // ec point formats
    0x00, 0x0a, 0x00, 0x0a, 0x00, 0x08, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x19, 0x00,
    0x18, // groups
    0x00, 0x0d, 0x00, 0x20, 0x00, 0x1e, 0x06, 0x01, 0x06, 0x02, 0x06, 0x03, 0x05, 0x01, 0x05,
    0x02, 0x05, 0x03, 0x04, 0x01, 0x04, 0x02, 0x04, 0x03, 0x03, 0x01, 0x03, 0x02, 0x03, 0x03,
    0x02, 0x01, 0x02, 0x02, 0x02, 0x03, // signature algorithms
    0x00, 0x16, 0x00, 0x00, // encrypt then mac
    0x00, 0x17, 0x00, 0x00, // extended master secret
];

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn make_client_hello(payload: &[u8], host: &str, out: &mut BytesMut) {
    let mut rng = rand::thread_rng();
    let mut random = [0u8; 28];
    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut random);
    rng.fill_bytes(&mut session_id);

    let p = payload.len();
    let h = host.len();

    // Record and handshake headers
    out.put_u8(0x16);
    out.put_u16(0x0301);
    out.put_u16((212 + p + h) as u16);
    out.put_u8(0x01);
    out.put_u8(0x00);
    out.put_u16((208 + p + h) as u16);
    out.put_u16(0x0303);

    // Random with embedded timestamp, session id
    out.put_u32(unix_time());
    out.put_slice(&random);
    out.put_u8(32);
    out.put_slice(&session_id);

    // Cipher suites, compression
    out.put_u16(CIPHER_SUITES.len() as u16);
    out.put_slice(&CIPHER_SUITES);
    out.put_u8(0x01);
    out.put_u8(0x00);

    // Extensions: the session ticket smuggles the first payload
    out.put_u16((79 + p + h) as u16);
    out.put_u16(0x0023);
    out.put_u16(p as u16);
    out.put_slice(payload);

    // SNI
    out.put_u16(0x0000);
    out.put_u16((h + 5) as u16);
    out.put_u16((h + 3) as u16);
    out.put_u8(0x00);
    out.put_u16(h as u16);
    out.put_slice(host.as_bytes());

    out.put_slice(&TRAILING_EXTENSIONS);
}

fn make_server_hello(payload: &[u8], out: &mut BytesMut) {
    let mut rng = rand::thread_rng();
    let mut random = [0u8; 28];
    let mut session_id = [0u8; 32];
    rng.fill_bytes(&mut random);
    rng.fill_bytes(&mut session_id);

    // ServerHello
    out.put_u8(0x16);
    out.put_u16(0x0301);
    out.put_u16(91);
    out.put_slice(&[0x02, 0x00, 0x00, 0x57, 0x03, 0x03]);
    out.put_u32(unix_time());
    out.put_slice(&random);
    out.put_u8(32);
    out.put_slice(&session_id);
    out.put_slice(&[0xcc, 0xa8]); // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305
    out.put_u8(0x00);
    out.put_slice(&[0x00, 0x00]);
    out.put_slice(&[0xff, 0x01, 0x00, 0x01, 0x00]); // renegotiation info
    out.put_slice(&[0x00, 0x17, 0x00, 0x00]); // extended master secret
    out.put_slice(&[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00]); // ec point formats

    // ChangeCipherSpec
    out.put_slice(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);

    // First payload as an "encrypted handshake" record
    out.put_u8(0x16);
    out.put_u16(0x0303);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
}

enum TlsFirst {
    Client { host: String },
    Server,
}

enum TlsReadState {
    /// Discard `left` wire bytes. `boundary` marks the idle point between
    /// records where a peer EOF is a normal close.
    Skip {
        left: usize,
        discard_next: bool,
        boundary: bool,
    },
    /// Collect a 2-byte big-endian block length.
    Len { buf: [u8; 2], have: usize, discard: bool },
    /// Stream `left` payload bytes to the caller.
    Deliver { left: usize },
    /// Throw away a length-prefixed block (the SNI hostname).
    Discard { left: usize },
}

/// A duplex stream disguised as a TLS 1.2 session.
pub struct TlsObfs<S> {
    inner: S,
    read: TlsReadState,
    /// Server only: the SNI section still has to be consumed after the
    /// ticket payload.
    sni_pending: bool,
    first_flight: Option<TlsFirst>,
    pending: BytesMut,
    accepted: Option<usize>,
}

impl<S> TlsObfs<S> {
    /// Client-side wrapper; `host` becomes the SNI of the fake ClientHello.
    pub fn client(inner: S, host: &str) -> Self {
        Self {
            inner,
            read: TlsReadState::Skip {
                left: SERVER_HELLO_SKIP,
                discard_next: false,
                boundary: false,
            },
            sni_pending: false,
            first_flight: Some(TlsFirst::Client {
                host: host.to_owned(),
            }),
            pending: BytesMut::new(),
            accepted: None,
        }
    }

    /// Server-side wrapper.
    pub fn server(inner: S) -> Self {
        Self {
            inner,
            read: TlsReadState::Skip {
                left: CLIENT_HELLO_SKIP,
                discard_next: false,
                boundary: false,
            },
            sni_pending: true,
            first_flight: Some(TlsFirst::Server),
            pending: BytesMut::new(),
            accepted: None,
        }
    }

    fn next_after_deliver(&mut self) {
        if self.sni_pending {
            self.sni_pending = false;
            self.read = TlsReadState::Skip {
                left: 7, // SNI extension type/length preamble
                discard_next: true,
                boundary: false,
            };
        } else {
            self.read = TlsReadState::Skip {
                left: RECORD_SKIP,
                discard_next: false,
                boundary: true,
            };
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsObfs<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut this.read {
                TlsReadState::Skip {
                    left,
                    discard_next,
                    boundary,
                } => {
                    if *left == 0 {
                        let discard = *discard_next;
                        this.read = TlsReadState::Len {
                            buf: [0u8; 2],
                            have: 0,
                            discard,
                        };
                        continue;
                    }
                    let mut scratch = [0u8; 256];
                    let want = (*left).min(scratch.len());
                    let mut rb = ReadBuf::new(&mut scratch[..want]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        if *boundary {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed mid-record",
                        )));
                    }
                    *left -= n;
                    *boundary = false;
                }
                TlsReadState::Len { buf: len_buf, have, discard } => {
                    let mut rb = ReadBuf::new(&mut len_buf[*have..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed mid-record",
                        )));
                    }
                    *have += n;
                    if *have < 2 {
                        continue;
                    }
                    let len = u16::from_be_bytes(*len_buf) as usize;
                    if *discard {
                        this.read = TlsReadState::Discard { left: len };
                    } else if len == 0 {
                        this.next_after_deliver();
                    } else {
                        this.read = TlsReadState::Deliver { left: len };
                    }
                }
                TlsReadState::Deliver { left } => {
                    let want = (*left).min(buf.remaining());
                    let dst = buf.initialize_unfilled_to(want);
                    let mut rb = ReadBuf::new(dst);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed mid-record",
                        )));
                    }
                    buf.advance(n);
                    *left -= n;
                    if *left == 0 {
                        this.next_after_deliver();
                    }
                    return Poll::Ready(Ok(()));
                }
                TlsReadState::Discard { left } => {
                    if *left == 0 {
                        this.read = TlsReadState::Skip {
                            left: AFTER_SNI_SKIP,
                            discard_next: false,
                            boundary: false,
                        };
                        continue;
                    }
                    let mut scratch = [0u8; 256];
                    let want = (*left).min(scratch.len());
                    let mut rb = ReadBuf::new(&mut scratch[..want]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed mid-record",
                        )));
                    }
                    *left -= n;
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsObfs<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            while !this.pending.is_empty() {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.pending))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                this.pending.advance(n);
            }
            if let Some(n) = this.accepted.take() {
                return Poll::Ready(Ok(n));
            }
            let take = buf.len().min(RECORD_CHUNK);
            match this.first_flight.take() {
                Some(TlsFirst::Client { host }) => {
                    make_client_hello(&buf[..take], &host, &mut this.pending);
                }
                Some(TlsFirst::Server) => {
                    make_server_hello(&buf[..take], &mut this.pending);
                }
                None => {
                    this.pending.put_slice(&[0x17, 0x03, 0x03]);
                    this.pending.put_u16(take as u16);
                    this.pending.put_slice(&buf[..take]);
                }
            }
            this.accepted = Some(take);
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while !this.pending.is_empty() {
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &this.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.pending.advance(n);
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
