//! HTTP-upgrade obfuscation.
//!
//! The client's first write is dressed up as a WebSocket upgrade request
//! with the real payload as the request body; the server answers with a
//! `101 Switching Protocols` carrying its first payload inline. After
//! that single exchange both directions are raw passthrough.

use std::io;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{ready, Context, Poll};

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use bytes::{Buf, BytesMut};
use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Error;

/// Upper bound on the peer's header block.
const MAX_HEAD: usize = 8 * 1024;

/// The mimicked nginx version, chosen once per process so an observer
/// never sees it change mid-deployment.
static NGINX_VERSION: LazyLock<(u8, u8)> = LazyLock::new(|| {
    let mut rng = rand::thread_rng();
    (rng.gen_range(0..11), rng.gen_range(0..12))
});

#[derive(Copy, Clone)]
enum Role {
    Client,
    Server,
}

enum FirstFlight {
    Client { host: String, port: u16 },
    Server,
}

enum ReadState {
    /// Accumulating the peer's header block.
    Head { acc: BytesMut },
    /// Serving bytes that arrived together with the header block.
    Buffered { acc: BytesMut },
    Passthrough,
}

/// A duplex stream disguised as an HTTP WebSocket upgrade.
pub struct HttpObfs<S> {
    inner: S,
    role: Role,
    read: ReadState,
    first_flight: Option<FirstFlight>,
    pending: BytesMut,
    accepted: Option<usize>,
}

impl<S> HttpObfs<S> {
    /// Client-side wrapper; `host`/`port` populate the `Host` header.
    pub fn client(inner: S, host: &str, port: u16) -> Self {
        Self {
            inner,
            role: Role::Client,
            read: ReadState::Head { acc: BytesMut::new() },
            first_flight: Some(FirstFlight::Client {
                host: host.to_owned(),
                port,
            }),
            pending: BytesMut::new(),
            accepted: None,
        }
    }

    /// Server-side wrapper.
    pub fn server(inner: S) -> Self {
        Self {
            inner,
            role: Role::Server,
            read: ReadState::Head { acc: BytesMut::new() },
            first_flight: Some(FirstFlight::Server),
            pending: BytesMut::new(),
            accepted: None,
        }
    }

    fn encode_first_flight(flight: &FirstFlight, payload: &[u8], out: &mut BytesMut) {
        match flight {
            FirstFlight::Client { host, port } => {
                let mut key = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut key);
                let mut rng = rand::thread_rng();
                let head = format!(
                    "GET / HTTP/1.1\r\n\
                     Host: {host}:{port}\r\n\
                     User-Agent: curl/7.{}.{}\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Key: {}\r\n\
                     Content-Length: {}\r\n\
                     \r\n",
                    rng.gen_range(0..54),
                    rng.gen_range(0..2),
                    URL_SAFE.encode(key),
                    payload.len(),
                );
                out.extend_from_slice(head.as_bytes());
            }
            FirstFlight::Server => {
                let mut accept = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut accept);
                let (major, minor) = *NGINX_VERSION;
                let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
                let head = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Server: nginx/1.{major}.{minor}\r\n\
                     Date: {date}\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\
                     \r\n",
                    URL_SAFE.encode(accept),
                );
                out.extend_from_slice(head.as_bytes());
            }
        }
        out.extend_from_slice(payload);
    }

    fn validate_head(role: Role, head: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(head);
        match role {
            // The server checks the request shape; anything else is not
            // a tunnel client talking to us.
            Role::Server => {
                if !text.starts_with("GET ") {
                    return Err(Error::protocol("obfs request is not a GET").into_io());
                }
                let upgraded = text.lines().any(|line| {
                    line.split_once(':').is_some_and(|(name, value)| {
                        name.trim().eq_ignore_ascii_case("connection")
                            && value.to_ascii_lowercase().contains("upgrade")
                    })
                });
                if !upgraded {
                    return Err(Error::protocol("obfs request is not an upgrade").into_io());
                }
            }
            Role::Client => {
                if !text.starts_with("HTTP/") {
                    return Err(Error::protocol("malformed obfs response").into_io());
                }
            }
        }
        Ok(())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

impl<S: AsyncRead + Unpin> AsyncRead for HttpObfs<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read {
                ReadState::Passthrough => {
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }
                ReadState::Buffered { acc } => {
                    let n = acc.len().min(buf.remaining());
                    buf.put_slice(&acc[..n]);
                    acc.advance(n);
                    if acc.is_empty() {
                        this.read = ReadState::Passthrough;
                    }
                    return Poll::Ready(Ok(()));
                }
                ReadState::Head { acc } => {
                    if let Some(pos) = find_head_end(acc) {
                        Self::validate_head(this.role, &acc[..pos])?;
                        let rest = acc.split_off(pos + 4);
                        this.read = if rest.is_empty() {
                            ReadState::Passthrough
                        } else {
                            ReadState::Buffered { acc: rest }
                        };
                        continue;
                    }
                    if acc.len() > MAX_HEAD {
                        return Poll::Ready(Err(
                            Error::protocol("obfs header block too large").into_io()
                        ));
                    }
                    let mut scratch = [0u8; 1024];
                    let mut rb = ReadBuf::new(&mut scratch);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut rb))?;
                    let filled = rb.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed during obfs exchange",
                        )));
                    }
                    acc.extend_from_slice(filled);
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for HttpObfs<S> {
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
            match this.first_flight.take() {
                Some(flight) => {
                    Self::encode_first_flight(&flight, buf, &mut this.pending);
                    this.accepted = Some(buf.len());
                }
                None => return Pin::new(&mut this.inner).poll_write(cx, buf),
            }
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
