//! Traffic-obfuscation shims.
//!
//! An obfuscation shim wraps a raw byte stream and disguises the first
//! flight as a common protocol: an HTTP/1.1 WebSocket upgrade or a
//! TLS 1.2 session. After the initial exchange both shims are plain
//! framing (or pure passthrough). The shims add no confidentiality;
//! that is the AEAD layer's job.

mod http;
mod tls;

pub use http::HttpObfs;
pub use tls::TlsObfs;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

/// Which obfuscation to apply to a connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObfsMode {
    /// No obfuscation; bytes pass through untouched.
    Off,
    /// HTTP/1.1 WebSocket-upgrade mimicry.
    Http,
    /// Fake TLS 1.2 record framing.
    Tls,
}

impl ObfsMode {
    /// Parse a configured obfs type. `"none"`, `"off"` and the empty
    /// string all mean no obfuscation; anything else but `"tls"` and
    /// `"http"` is a configuration error.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "tls" => Ok(ObfsMode::Tls),
            "http" => Ok(ObfsMode::Http),
            "none" | "off" | "" => Ok(ObfsMode::Off),
            other => Err(Error::config(format!("invalid obfs type {other:?}"))),
        }
    }
}

impl std::fmt::Display for ObfsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObfsMode::Off => write!(f, "none"),
            ObfsMode::Http => write!(f, "http"),
            ObfsMode::Tls => write!(f, "tls"),
        }
    }
}

/// A stream with the configured obfuscation applied.
pub enum ObfsStream<S> {
    /// Passthrough.
    Plain(S),
    /// HTTP-upgrade mimicry.
    Http(HttpObfs<S>),
    /// Fake-TLS framing.
    Tls(TlsObfs<S>),
}

impl<S> ObfsStream<S> {
    /// Wrap the client side of a connection.
    ///
    /// `host` and `port` feed the synthetic first flight (`Host` header,
    /// SNI); they name the disguise, not the real server.
    pub fn client(stream: S, mode: ObfsMode, host: &str, port: u16) -> Self {
        match mode {
            ObfsMode::Off => ObfsStream::Plain(stream),
            ObfsMode::Http => ObfsStream::Http(HttpObfs::client(stream, host, port)),
            ObfsMode::Tls => ObfsStream::Tls(TlsObfs::client(stream, host)),
        }
    }

    /// Wrap the server side of a connection.
    pub fn server(stream: S, mode: ObfsMode) -> Self {
        match mode {
            ObfsMode::Off => ObfsStream::Plain(stream),
            ObfsMode::Http => ObfsStream::Http(HttpObfs::server(stream)),
            ObfsMode::Tls => ObfsStream::Tls(TlsObfs::server(stream)),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ObfsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ObfsStream::Http(s) => Pin::new(s).poll_read(cx, buf),
            ObfsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ObfsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ObfsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ObfsStream::Http(s) => Pin::new(s).poll_write(cx, buf),
            ObfsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ObfsStream::Http(s) => Pin::new(s).poll_flush(cx),
            ObfsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ObfsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ObfsStream::Http(s) => Pin::new(s).poll_shutdown(cx),
            ObfsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ObfsMode::parse("tls").unwrap(), ObfsMode::Tls);
        assert_eq!(ObfsMode::parse("http").unwrap(), ObfsMode::Http);
        assert_eq!(ObfsMode::parse("none").unwrap(), ObfsMode::Off);
        assert_eq!(ObfsMode::parse("off").unwrap(), ObfsMode::Off);
        assert_eq!(ObfsMode::parse("").unwrap(), ObfsMode::Off);
        assert!(ObfsMode::parse("quic").is_err());
    }
}
