//! Client-side session wrapper.
//!
//! [`ClientSession`] consumes the server's one-byte reply prefix
//! transparently on the first read of each request use: a TUNNEL prefix
//! turns the session into a passthrough stream, an ERROR reply is decoded
//! and surfaced as an app error, anything else is a protocol error. On
//! return to the pool the wrapper is re-armed so the next lease expects a
//! fresh prefix.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Error;
use crate::snell::{MAX_ERROR_MSG, RESP_ERROR, RESP_TUNNEL};

enum ReplyState {
    /// Waiting for the one-byte reply prefix.
    Prefix,
    /// ERROR reply: collecting errno and message length.
    ErrorHead { buf: [u8; 2], have: usize },
    /// ERROR reply: collecting the message itself.
    ErrorMsg { errno: u8, msg: Vec<u8>, want: usize },
    /// Prefix consumed; reads pass through.
    Ready,
}

/// An AEAD-wrapped connection to the server, with reply handling.
pub struct ClientSession<S> {
    inner: S,
    reply: ReplyState,
}

impl<S> ClientSession<S> {
    /// Wrap a freshly established tunnel stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reply: ReplyState::Prefix,
        }
    }

    /// Re-arm the reply prefix for the next request on this session.
    pub fn reset_reply(&mut self) {
        self.reply = ReplyState::Prefix;
    }

    /// Get a reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Get a mutable reference to the wrapped stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> ClientSession<S> {
    /// Read some bytes from the wrapped stream into `scratch`.
    fn poll_read_some(
        inner: &mut S,
        cx: &mut Context<'_>,
        scratch: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut rb = ReadBuf::new(scratch);
        ready!(Pin::new(inner).poll_read(cx, &mut rb))?;
        Poll::Ready(Ok(rb.filled().len()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ClientSession<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.reply {
                ReplyState::Ready => {
                    return Pin::new(&mut this.inner).poll_read(cx, buf);
                }
                ReplyState::Prefix => {
                    let mut prefix = [0u8; 1];
                    let n = ready!(Self::poll_read_some(&mut this.inner, cx, &mut prefix))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed before reply prefix",
                        )));
                    }
                    match prefix[0] {
                        RESP_TUNNEL => this.reply = ReplyState::Ready,
                        RESP_ERROR => {
                            this.reply = ReplyState::ErrorHead {
                                buf: [0u8; 2],
                                have: 0,
                            };
                        }
                        other => {
                            this.reply = ReplyState::Ready;
                            return Poll::Ready(Err(Error::protocol(format!(
                                "unsupported reply prefix {other:#04x}"
                            ))
                            .into_io()));
                        }
                    }
                }
                ReplyState::ErrorHead { buf: head, have } => {
                    let n = ready!(Self::poll_read_some(&mut this.inner, cx, &mut head[*have..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed inside error reply",
                        )));
                    }
                    *have += n;
                    if *have == 2 {
                        let errno = head[0];
                        let want = (head[1] as usize).min(MAX_ERROR_MSG);
                        this.reply = ReplyState::ErrorMsg {
                            errno,
                            msg: Vec::with_capacity(want),
                            want,
                        };
                    }
                }
                ReplyState::ErrorMsg { errno, msg, want } => {
                    if msg.len() == *want {
                        let err = Error::App {
                            errno: *errno,
                            message: String::from_utf8_lossy(msg).into_owned(),
                        };
                        // Later reads pass through so a v2 drain can still
                        // observe the end-of-request marker.
                        this.reply = ReplyState::Ready;
                        return Poll::Ready(Err(err.into_io()));
                    }
                    let mut scratch = [0u8; MAX_ERROR_MSG];
                    let room = *want - msg.len();
                    let n = ready!(Self::poll_read_some(
                        &mut this.inner,
                        cx,
                        &mut scratch[..room]
                    ))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "stream closed inside error reply",
                        )));
                    }
                    msg.extend_from_slice(&scratch[..n]);
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ClientSession<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
