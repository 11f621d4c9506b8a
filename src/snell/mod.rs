//! The snell command/response protocol.
//!
//! Layered as TCP ↔ obfs ↔ AEAD ↔ snell. This module holds the wire
//! constants and the request/reply codecs; the orchestrators live in
//! [`client`] and [`server`], the pooled-session machinery in [`pool`]
//! and [`session`], and datagram forwarding in [`udp`].

pub mod client;
pub mod pool;
pub mod server;
pub mod session;
pub mod udp;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Protocol version carried in every request header.
pub const VERSION: u8 = 1;

/// Ping request, answered with a pong byte.
pub const CMD_PING: u8 = 0;
/// Single-shot TCP tunnel request (v1).
pub const CMD_CONNECT: u8 = 1;
/// Multiplexed TCP tunnel request (v2).
pub const CMD_CONNECT_V2: u8 = 5;
/// UDP-over-TCP session request.
pub const CMD_UDP: u8 = 6;

/// The only UDP-over-TCP chunk command: forward a datagram.
pub const CMD_UDP_FORWARD: u8 = 1;

/// Reply prefix: a tunnel stream follows.
pub const RESP_TUNNEL: u8 = 0;
/// Reply prefix in UDP context: server ready for datagram chunks.
pub const RESP_READY: u8 = 0;
/// Reply to a ping.
pub const RESP_PONG: u8 = 1;
/// Reply prefix: errno, message length and message follow.
pub const RESP_ERROR: u8 = 2;

/// ERROR reply messages are clamped to this many bytes by the sender.
pub const MAX_ERROR_MSG: usize = 250;

/// Encode a CONNECT / CONNECT-V2 request header for `host:port`.
///
/// The client-id field is always empty; the server only logs it.
pub fn connect_header(v2: bool, host: &str, port: u16) -> crate::error::Result<Vec<u8>> {
    if host.len() > u8::MAX as usize {
        return Err(Error::protocol("target host name too long"));
    }
    let mut buf = Vec::with_capacity(6 + host.len());
    buf.push(VERSION);
    buf.push(if v2 { CMD_CONNECT_V2 } else { CMD_CONNECT });
    buf.push(0); // client id length
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

/// Encode a bodyless request header (PING or UDP).
pub fn command_header(command: u8) -> [u8; 3] {
    [VERSION, command, 0]
}

/// A parsed client request header.
#[derive(Debug)]
pub struct Handshake {
    /// Requested command, one of the `CMD_*` constants.
    pub command: u8,
    /// Advisory client id bytes (may be empty).
    pub client_id: Vec<u8>,
    /// Target host; empty for PING and UDP.
    pub host: String,
    /// Target port; zero for PING and UDP.
    pub port: u16,
}

impl Handshake {
    /// `host:port` for dialing and logs.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read one request header from the decrypted stream (server side).
pub async fn read_handshake<S>(stream: &mut S) -> io::Result<Handshake>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;

    if head[0] != VERSION {
        return Err(Error::protocol(format!("invalid snell version {:#04x}", head[0])).into_io());
    }
    let command = head[1];

    let mut client_id = vec![0u8; head[2] as usize];
    if !client_id.is_empty() {
        stream.read_exact(&mut client_id).await?;
    }

    // PING and UDP requests carry no target in the header.
    if command == CMD_PING || command == CMD_UDP {
        return Ok(Handshake {
            command,
            client_id,
            host: String::new(),
            port: 0,
        });
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut host = vec![0u8; len[0] as usize];
    stream.read_exact(&mut host).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    let host = String::from_utf8(host)
        .map_err(|_| Error::protocol("target host is not valid UTF-8").into_io())?;

    Ok(Handshake {
        command,
        client_id,
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Discard inbound bytes until the peer's zero-chunk end-of-request
/// marker.
///
/// `Ok(())` means the marker was observed and the session is clean;
/// any other end (EOF included) is returned as the error that stopped
/// the drain.
pub(crate) async fn drain_until_zero_chunk<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = crate::buffer::take();
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before end-of-request marker",
                ))
            }
            Ok(_) => continue,
            Err(e) if Error::is_zero_chunk(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Write an ERROR reply for a failed request (server side).
pub async fn write_error_reply<S>(stream: &mut S, err: &io::Error) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let errno = err.raw_os_error().map(|code| code as u8).unwrap_or(0);
    let text = err.to_string();
    let msg = &text.as_bytes()[..text.len().min(MAX_ERROR_MSG)];

    let mut buf = Vec::with_capacity(3 + msg.len());
    buf.push(RESP_ERROR);
    buf.push(errno);
    buf.push(msg.len() as u8);
    buf.extend_from_slice(msg);

    stream.write_all(&buf).await?;
    stream.flush().await
}
