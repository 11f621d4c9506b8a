//! Minimal SOCKS5 acceptor.
//!
//! Just enough of RFC 1928 to front the tunnel client: no-auth
//! negotiation and CONNECT requests. UDP-ASSOCIATE connections are
//! drained until the peer gives up (the tunnel forwards datagrams over
//! its own UDP-over-TCP mode instead); every other command is refused.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// A CONNECT target parsed from a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    /// Hostname or IP literal.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Run the SOCKS5 handshake on an accepted connection.
///
/// Returns the CONNECT target, or `None` when the connection was consumed
/// without yielding one (UDP-ASSOCIATE drain). The success reply has
/// already been written when a target is returned.
pub async fn handshake(stream: &mut TcpStream) -> io::Result<Option<TargetAddr>> {
    // Method negotiation
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol("not a SOCKS5 greeting").into_io());
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(Error::protocol("bad SOCKS5 request version").into_io());
    }

    let target = match read_addr(stream, req[3]).await {
        Ok(target) => target,
        Err(e) => {
            let _ = reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await;
            return Err(e);
        }
    };

    match req[1] {
        CMD_CONNECT => {
            reply(stream, REPLY_SUCCEEDED).await?;
            Ok(Some(target))
        }
        CMD_UDP_ASSOCIATE => {
            // Keep the control connection open, deliver nothing.
            reply(stream, REPLY_SUCCEEDED).await?;
            let mut sink = [0u8; 512];
            while stream.read(&mut sink).await? > 0 {}
            Ok(None)
        }
        other => {
            reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            Err(Error::protocol(format!("unsupported SOCKS5 command {other:#04x}")).into_io())
        }
    }
}

async fn read_addr(stream: &mut TcpStream, atyp: u8) -> io::Result<TargetAddr> {
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| Error::protocol("domain name is not valid UTF-8").into_io())?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => {
            return Err(
                Error::protocol(format!("unsupported address type {other:#04x}")).into_io(),
            );
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    })
}

async fn reply(stream: &mut TcpStream, code: u8) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}
