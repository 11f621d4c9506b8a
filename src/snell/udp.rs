//! UDP-over-TCP datagram forwarding.
//!
//! A session switched into UDP mode carries one framed chunk per
//! datagram. Outbound (client → world) chunks name their target by
//! hostname or literal IP and are resolved through a small LRU cache;
//! inbound (world → client) chunks carry the source address in a fixed
//! ip-version/ip/port prefix. The session ends when either side closes.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::buffer;
use crate::error::{Error, Result};
use crate::snell::{write_error_reply, CMD_UDP_FORWARD, RESP_READY};

/// Capacity of the per-session resolution cache.
const RESOLVE_CACHE_SIZE: usize = 256;

/// Encode an outbound FORWARD chunk for `host:port`.
///
/// Literal IP targets use the compact ip-version form; anything else is
/// carried as a hostname for the server to resolve.
pub fn encode_forward_chunk(host: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(4 + host.len() + payload.len());
    buf.push(CMD_UDP_FORWARD);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.push(0);
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.push(0);
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.is_empty() || host.len() > u8::MAX as usize {
                return Err(Error::protocol("bad forward target host"));
            }
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parse an outbound FORWARD chunk into `(host, port, payload)`.
pub fn parse_forward_chunk(buf: &[u8]) -> Result<(String, u16, &[u8])> {
    if buf.len() < 5 {
        return Err(Error::protocol(format!(
            "short UDP chunk: {} < 5 bytes",
            buf.len()
        )));
    }
    if buf[0] != CMD_UDP_FORWARD {
        return Err(Error::protocol(format!(
            "unknown UDP command {:#04x}",
            buf[0]
        )));
    }

    let hlen = buf[1] as usize;
    let (host, head) = if hlen == 0 {
        let iplen = match buf[2] {
            4 => 4,
            6 => 16,
            v => return Err(Error::protocol(format!("unknown IP version {v:#04x}"))),
        };
        let head = 3 + iplen;
        if buf.len() < head + 2 {
            return Err(Error::protocol("short UDP chunk: truncated address"));
        }
        let host = match buf[2] {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[3..head]);
                IpAddr::from(octets).to_string()
            }
            _ => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[3..head]);
                IpAddr::from(octets).to_string()
            }
        };
        (host, head)
    } else {
        let head = 2 + hlen;
        if buf.len() < head + 2 {
            return Err(Error::protocol("short UDP chunk: truncated host"));
        }
        let host = std::str::from_utf8(&buf[2..head])
            .map_err(|_| Error::protocol("forward host is not valid UTF-8"))?
            .to_owned();
        (host, head)
    };

    let port = u16::from_be_bytes([buf[head], buf[head + 1]]);
    Ok((host, port, &buf[head + 2..]))
}

/// Encode an inbound chunk carrying a datagram received from `addr`.
pub fn encode_ingress_chunk(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(19 + payload.len());
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse an inbound chunk into the datagram source and payload.
pub fn parse_ingress_chunk(buf: &[u8]) -> Result<(SocketAddr, &[u8])> {
    if buf.is_empty() {
        return Err(Error::protocol("empty UDP ingress chunk"));
    }
    let iplen = match buf[0] {
        4 => 4,
        6 => 16,
        v => return Err(Error::protocol(format!("unknown IP version {v:#04x}"))),
    };
    if buf.len() < 1 + iplen + 2 {
        return Err(Error::protocol("short UDP ingress chunk"));
    }
    let ip: IpAddr = if buf[0] == 4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&buf[1..5]);
        IpAddr::from(octets)
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[1..17]);
        IpAddr::from(octets)
    };
    let head = 1 + iplen;
    let port = u16::from_be_bytes([buf[head], buf[head + 1]]);
    Ok((SocketAddr::new(ip, port), &buf[head + 2..]))
}

/// Serve a session that issued the UDP command (server side).
///
/// Binds an ephemeral socket, acknowledges with READY, then pumps the
/// two directions concurrently until the client stream ends.
pub(crate) async fn handle_udp<S>(mut stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    tracing::debug!("new UDP request from {peer}");

    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!("UDP bind failed: {e}");
            let _ = write_error_reply(&mut stream, &e).await;
            return;
        }
    };
    if let Ok(local) = socket.local_addr() {
        tracing::debug!("UDP relay listening on {local}");
    }

    if let Err(e) = stream.write_all(&[RESP_READY]).await {
        tracing::error!("failed to write READY: {e}");
        return;
    }
    if let Err(e) = stream.flush().await {
        tracing::error!("failed to write READY: {e}");
        return;
    }

    let socket = Arc::new(socket);
    let (mut reader, writer) = tokio::io::split(stream);
    let ingress = tokio::spawn(ingress_loop(writer, Arc::clone(&socket)));

    egress_loop(&mut reader, &socket).await;

    // The egress side owns the session lifetime; ingress has no way to
    // observe the stream closing while parked in recv_from.
    ingress.abort();
}

/// Client stream → UDP socket.
async fn egress_loop<R>(stream: &mut R, socket: &UdpSocket)
where
    R: AsyncRead + Unpin,
{
    let mut cache: LruCache<String, SocketAddr> =
        LruCache::new(NonZeroUsize::new(RESOLVE_CACHE_SIZE).expect("nonzero capacity"));
    let mut buf = buffer::take();

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("UDP-over-TCP stream ended");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("UDP-over-TCP read error: {e}");
                return;
            }
        };

        let (host, port, payload) = match parse_forward_chunk(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!("bad UDP chunk: {e}");
                return;
            }
        };

        // IPv6 literals need brackets to survive host:port joining.
        let key = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let addr = if let Some(addr) = cache.get(&key).copied() {
            addr
        } else {
            let resolved = tokio::net::lookup_host(key.as_str())
                .await
                .ok()
                .and_then(|mut addrs| addrs.next());
            match resolved {
                Some(addr) => {
                    tracing::debug!("resolved {key} -> {addr}");
                    cache.put(key.clone(), addr);
                    addr
                }
                None => {
                    // Packet loss, not session loss.
                    tracing::warn!("failed to resolve {key}, dropping datagram");
                    continue;
                }
            }
        };

        if !payload.is_empty() {
            if let Err(e) = socket.send_to(payload, addr).await {
                tracing::error!("UDP send to {addr} failed: {e}");
                return;
            }
        }
    }
}

/// UDP socket → client stream.
async fn ingress_loop<W>(mut stream: W, socket: Arc<UdpSocket>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = buffer::take();
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::debug!("UDP recv failed: {e}");
                return;
            }
        };
        let chunk = encode_ingress_chunk(addr, &buf[..n]);
        if stream.write_all(&chunk).await.is_err() {
            return;
        }
        if stream.flush().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chunk_hostname_round_trip() {
        let chunk = encode_forward_chunk("example.test", 53, b"query").unwrap();
        let (host, port, payload) = parse_forward_chunk(&chunk).unwrap();
        assert_eq!(host, "example.test");
        assert_eq!(port, 53);
        assert_eq!(payload, b"query".as_slice());
    }

    #[test]
    fn test_forward_chunk_ipv4_uses_compact_form() {
        let chunk = encode_forward_chunk("127.0.0.1", 7, b"ping").unwrap();
        assert_eq!(chunk[1], 0); // host length zero selects the IP form
        assert_eq!(chunk[2], 4);
        let (host, port, payload) = parse_forward_chunk(&chunk).unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 7);
        assert_eq!(payload, b"ping".as_slice());
    }

    #[test]
    fn test_forward_chunk_ipv6_round_trip() {
        let chunk = encode_forward_chunk("::1", 443, b"").unwrap();
        assert_eq!(chunk[2], 6);
        let (host, port, payload) = parse_forward_chunk(&chunk).unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_short_chunks_are_rejected() {
        assert!(parse_forward_chunk(&[CMD_UDP_FORWARD, 0, 4]).is_err());
        assert!(parse_forward_chunk(&[CMD_UDP_FORWARD, 5, b'a', b'b']).is_err());
        assert!(parse_forward_chunk(&[]).is_err());
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let err = parse_forward_chunk(&[0x09, 0, 4, 1, 2, 3, 4, 0, 7]).unwrap_err();
        assert!(err.to_string().contains("unknown UDP command"));
    }

    #[test]
    fn test_ingress_chunk_round_trip() {
        let addr: SocketAddr = "192.0.2.9:4242".parse().unwrap();
        let chunk = encode_ingress_chunk(addr, b"datagram");
        let (got_addr, payload) = parse_ingress_chunk(&chunk).unwrap();
        assert_eq!(got_addr, addr);
        assert_eq!(payload, b"datagram".as_slice());

        let addr6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        let chunk = encode_ingress_chunk(addr6, b"x");
        let (got_addr, payload) = parse_ingress_chunk(&chunk).unwrap();
        assert_eq!(got_addr, addr6);
        assert_eq!(payload, b"x".as_slice());
    }
}
