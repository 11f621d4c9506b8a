//! Server-side proxy orchestrator.
//!
//! Every accepted connection is wrapped obfs-server → AEAD-with-fallback
//! (AES-128-GCM primary, ChaCha20-Poly1305 fallback, both derived from
//! the shared PSK) and handed to a request loop: handshake, dial, relay,
//! and for v2 the zero-chunk end-of-request dance before looping for the
//! next request on the same connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::aead::AeadStream;
use crate::config::ServerConfig;
use crate::crypto::{CipherKind, PskCipher};
use crate::error::Error;
use crate::obfs::ObfsStream;
use crate::relay::{relay, CopyError};
use crate::snell::{
    drain_until_zero_chunk, read_handshake, udp, write_error_reply, CMD_CONNECT, CMD_CONNECT_V2,
    CMD_PING, CMD_UDP, RESP_PONG, RESP_TUNNEL,
};

/// The server-side proxy.
pub struct SnellServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
}

impl SnellServer {
    /// Validate `config` and bind the listener. TCP Fast Open is enabled
    /// best-effort where the platform supports it.
    pub async fn bind(config: ServerConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen).await?;
        set_tcp_fastopen(&listener);
        tracing::info!("snell server listening on {}", listener.local_addr()?);
        Ok(Self {
            config: Arc::new(config),
            listener,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> crate::error::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until the task is dropped.
    pub async fn run(&self) -> crate::error::Result<()> {
        let psk = self.config.psk.as_bytes().to_vec();
        let primary = PskCipher::new(CipherKind::Aes128Gcm, psk.clone());
        let fallback = PskCipher::new(CipherKind::ChaCha20Poly1305, psk);

        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    continue;
                }
            };
            let mode = self.config.obfs;
            let primary = primary.clone();
            let fallback = fallback.clone();
            tokio::spawn(async move {
                let _ = conn.set_nodelay(true);
                let obfs = ObfsStream::server(conn, mode);
                let stream = AeadStream::with_fallback(obfs, primary, fallback);
                handle_session(stream, peer).await;
            });
        }
    }
}

/// Run the request loop on one decrypted session.
pub(crate) async fn handle_session<S>(mut stream: AeadStream<ObfsStream<S>>, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut is_v2 = true;

    while is_v2 {
        let hs = match read_handshake(&mut stream).await {
            Ok(hs) => hs,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::warn!("handshake from {peer} failed: {e}");
                }
                break;
            }
        };
        if !hs.client_id.is_empty() {
            // Advisory only; nothing is authenticated against it.
            tracing::debug!("client id {}", String::from_utf8_lossy(&hs.client_id));
        }

        match hs.command {
            CMD_PING => {
                if let Err(e) = write_reply_byte(&mut stream, RESP_PONG).await {
                    tracing::error!("failed to write pong: {e}");
                }
                break;
            }
            CMD_CONNECT => is_v2 = false,
            CMD_CONNECT_V2 => {}
            CMD_UDP => {
                udp::handle_udp(stream, peer).await;
                return;
            }
            other => {
                tracing::error!("unknown command {other:#04x}");
                break;
            }
        }

        tracing::debug!("new target from {peer} to {}", hs.target());

        let mut from_client: Option<CopyError> = None;
        match TcpStream::connect((hs.host.as_str(), hs.port)).await {
            Err(e) => {
                tracing::debug!("dial {} failed: {e}", hs.target());
                if let Err(we) = write_error_reply(&mut stream, &e).await {
                    tracing::error!("failed to write error reply: {we}");
                    break;
                }
                // For v2 the zero chunk below still closes the request.
            }
            Ok(mut target) => {
                if let Err(e) = write_reply_byte(&mut stream, RESP_TUNNEL).await {
                    tracing::error!("failed to write tunnel reply: {e}");
                    break;
                }
                let (client_err, _) = relay(&mut stream, &mut target).await;
                from_client = client_err;
            }
        }

        if is_v2 && !finish_v2_request(&mut stream, from_client).await {
            break;
        }
    }

    tracing::debug!("session from {peer} done");
}

async fn write_reply_byte<S>(stream: &mut S, byte: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[byte]).await?;
    stream.flush().await
}

/// Close out one v2 request; returns whether the loop should continue.
async fn finish_v2_request<S>(
    stream: &mut AeadStream<ObfsStream<S>>,
    from_client: Option<CopyError>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = stream.write_zero_chunk().await {
        tracing::error!("unexpected write error {e}");
        return false;
    }

    match from_client {
        None => {}
        // The dialed target stopped reading; the client side is intact.
        Some(CopyError::Write(e)) => {
            tracing::debug!("ignored write error {e}");
        }
        // The client already closed its request during the relay.
        Some(CopyError::Read(e)) if Error::is_zero_chunk(&e) => return true,
        Some(CopyError::Read(e)) => {
            tracing::warn!("unexpected error {e}, zero chunk wanted");
            return false;
        }
    }

    match drain_until_zero_chunk(stream).await {
        Ok(()) => true,
        Err(e) => {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                tracing::warn!("unexpected error {e}, zero chunk wanted");
            }
            false
        }
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_tcp_fastopen(listener: &TcpListener) {
    use std::os::fd::AsRawFd;

    let qlen: libc::c_int = 1;
    // SAFETY: setsockopt on a fd we own; the kernel copies the value out.
    let rc = unsafe {
        libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_TCP,
            libc::TCP_FASTOPEN,
            &qlen as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            "failed to set TCP fastopen: {}",
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_fastopen(_listener: &TcpListener) {}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    use super::*;
    use crate::obfs::ObfsMode;
    use crate::snell::session::ClientSession;
    use crate::snell::{command_header, connect_header, udp as udp_codec, RESP_READY};

    type RawTunnel = AeadStream<ObfsStream<TcpStream>>;

    async fn spawn_server(obfs: ObfsMode) -> SocketAddr {
        let server = SnellServer::bind(ServerConfig {
            listen: "127.0.0.1:0".into(),
            obfs,
            psk: "pass".into(),
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        addr
    }

    async fn spawn_echo_tcp() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn dial_tunnel(server: SocketAddr, obfs: ObfsMode, kind: CipherKind) -> RawTunnel {
        let tcp = TcpStream::connect(server).await.unwrap();
        let obfs = ObfsStream::client(tcp, obfs, "bing.com", server.port());
        AeadStream::new(obfs, PskCipher::new(kind, b"pass".to_vec()))
    }

    #[tokio::test]
    async fn test_connect_echo_without_obfs() {
        let echo = spawn_echo_tcp().await;
        let server = spawn_server(ObfsMode::Off).await;

        let tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;
        let mut session = ClientSession::new(tunnel);

        let header = connect_header(true, "127.0.0.1", echo.port()).unwrap();
        session.write_all(&header).await.unwrap();
        session.write_all(b"hello").await.unwrap();
        session.flush().await.unwrap();

        let mut got = [0u8; 5];
        session.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn test_v1_client_is_accepted_via_fallback() {
        let echo = spawn_echo_tcp().await;
        let server = spawn_server(ObfsMode::Off).await;

        let tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::ChaCha20Poly1305).await;
        let mut session = ClientSession::new(tunnel);

        let header = connect_header(false, "127.0.0.1", echo.port()).unwrap();
        session.write_all(&header).await.unwrap();
        session.write_all(b"v1 data").await.unwrap();
        session.flush().await.unwrap();

        let mut got = [0u8; 7];
        session.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"v1 data");
    }

    #[tokio::test]
    async fn test_tls_obfs_echo() {
        let echo = spawn_echo_tcp().await;
        let server = spawn_server(ObfsMode::Tls).await;

        let tunnel = dial_tunnel(server, ObfsMode::Tls, CipherKind::Aes128Gcm).await;
        let mut session = ClientSession::new(tunnel);

        let header = connect_header(true, "127.0.0.1", echo.port()).unwrap();
        session.write_all(&header).await.unwrap();
        session.write_all(b"covert").await.unwrap();
        session.flush().await.unwrap();

        let mut got = [0u8; 6];
        session.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"covert");
    }

    #[tokio::test]
    async fn test_v2_reuses_one_connection_for_two_requests() {
        let echo = spawn_echo_tcp().await;
        let server = spawn_server(ObfsMode::Off).await;

        let tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;
        let mut session = ClientSession::new(tunnel);
        let mut counter_floor = 0;

        for round in 0..2u32 {
            let header = connect_header(true, "127.0.0.1", echo.port()).unwrap();
            session.write_all(&header).await.unwrap();
            session.write_all(b"data").await.unwrap();
            session.flush().await.unwrap();

            let mut got = [0u8; 4];
            session.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"data");

            // End-of-request: send our marker, then drain to the server's.
            session.get_mut().write_zero_chunk().await.unwrap();
            let mut sink = [0u8; 512];
            loop {
                match session.read(&mut sink).await {
                    Ok(0) => panic!("server closed a v2 session early"),
                    Ok(_) => continue,
                    Err(e) if Error::is_zero_chunk(&e) => break,
                    Err(e) => panic!("unexpected drain error in round {round}: {e}"),
                }
            }
            session.reset_reply();

            // Nonces never reset across requests on the same session.
            let counter = session.get_ref().send_counter();
            assert!(counter > counter_floor, "round {round}: {counter}");
            counter_floor = counter;
        }
    }

    #[tokio::test]
    async fn test_dial_failure_reports_app_error() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let server = spawn_server(ObfsMode::Off).await;

        let tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;
        let mut session = ClientSession::new(tunnel);

        let header = connect_header(true, "127.0.0.1", closed.port()).unwrap();
        session.write_all(&header).await.unwrap();
        session.flush().await.unwrap();

        let err = session.read(&mut [0u8; 16]).await.unwrap_err();
        let msg = Error::app_message(&err).expect("expected an app error");
        assert!(msg.to_lowercase().contains("refused"), "message: {msg}");

        // The zero chunk that closes the failed v2 request still arrives.
        let err = session.read(&mut [0u8; 16]).await.unwrap_err();
        assert!(Error::is_zero_chunk(&err));
    }

    #[tokio::test]
    async fn test_ping_gets_pong_then_close() {
        let server = spawn_server(ObfsMode::Off).await;

        let mut tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;
        tunnel.write_all(&command_header(CMD_PING)).await.unwrap();
        tunnel.flush().await.unwrap();

        let mut pong = [0u8; 1];
        tunnel.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong[0], RESP_PONG);

        let n = tunnel.read(&mut pong).await.unwrap();
        assert_eq!(n, 0, "server should close after a pong");
    }

    #[tokio::test]
    async fn test_udp_over_tcp_echo() {
        let udp_echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = udp_echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = udp_echo.recv_from(&mut buf).await {
                let _ = udp_echo.send_to(&buf[..n], from).await;
            }
        });

        let server = spawn_server(ObfsMode::Off).await;
        let mut tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;

        tunnel.write_all(&command_header(CMD_UDP)).await.unwrap();
        tunnel.flush().await.unwrap();

        let mut ready = [0u8; 1];
        tunnel.read_exact(&mut ready).await.unwrap();
        assert_eq!(ready[0], RESP_READY);

        let chunk =
            udp_codec::encode_forward_chunk("127.0.0.1", echo_addr.port(), b"datagram").unwrap();
        tunnel.write_all(&chunk).await.unwrap();
        tunnel.flush().await.unwrap();

        let mut buf = [0u8; 2048];
        let n = tunnel.read(&mut buf).await.unwrap();
        let (from, payload) = udp_codec::parse_ingress_chunk(&buf[..n]).unwrap();
        assert_eq!(from.port(), echo_addr.port());
        assert_eq!(payload, b"datagram".as_slice());
    }

    #[tokio::test]
    async fn test_unknown_command_ends_the_session() {
        let server = spawn_server(ObfsMode::Off).await;

        let mut tunnel = dial_tunnel(server, ObfsMode::Off, CipherKind::Aes128Gcm).await;
        // A connect-shaped header with a command the server never learned.
        let mut header = connect_header(true, "127.0.0.1", 9).unwrap();
        header[1] = 0x42;
        tunnel.write_all(&header).await.unwrap();
        tunnel.flush().await.unwrap();

        let n = tunnel.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
    }
}
