//! Client-side proxy orchestrator.
//!
//! Accepts local SOCKS5 connections, leases a tunnel session from the
//! pool (dialing, obfuscating and AEAD-wrapping a fresh one when the
//! pool is dry), writes the snell request header and relays. v1 sessions
//! are single-shot; v2 sessions go through the end-of-request lifecycle
//! and return to the pool for the next request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::aead::AeadStream;
use crate::config::ClientConfig;
use crate::crypto::PskCipher;
use crate::error::{Error, Result};
use crate::obfs::ObfsStream;
use crate::relay::{relay, CopyError};
use crate::snell::pool::{Lease, Pool, DEFAULT_CAPACITY, DEFAULT_LEASE};
use crate::snell::session::ClientSession;
use crate::snell::{connect_header, drain_until_zero_chunk};
use crate::socks5::{self, TargetAddr};

/// The fully wrapped transport under a client session.
pub type TunnelStream = AeadStream<ObfsStream<TcpStream>>;

/// A poolable connection to the snell server.
pub type Session = ClientSession<TunnelStream>;

/// The client-side proxy.
pub struct SnellClient {
    config: Arc<ClientConfig>,
    pool: Pool<Session>,
    listener: TcpListener,
}

impl SnellClient {
    /// Validate `config` and bind the local SOCKS5 listener.
    pub async fn bind(mut config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen).await?;
        tracing::info!("SOCKS5 proxy listening on {}", listener.local_addr()?);
        Ok(Self {
            config: Arc::new(config),
            pool: Pool::new(DEFAULT_CAPACITY, DEFAULT_LEASE),
            listener,
        })
    }

    /// The bound SOCKS5 listen address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The session pool, exposed for shutdown and inspection.
    pub fn pool(&self) -> &Pool<Session> {
        &self.pool
    }

    /// Accept SOCKS5 connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (conn, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                    continue;
                }
            };
            let config = Arc::clone(&self.config);
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let mut conn = conn;
                match socks5::handshake(&mut conn).await {
                    Ok(Some(target)) => {
                        tracing::debug!("new target from {peer} to {target}");
                        handle_request(conn, target, config, pool).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("SOCKS5 handshake from {peer} failed: {e}");
                    }
                }
            });
        }
    }

    /// Discard all idle sessions.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Dial and fully wrap a fresh session to the server.
async fn new_session(config: &ClientConfig) -> Result<Session> {
    let tcp = TcpStream::connect(&config.server).await?;
    tcp.set_nodelay(true)?;

    let obfs = ObfsStream::client(tcp, config.obfs, &config.obfs_host, config.server_port()?);
    let cipher = PskCipher::new(config.cipher_kind(), config.psk.as_bytes().to_vec());
    Ok(ClientSession::new(AeadStream::new(obfs, cipher)))
}

async fn handle_request(
    mut client: TcpStream,
    target: TargetAddr,
    config: Arc<ClientConfig>,
    pool: Pool<Session>,
) {
    let mut lease: Lease<Session> = match pool.get() {
        Some(lease) => {
            tracing::debug!("reusing pooled session for {target}");
            lease
        }
        None => match new_session(&config).await {
            Ok(session) => pool.lease(session),
            Err(e) => {
                tracing::warn!("failed to reach server for {target}: {e}");
                return;
            }
        },
    };

    let header = match connect_header(config.v2, &target.host, target.port) {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!("cannot request {target}: {e}");
            lease.mark_unusable();
            return;
        }
    };
    let session = lease.get_mut();
    if let Err(e) = write_header(session, &header).await {
        tracing::warn!("failed to write request header: {e}");
        lease.mark_unusable();
        return;
    }

    let (_, from_session) = relay(&mut client, lease.get_mut()).await;
    let _ = client.shutdown().await;
    drop(client);

    if !config.v2 {
        // v1: one request per session.
        lease.mark_unusable();
        return;
    }

    if !finish_v2_request(lease.get_mut(), from_session).await {
        lease.mark_unusable();
        return;
    }
    lease.get_mut().reset_reply();
    tracing::debug!("session cached for reuse");
}

async fn write_header(session: &mut Session, header: &[u8]) -> std::io::Result<()> {
    session.write_all(header).await?;
    session.flush().await
}

/// Run the v2 end-of-request protocol; returns whether the session is
/// clean enough to reuse.
async fn finish_v2_request(session: &mut Session, from_session: Option<CopyError>) -> bool {
    if let Err(e) = session.get_mut().write_zero_chunk().await {
        tracing::error!("unexpected write error {e}");
        return false;
    }

    match from_session {
        // Relay ended from our side; the marker is still in flight.
        None => {}
        // The SOCKS5 peer stopped reading first. Not the session's fault.
        Some(CopyError::Write(e)) => {
            tracing::debug!("ignored write error {e}");
        }
        // The server already finished the request during the relay.
        Some(CopyError::Read(e)) if Error::is_zero_chunk(&e) => return true,
        Some(CopyError::Read(e)) => {
            // A server-reported dial failure also lands here: the session
            // is dropped rather than trusted for reuse.
            match Error::app_message(&e) {
                Some(msg) => tracing::warn!("server reported error: {msg}"),
                None => tracing::warn!("session error: {e}"),
            }
            return false;
        }
    }

    match drain_until_zero_chunk(session).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("unexpected error {e}, zero chunk wanted");
            false
        }
    }
}
