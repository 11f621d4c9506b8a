//! Bidirectional byte pump.
//!
//! [`relay`] bridges two duplex streams: each direction copies until EOF
//! or error, and on completion notifies the opposite direction so its
//! pending read unblocks promptly instead of waiting for peer data that
//! will never come. A pump stopped this way reports no error, the same
//! way a tripped read deadline is rewritten to nil in the original
//! protocol. Per-direction failures keep their read/write distinction so
//! callers can classify the shutdown.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::buffer;

/// Which half of a copy direction failed.
#[derive(Debug)]
pub enum CopyError {
    /// Reading the source side failed.
    Read(io::Error),
    /// Writing the destination side failed.
    Write(io::Error),
}

impl CopyError {
    /// The underlying I/O error.
    pub fn inner(&self) -> &io::Error {
        match self {
            CopyError::Read(e) | CopyError::Write(e) => e,
        }
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Read(e) => write!(f, "read: {e}"),
            CopyError::Write(e) => write!(f, "write: {e}"),
        }
    }
}

/// Bridge `a` and `b` until both directions have finished.
///
/// Returns `(a_to_b, b_to_a)` outcomes; `None` means the direction ended
/// cleanly (EOF, or unblocked because the other direction finished).
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> (Option<CopyError>, Option<CopyError>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(&mut *a);
    let (mut br, mut bw) = tokio::io::split(&mut *b);

    let stop_a_to_b = Notify::new();
    let stop_b_to_a = Notify::new();

    let a_to_b = async {
        let err = pump(&mut ar, &mut bw, &stop_a_to_b).await;
        stop_b_to_a.notify_one();
        err
    };
    let b_to_a = async {
        let err = pump(&mut br, &mut aw, &stop_b_to_a).await;
        stop_a_to_b.notify_one();
        err
    };

    tokio::join!(a_to_b, b_to_a)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, stop: &Notify) -> Option<CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffer::take();
    loop {
        let n = tokio::select! {
            biased;
            _ = stop.notified() => return None,
            res = reader.read(&mut buf) => match res {
                Ok(0) => return None,
                Ok(n) => n,
                Err(e) => return Some(CopyError::Read(e)),
            },
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return Some(CopyError::Write(e));
        }
        if let Err(e) = writer.flush().await {
            return Some(CopyError::Write(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        // peer_a <-> (a | b) <-> peer_b, relay bridging a and b.
        let (mut peer_a, mut a) = duplex(64 * 1024);
        let (mut peer_b, mut b) = duplex(64 * 1024);

        let bridge = tokio::spawn(async move {
            let outcome = relay(&mut a, &mut b).await;
            (a, b, outcome)
        });

        peer_a.write_all(b"to b").await.unwrap();
        let mut got = [0u8; 4];
        peer_b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"to b");

        peer_b.write_all(b"to a").await.unwrap();
        peer_a.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"to a");

        // Closing one peer unblocks the whole relay.
        drop(peer_a);
        drop(peer_b);
        let (_, _, (el, er)) = bridge.await.unwrap();
        assert!(el.is_none());
        assert!(er.is_none());
    }

    #[tokio::test]
    async fn test_one_sided_eof_unblocks_the_reverse_pump() {
        let (peer_a, mut a) = duplex(64 * 1024);
        // peer_b never writes, so the b->a pump would block forever
        // without the notify tripwire.
        let (_peer_b, mut b) = duplex(64 * 1024);

        drop(peer_a); // immediate EOF on a

        let (el, er) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            relay(&mut a, &mut b),
        )
        .await
        .expect("relay must unblock promptly");
        assert!(el.is_none());
        assert!(er.is_none());
    }

    #[tokio::test]
    async fn test_large_transfer_is_lossless() {
        let (mut peer_a, mut a) = duplex(16 * 1024);
        let (mut peer_b, mut b) = duplex(16 * 1024);

        let bridge = tokio::spawn(async move { relay(&mut a, &mut b).await });

        let payload: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            peer_a.write_all(&payload).await.unwrap();
            drop(peer_a);
        });

        let mut got = vec![0u8; expected.len()];
        peer_b.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        writer.await.unwrap();
        drop(peer_b);
        bridge.await.unwrap();
    }
}
