//! Reusable scratch buffers for relay and record I/O.
//!
//! Every hot loop in the proxy (relay pumps, v2 drains, UDP chunk
//! handling, AEAD record reassembly) works on a buffer large enough for
//! one maximum-size AEAD record. Buffers are recycled through a small
//! global freelist instead of being reallocated per connection.

use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::crypto::{LENGTH_RECORD_SIZE, MAX_CHUNK, TAG_SIZE};

/// Scratch buffer size: one maximum AEAD data record plus its length record.
pub const RELAY_BUFFER_SIZE: usize = MAX_CHUNK + TAG_SIZE + LENGTH_RECORD_SIZE;

/// How many idle buffers the freelist retains.
const MAX_RETAINED: usize = 32;

static FREELIST: LazyLock<Mutex<Vec<Vec<u8>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// A scratch buffer borrowed from the freelist, returned on drop.
pub struct PooledBuf {
    buf: Vec<u8>,
}

/// Borrow a `RELAY_BUFFER_SIZE` scratch buffer.
pub fn take() -> PooledBuf {
    let buf = FREELIST
        .lock()
        .pop()
        .unwrap_or_else(|| vec![0u8; RELAY_BUFFER_SIZE]);
    PooledBuf { buf }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut free = FREELIST.lock();
        if free.len() < MAX_RETAINED {
            free.push(std::mem::take(&mut self.buf));
        }
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
