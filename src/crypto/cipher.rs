//! AEAD ciphers and the PSK key derivation.
//!
//! A [`PskCipher`] is the immutable per-deployment descriptor: cipher
//! choice plus pre-shared key. Deriving it with a salt yields an
//! [`AeadCipher`], the stateful sealing/opening half of one stream
//! direction with its own nonce counter.

use aes_gcm::Aes128Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::Zeroize;

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Supported AEAD algorithms.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CipherKind {
    /// AES-128 in GCM mode; the snell v2 cipher.
    Aes128Gcm,
    /// ChaCha20-Poly1305-IETF; the snell v1 cipher.
    ChaCha20Poly1305,
}

impl CipherKind {
    /// Key size in bytes for this cipher.
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::ChaCha20Poly1305 => 32,
        }
    }
}

/// Cipher descriptor: algorithm plus pre-shared key.
///
/// Immutable after construction; per-direction keys are derived from it
/// with a fresh salt via [`PskCipher::derive`].
#[derive(Clone)]
pub struct PskCipher {
    kind: CipherKind,
    psk: Vec<u8>,
}

impl PskCipher {
    /// Create a descriptor from a cipher choice and the shared key.
    pub fn new(kind: CipherKind, psk: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            psk: psk.into(),
        }
    }

    /// The configured algorithm.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Derive the directional key for `salt` and build a cipher instance.
    ///
    /// The key is Argon2id(psk, salt, t=3, m=8 KiB, p=1, out=32) truncated
    /// to the cipher's key size.
    pub fn derive(&self, salt: &[u8]) -> Result<AeadCipher> {
        let params = Params::new(8, 3, 1, Some(32))
            .map_err(|e| Error::crypto(format!("bad KDF parameters: {e}")))?;
        let kdf = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut okm = [0u8; 32];
        kdf.hash_password_into(&self.psk, salt, &mut okm)
            .map_err(|e| Error::crypto(format!("key derivation failed: {e}")))?;

        let inner = match self.kind {
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new_from_slice(&okm[..16])
                    .map_err(|_| Error::crypto("invalid AES-128-GCM key length"))?;
                CipherInner::Aes128Gcm(Box::new(cipher))
            }
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&okm)
                    .map_err(|_| Error::crypto("invalid ChaCha20-Poly1305 key length"))?;
                CipherInner::ChaCha20Poly1305(Box::new(cipher))
            }
        };
        okm.zeroize();

        Ok(AeadCipher { inner, counter: 0 })
    }
}

impl std::fmt::Debug for PskCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskCipher")
            .field("kind", &self.kind)
            .field("psk", &"*****")
            .finish()
    }
}

enum CipherInner {
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
}

/// One direction's sealing/opening state: cipher instance plus nonce counter.
///
/// Nonces are 96-bit little-endian counters starting at 0, advanced after
/// every successfully sealed or opened chunk. A failed open leaves the
/// counter untouched so the same record can be retried under the fallback
/// cipher during receive-side resolution.
pub struct AeadCipher {
    inner: CipherInner,
    counter: u64,
}

impl AeadCipher {
    fn nonce_bytes(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        nonce
    }

    /// Encrypt `buf` in place and return the 16-byte tag; advances the nonce.
    pub fn seal_detached(&mut self, buf: &mut [u8]) -> Result<[u8; TAG_SIZE]> {
        let nonce = self.nonce_bytes();
        let tag = match &self.inner {
            CipherInner::Aes128Gcm(c) => {
                c.encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce), b"", buf)
            }
            CipherInner::ChaCha20Poly1305(c) => {
                c.encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(&nonce), b"", buf)
            }
        }
        .map_err(|_| Error::crypto("encryption failed"))?;

        self.counter = self.counter.wrapping_add(1);
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(tag.as_slice());
        Ok(out)
    }

    /// Decrypt `buf` in place, verifying `tag`; advances the nonce only on
    /// success.
    pub fn open_detached(&mut self, buf: &mut [u8], tag: &[u8]) -> Result<()> {
        if tag.len() != TAG_SIZE {
            return Err(Error::protocol("truncated authentication tag"));
        }
        let nonce = self.nonce_bytes();
        let ok = match &self.inner {
            CipherInner::Aes128Gcm(c) => c
                .decrypt_in_place_detached(
                    aes_gcm::Nonce::from_slice(&nonce),
                    b"",
                    buf,
                    aes_gcm::Tag::from_slice(tag),
                )
                .is_ok(),
            CipherInner::ChaCha20Poly1305(c) => c
                .decrypt_in_place_detached(
                    chacha20poly1305::Nonce::from_slice(&nonce),
                    b"",
                    buf,
                    chacha20poly1305::Tag::from_slice(tag),
                )
                .is_ok(),
        };
        if !ok {
            return Err(Error::AuthFailure);
        }
        self.counter = self.counter.wrapping_add(1);
        Ok(())
    }

    /// Current nonce counter (chunks sealed or opened so far).
    pub fn counter(&self) -> u64 {
        self.counter
    }
}
