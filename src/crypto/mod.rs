//! Cryptographic primitives for the snell record layer.
//!
//! This module provides:
//! - the two supported AEAD ciphers (AES-128-GCM, ChaCha20-Poly1305)
//! - the Argon2id pre-shared-key derivation
//! - counter-based nonce management
//!
//! Key material derived from the PSK is zeroized as soon as the cipher
//! instance is constructed.

mod cipher;

pub use cipher::{AeadCipher, CipherKind, PskCipher};

/// Size of the AEAD nonce in bytes (96 bits for both ciphers)
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the per-direction salt sent in the clear
pub const SALT_SIZE: usize = 16;

/// Maximum plaintext length of a single AEAD data record
pub const MAX_CHUNK: usize = 16 * 1024;

/// Wire size of an encrypted length record (2-byte length + tag)
pub const LENGTH_RECORD_SIZE: usize = 2 + TAG_SIZE;
