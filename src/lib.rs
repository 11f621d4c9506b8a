//! A bidirectional TCP tunneling proxy speaking the snell
//! obfuscated-transport protocol.
//!
//! The client side accepts local SOCKS5 connections and forwards each
//! request through an encrypted, optionally traffic-shaped tunnel to the
//! server side, which dials the requested destination and relays bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            snell protocol (request loop)             │
//! ├──────────────────────────────────────────────────────┤
//! │   AEAD record layer (Argon2id PSK, counter nonces)   │
//! ├──────────────────────────────────────────────────────┤
//! │    obfuscation shim (HTTP upgrade / fake TLS 1.2)    │
//! ├──────────────────────────────────────────────────────┤
//! │                        TCP                           │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Two protocol generations coexist: v1 runs one request per connection
//! under ChaCha20-Poly1305, v2 multiplexes sequential requests over a
//! pooled connection under AES-128-GCM, delimiting them with zero-length
//! AEAD chunks. The server accepts both through a receive-side cipher
//! fallback. A UDP-over-TCP mode forwards datagrams across the same
//! carrier.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod aead;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod obfs;
pub mod relay;
pub mod snell;
pub mod socks5;

pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use obfs::ObfsMode;
pub use snell::client::SnellClient;
pub use snell::server::SnellServer;
