//! Data-plane cipher pipeline for an SSR-family proxy tunnel.
//!
//! This library is a sans-I/O implementation of the byte transforms between
//! a local proxy endpoint and its remote peer. It owns no sockets and spawns
//! no tasks; callers feed it byte slices in arrival order and ship whatever
//! it returns. A tunnel's wire stream passes through three layers:
//!
//! 1. a **protocol plugin** framing the plaintext (`origin`,
//!    `verify_simple`),
//! 2. the **base cipher**, an AEAD sealing length-prefixed chunks
//!    (`chacha20-poly1305`, `aes-128-gcm`, `aes-256-gcm`),
//! 3. an **obfs plugin** disguising the result on the wire (`plain`,
//!    `http_simple`, `session_ticket`), optionally replaced on top by
//!    RFC6455 WebSocket framing when the over-TLS disguise is active.
//!
//! # Usage
//!
//! Load a [`ServerConfig`], build one [`CipherEnv`] from it, then one
//! [`TunnelCipher`] per connection:
//!
//! ```
//! use std::sync::Arc;
//! use ssrwire::{CipherEnv, ServerConfig, TunnelCipher};
//!
//! # fn main() -> Result<(), ssrwire::Error> {
//! let config = ServerConfig::from_json_str(
//!     r#"{"password": "p@ss", "method": "aes-256-gcm"}"#,
//! )?;
//! let env = Arc::new(CipherEnv::new(Arc::new(config))?);
//!
//! let mut client = TunnelCipher::new(&env, 0)?;
//! let mut server = TunnelCipher::new(&env, 0)?;
//!
//! let wire = client.client_encrypt(b"hello")?;
//! let decrypted = server.server_decrypt(wire.as_slice())?;
//! assert_eq!(decrypted.payload.as_slice(), b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! The first `client_*` or `server_*` call fixes which end of the tunnel a
//! context speaks for. When a decrypt returns a feedback, receipt or confirm
//! buffer, it is wire-ready and must be sent to the peer before any further
//! payload.

#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod buffer;
mod crypto;
mod env;
mod obfs;
mod protocol;
mod random;
mod tunnel;
mod websocket;

pub use crate::{
    buffer::Buffer,
    config::ServerConfig,
    crypto::CipherKind,
    env::CipherEnv,
    error::Error,
    random::fill_random_bytes,
    tunnel::{ServerDecrypted, TunnelCipher},
    websocket::{Frame, build_frame, compute_sec_websocket_accept, generate_sec_websocket_key,
        parse_frame},
};
