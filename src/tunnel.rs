//! The per-connection tunnel cipher context.
//!
//! A [`TunnelCipher`] owns one encrypt engine, one decrypt engine, one
//! protocol plugin instance and one obfs plugin instance, and runs the full
//! pipeline in strict stage order:
//!
//! ```text
//! encrypt:  plain -> protocol pre-encrypt -> base cipher -> obfs encode -> wire
//! decrypt:  wire  -> obfs decode -> base cipher -> protocol post-decrypt -> plain
//! ```
//!
//! The context is role-agnostic at creation. The first `client_*` or
//! `server_*` call fixes the role and derives the real direction keys;
//! calling the other family afterwards is malformed internal state and fails
//! with [`CipherError::ClientDecode`].
//!
//! The `tls_*` variants run the same pipeline with the wire layer wrapped in
//! WebSocket frames (client frames masked, server frames unmasked), for use
//! under the over-TLS disguise.
//!
//! [`CipherError::ClientDecode`]: crate::error::CipherError::ClientDecode

use std::sync::Arc;

use log::{debug, trace};

use crate::{
    buffer::Buffer,
    crypto::{DEFAULT_SEGMENT_SIZE, DecryptEngine, Direction, EncryptEngine},
    env::CipherEnv,
    error::{CipherError, Error},
    obfs::ObfsPlugin,
    protocol::ProtocolPlugin,
    websocket::{build_frame, parse_frame},
};

/// Which end of the tunnel this context speaks for. Fixed lazily by the
/// first pipeline call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Role {
    Client,
    Server,
}

/// Result of one server-side decrypt pass.
#[derive(Debug, Default)]
pub struct ServerDecrypted {
    /// Recovered plaintext, possibly empty during handshakes.
    pub payload: Buffer,
    /// Obfs handshake answer to send straight back to the peer, if any.
    pub receipt: Option<Buffer>,
    /// Protocol-level acknowledgment to relay back, if any.
    pub confirm: Option<Buffer>,
}

/// A per-connection cipher pipeline bound to a shared [`CipherEnv`].
#[derive(Debug)]
pub struct TunnelCipher {
    env: Arc<CipherEnv>,
    id: u64,
    role: Option<Role>,
    enc: EncryptEngine,
    dec: DecryptEngine,
    protocol: ProtocolPlugin,
    obfs: ObfsPlugin,
    ws_recv: Buffer,
}

impl TunnelCipher {
    /// Creates a context registered with `env`. `tcp_mss` bounds the
    /// plaintext bytes per sealed chunk; pass 0 for the default.
    pub fn new(env: &Arc<CipherEnv>, tcp_mss: usize) -> Result<Self, Error> {
        let segment_size = if tcp_mss == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            tcp_mss
        };
        let config = env.config();
        let protocol = ProtocolPlugin::new(env.protocol_kind(), &config.protocol_param);
        let obfs = ObfsPlugin::new(
            env.obfs_kind(),
            &config.obfs_param,
            &config.over_tls_server_domain,
            env.master_key().obfs_mac_key(),
        );
        let id = env.register_tunnel();
        Ok(Self {
            env: Arc::clone(env),
            id,
            role: None,
            enc: EncryptEngine::new(env.cipher_kind(), segment_size),
            dec: DecryptEngine::new(env.cipher_kind()),
            protocol,
            obfs,
            ws_recv: Buffer::new(),
        })
    }

    /// Whether the client must expect and relay a handshake feedback message
    /// before treating the tunnel as established.
    pub fn client_need_feedback(&self) -> bool {
        self.protocol.need_feedback() || self.obfs.need_feedback()
    }

    fn ensure_role(&mut self, role: Role) -> Result<(), Error> {
        match self.role {
            Some(current) if current == role => Ok(()),
            Some(_) => Err(CipherError::ClientDecode.into()),
            None => {
                let (enc_dir, dec_dir) = match role {
                    Role::Client => (Direction::ClientToServer, Direction::ServerToClient),
                    Role::Server => (Direction::ServerToClient, Direction::ClientToServer),
                };
                let master = self.env.master_key();
                self.enc.set_key(master.direction_key(enc_dir));
                self.dec.set_key(master.direction_key(dec_dir));
                self.role = Some(role);
                trace!("tunnel {} bound as {:?}", self.id, role);
                Ok(())
            }
        }
    }

    /// Client-side encrypt pass over one plaintext slice.
    pub fn client_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Client)?;
        let framed = self.protocol.client_pre_encrypt(plain)?;
        let sealed = self.enc.seal_chunks(framed.as_slice())?;
        self.obfs.client_encode(sealed.as_slice())
    }

    /// Client-side decrypt pass. The second element is obfs handshake
    /// feedback; when present it must be sent to the peer before any further
    /// payload.
    pub fn client_decrypt(&mut self, wire: &[u8]) -> Result<(Buffer, Option<Buffer>), Error> {
        self.ensure_role(Role::Client)?;
        let (stream, feedback) = self.obfs.client_decode(wire)?;
        let opened = self.dec.open_chunks(stream.as_slice())?;
        let plain = self
            .protocol
            .client_post_decrypt(opened.as_slice(), self.env.protocol_global())?;
        if feedback.is_some() {
            debug!("tunnel {} produced handshake feedback", self.id);
        }
        Ok((plain, feedback))
    }

    /// Server-side encrypt pass over one plaintext slice.
    pub fn server_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Server)?;
        let framed = self.protocol.server_pre_encrypt(plain)?;
        let sealed = self.enc.seal_chunks(framed.as_slice())?;
        self.obfs.server_encode(sealed.as_slice())
    }

    /// Server-side decrypt pass. Receipt and confirm, when present, are
    /// wire-ready and must be sent back to the peer in that order.
    pub fn server_decrypt(&mut self, wire: &[u8]) -> Result<ServerDecrypted, Error> {
        self.ensure_role(Role::Server)?;
        let (stream, receipt) = self.obfs.server_decode(wire, self.env.obfs_global())?;
        let opened = self.dec.open_chunks(stream.as_slice())?;
        let (payload, confirm) = self
            .protocol
            .server_post_decrypt(opened.as_slice(), self.env.protocol_global())?;
        if receipt.is_some() {
            debug!("tunnel {} produced handshake receipt", self.id);
        }
        Ok(ServerDecrypted {
            payload,
            receipt,
            confirm,
        })
    }

    /// Client-side encrypt pass over one UDP datagram. Packet-oriented:
    /// each datagram is sealed independently, so loss and reordering
    /// between datagrams are harmless.
    pub fn client_udp_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Client)?;
        let framed = self.protocol.client_udp_pre_encrypt(plain)?;
        let sealed = self.enc.seal_packet(framed.as_slice())?;
        self.obfs.client_udp_encode(sealed.as_slice())
    }

    /// Client-side decrypt pass over one UDP datagram.
    pub fn client_udp_decrypt(&mut self, wire: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Client)?;
        let stream = self.obfs.client_udp_decode(wire)?;
        let opened = self.dec.open_packet(stream.as_slice())?;
        self.protocol.client_udp_post_decrypt(opened.as_slice())
    }

    /// Server-side mirror of [`client_udp_encrypt`].
    ///
    /// [`client_udp_encrypt`]: TunnelCipher::client_udp_encrypt
    pub fn server_udp_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Server)?;
        let framed = self.protocol.client_udp_pre_encrypt(plain)?;
        let sealed = self.enc.seal_packet(framed.as_slice())?;
        self.obfs.client_udp_encode(sealed.as_slice())
    }

    /// Server-side mirror of [`client_udp_decrypt`].
    ///
    /// [`client_udp_decrypt`]: TunnelCipher::client_udp_decrypt
    pub fn server_udp_decrypt(&mut self, wire: &[u8]) -> Result<Buffer, Error> {
        self.ensure_role(Role::Server)?;
        let stream = self.obfs.client_udp_decode(wire)?;
        let opened = self.dec.open_packet(stream.as_slice())?;
        self.protocol.client_udp_post_decrypt(opened.as_slice())
    }

    /// [`client_encrypt`] with the output wrapped in a masked WebSocket
    /// frame, for the over-TLS disguise. Empty pipeline output produces
    /// empty wire output.
    ///
    /// [`client_encrypt`]: TunnelCipher::client_encrypt
    pub fn tls_client_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        let wire = self.client_encrypt(plain)?;
        frame_wrap(true, wire)
    }

    /// [`client_decrypt`] over a WebSocket frame stream. Partial frames are
    /// retained until completed; feedback comes back frame-wrapped.
    ///
    /// [`client_decrypt`]: TunnelCipher::client_decrypt
    pub fn tls_client_decrypt(&mut self, wire: &[u8]) -> Result<(Buffer, Option<Buffer>), Error> {
        self.ensure_role(Role::Client)?;
        let stream = self.unframe(wire)?;
        let (plain, feedback) = self.client_decrypt(stream.as_slice())?;
        let feedback = match feedback {
            Some(raw) => nonempty(frame_wrap(true, raw)?),
            None => None,
        };
        Ok((plain, feedback))
    }

    /// [`server_encrypt`] with the output wrapped in an unmasked WebSocket
    /// frame.
    ///
    /// [`server_encrypt`]: TunnelCipher::server_encrypt
    pub fn tls_server_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        let wire = self.server_encrypt(plain)?;
        frame_wrap(false, wire)
    }

    /// [`server_decrypt`] over a WebSocket frame stream; receipt and confirm
    /// come back frame-wrapped.
    ///
    /// [`server_decrypt`]: TunnelCipher::server_decrypt
    pub fn tls_server_decrypt(&mut self, wire: &[u8]) -> Result<ServerDecrypted, Error> {
        self.ensure_role(Role::Server)?;
        let stream = self.unframe(wire)?;
        let mut decrypted = self.server_decrypt(stream.as_slice())?;
        decrypted.receipt = match decrypted.receipt.take() {
            Some(raw) => nonempty(frame_wrap(false, raw)?),
            None => None,
        };
        decrypted.confirm = match decrypted.confirm.take() {
            Some(raw) => nonempty(frame_wrap(false, raw)?),
            None => None,
        };
        Ok(decrypted)
    }

    /// Unwraps every complete frame in `wire` plus whatever was pending,
    /// concatenating the payloads. Trailing partial frames stay buffered.
    fn unframe(&mut self, wire: &[u8]) -> Result<Buffer, Error> {
        self.ws_recv.append(wire)?;
        let mut stream = Buffer::new();
        while let Some(frame) = parse_frame(self.ws_recv.as_slice())? {
            stream.append(&frame.payload)?;
            self.ws_recv.truncate_front(frame.consumed);
        }
        Ok(stream)
    }
}

impl Drop for TunnelCipher {
    fn drop(&mut self) {
        self.env.deregister_tunnel(self.id);
    }
}

fn frame_wrap(masked: bool, wire: Buffer) -> Result<Buffer, Error> {
    match build_frame(masked, wire.as_slice()) {
        Some(frame) => Ok(Buffer::from(frame)),
        None => Ok(Buffer::new()),
    }
}

fn nonempty(buffer: Buffer) -> Option<Buffer> {
    if buffer.is_empty() { None } else { Some(buffer) }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ServerConfig;

    const METHODS: [&str; 3] = ["chacha20-poly1305", "aes-128-gcm", "aes-256-gcm"];
    const PROTOCOLS: [&str; 2] = ["origin", "verify_simple"];
    const OBFS: [&str; 3] = ["plain", "http_simple", "session_ticket"];

    fn env(method: &str, protocol: &str, obfs: &str, password: &str) -> Arc<CipherEnv> {
        let config = ServerConfig {
            password: password.to_string(),
            method: method.to_string(),
            protocol: protocol.to_string(),
            obfs: obfs.to_string(),
            ..ServerConfig::default()
        };
        Arc::new(CipherEnv::new(Arc::new(config)).unwrap())
    }

    /// Runs the full handshake plus one payload exchange in each direction.
    fn exercise_pair(client: &mut TunnelCipher, server: &mut TunnelCipher) {
        let request = b"GET /resource HTTP/1.1\r\n\r\n";
        let wire = client.client_encrypt(request).unwrap();
        let decrypted = server.server_decrypt(wire.as_slice()).unwrap();
        assert_eq!(decrypted.payload.as_slice(), request);
        assert!(decrypted.confirm.is_none());

        if let Some(receipt) = decrypted.receipt {
            let (plain, feedback) = client.client_decrypt(receipt.as_slice()).unwrap();
            assert!(plain.is_empty());
            if let Some(feedback) = feedback {
                let decrypted = server.server_decrypt(feedback.as_slice()).unwrap();
                assert!(decrypted.payload.is_empty());
                assert!(decrypted.receipt.is_none());
            }
        }
        assert!(!client.client_need_feedback());

        let response = vec![0xc3u8; 9000];
        let wire = server.server_encrypt(&response).unwrap();
        let (plain, feedback) = client.client_decrypt(wire.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), &response[..]);
        assert!(feedback.is_none());
    }

    #[test]
    fn test_roundtrip_every_combination() {
        for method in METHODS {
            for protocol in PROTOCOLS {
                for obfs in OBFS {
                    let env = env(method, protocol, obfs, "combination pw");
                    let mut client = TunnelCipher::new(&env, 0).unwrap();
                    let mut server = TunnelCipher::new(&env, 0).unwrap();
                    exercise_pair(&mut client, &mut server);
                }
            }
        }
    }

    #[test]
    fn test_wrong_password_rejected() {
        let client_env = env("aes-256-gcm", "origin", "plain", "right password");
        let server_env = env("aes-256-gcm", "origin", "plain", "wrong password");
        let mut client = TunnelCipher::new(&client_env, 0).unwrap();
        let mut server = TunnelCipher::new(&server_env, 0).unwrap();
        let wire = client.client_encrypt(b"secret").unwrap();
        let err = server.server_decrypt(wire.as_slice()).unwrap_err();
        assert_eq!(err, CipherError::InvalidPassword.into());
    }

    #[test]
    fn test_role_is_fixed_by_first_call() {
        let env = env("aes-128-gcm", "origin", "plain", "pw");
        let mut tunnel = TunnelCipher::new(&env, 0).unwrap();
        tunnel.client_encrypt(b"data").unwrap();
        let err = tunnel.server_encrypt(b"data").unwrap_err();
        assert_eq!(err, CipherError::ClientDecode.into());
    }

    #[test]
    fn test_segment_size_respected() {
        let env = env("aes-128-gcm", "origin", "plain", "pw");
        let mut client = TunnelCipher::new(&env, 536).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();
        let plain = vec![0x11u8; 536 * 4 + 3];
        let wire = client.client_encrypt(&plain).unwrap();
        let decrypted = server.server_decrypt(wire.as_slice()).unwrap();
        assert_eq!(decrypted.payload.as_slice(), &plain[..]);
    }

    #[test]
    fn test_split_delivery_with_completeness_check() {
        let env = env("chacha20-poly1305", "verify_simple", "plain", "pw");
        let mut client = TunnelCipher::new(&env, 0).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();
        let plain = vec![0x42u8; 6000];
        let wire = client.client_encrypt(&plain).unwrap();

        // Reader loop: accumulate until the head unit is complete, then feed.
        let mut pending: Vec<u8> = Vec::new();
        let mut got = Vec::new();
        for &byte in wire.as_slice() {
            pending.push(byte);
            if env.is_completed_package(&pending) {
                let decrypted = server.server_decrypt(&pending).unwrap();
                got.extend_from_slice(decrypted.payload.as_slice());
                pending.clear();
            }
        }
        assert!(pending.is_empty());
        assert_eq!(got, plain);
        let (verified, failures) = env.protocol_unit_counters();
        assert!(verified >= 1);
        assert_eq!(failures, 0);
    }

    #[test]
    fn test_udp_roundtrip_with_loss_and_reorder() {
        let env = env("aes-128-gcm", "verify_simple", "plain", "udp pw");
        let mut client = TunnelCipher::new(&env, 0).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();

        let datagrams: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 200]).collect();
        let wire: Vec<_> = datagrams
            .iter()
            .map(|d| client.client_udp_encrypt(d).unwrap())
            .collect();
        // Deliver out of order and drop one entirely.
        for i in [2usize, 0, 3] {
            let plain = server.server_udp_decrypt(wire[i].as_slice()).unwrap();
            assert_eq!(plain.as_slice(), &datagrams[i][..]);
        }

        let reply = server.server_udp_encrypt(b"udp reply").unwrap();
        let plain = client.client_udp_decrypt(reply.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"udp reply");
    }

    #[test]
    fn test_tls_roundtrip_plain_obfs() {
        let env = env("aes-128-gcm", "origin", "plain", "ws pw");
        let mut client = TunnelCipher::new(&env, 0).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();

        let wire = client.tls_client_encrypt(b"upstream").unwrap();
        // Client frames carry the mask bit.
        assert_eq!(wire.as_slice()[1] & 0x80, 0x80);
        let decrypted = server.tls_server_decrypt(wire.as_slice()).unwrap();
        assert_eq!(decrypted.payload.as_slice(), b"upstream");

        let wire = server.tls_server_encrypt(b"downstream").unwrap();
        assert_eq!(wire.as_slice()[1] & 0x80, 0);
        let (plain, feedback) = client.tls_client_decrypt(wire.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"downstream");
        assert!(feedback.is_none());
    }

    #[test]
    fn test_tls_handshake_messages_are_framed() {
        let env = env("aes-128-gcm", "origin", "session_ticket", "ws pw");
        let mut client = TunnelCipher::new(&env, 0).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();

        let wire = client.tls_client_encrypt(b"hello").unwrap();
        let decrypted = server.tls_server_decrypt(wire.as_slice()).unwrap();
        assert_eq!(decrypted.payload.as_slice(), b"hello");
        let receipt = decrypted.receipt.expect("ticket handshake needs a receipt");
        // The receipt is itself an unmasked WebSocket frame.
        assert_eq!(receipt.as_slice()[0], 0x82);
        assert_eq!(receipt.as_slice()[1] & 0x80, 0);

        let (plain, feedback) = client.tls_client_decrypt(receipt.as_slice()).unwrap();
        assert!(plain.is_empty());
        let feedback = feedback.expect("client must answer the server hello");
        assert_eq!(feedback.as_slice()[1] & 0x80, 0x80);
        let decrypted = server.tls_server_decrypt(feedback.as_slice()).unwrap();
        assert!(decrypted.payload.is_empty());
        assert!(!client.client_need_feedback());
    }

    #[test]
    fn test_tls_partial_frame_delivery() {
        let env = env("aes-256-gcm", "origin", "plain", "ws pw");
        let mut client = TunnelCipher::new(&env, 0).unwrap();
        let mut server = TunnelCipher::new(&env, 0).unwrap();
        let plain = vec![0x99u8; 3000];
        let wire = client.tls_client_encrypt(&plain).unwrap();

        let mut got = Vec::new();
        for piece in wire.as_slice().chunks(17) {
            let decrypted = server.tls_server_decrypt(piece).unwrap();
            got.extend_from_slice(decrypted.payload.as_slice());
        }
        assert_eq!(got, plain);
    }

    #[test]
    fn test_lifecycle_accounting() {
        let env = env("aes-128-gcm", "origin", "plain", "pw");
        let tunnels: Vec<TunnelCipher> = (0..8)
            .map(|_| TunnelCipher::new(&env, 0).unwrap())
            .collect();
        assert_eq!(env.live_tunnels(), 8);
        drop(tunnels);
        assert_eq!(env.live_tunnels(), 0);
    }
}
