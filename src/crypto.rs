//! Base cipher interface.
//!
//! This module provides the per-direction AEAD engines at the bottom of the
//! tunnel pipeline. Keys are derived from the configured password; each
//! traffic direction gets its own key and counter nonce, since the sequence
//! state is direction-specific.
//!
//! On the wire, the base cipher speaks length-prefixed chunks:
//!
//! ```text
//! | body_len | ciphertext | tag |
//! |    2B    |  variable  | 16B |
//! |          |      <- body ->  |
//! ```
//!
//! `body_len` is big-endian and counts ciphertext plus tag. The decrypt
//! engine buffers partial chunks internally, so feeding it arbitrary slices
//! of the stream is safe as long as the slices arrive in order.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::aead::{
    AES_128_GCM, AES_256_GCM, Aad, CHACHA20_POLY1305, LessSafeKey, Nonce, UnboundKey,
};
use blake3::Hasher;
use rand::{TryRngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    buffer::Buffer,
    error::{CipherError, ConfigError, Error},
};

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const CHUNK_HDR_LEN: usize = 2;
const NONCE_LEN: usize = 12;
const CHUNK_BODY_MAX: usize = u16::MAX as usize;

/// Default maximum plaintext bytes per sealed chunk when the caller gives
/// no segment size hint.
pub(crate) const DEFAULT_SEGMENT_SIZE: usize = 1448;

/// Authenticated Encryption with Associated Data (AEAD) cipher used as the
/// tunnel's base cipher, selected by the `method` configuration key.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CipherKind {
    /// ChaCha20-Poly1305-IETF with 128-bit tags and 96 bit nonces.
    ChaCha20Poly1305,

    /// AES-128 in GCM mode with 128-bit tags and 96 bit nonces.
    ///
    /// This is the default base cipher.
    #[default]
    Aes128Gcm,

    /// AES-256 in GCM mode with 128-bit tags and 96 bit nonces.
    Aes256Gcm,
}

impl CipherKind {
    /// Resolves a configured method name. Unknown names are a configuration
    /// error, not a runtime fault.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            _ => Err(ConfigError::UnknownMethod {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

/// A 256-bit key derived from the configured password.
///
/// One master key exists per cipher environment; direction-specific session
/// keys are derived from it with a direction label.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct MasterKey([u8; 32]);

impl MasterKey {
    pub(crate) fn derive_from_password(password: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(password.as_bytes());
        hasher.update(b"ssrwire master key from password");
        Self(*hasher.finalize().as_bytes())
    }

    /// Derives the session key for one traffic direction.
    pub(crate) fn direction_key(&self, direction: Direction) -> DirectionKey {
        let label: &[u8] = match direction {
            Direction::ClientToServer => b"client_to_server",
            Direction::ServerToClient => b"server_to_client",
        };
        let mut hasher = Hasher::new();
        hasher.update(&self.0);
        hasher.update(label);
        DirectionKey(*hasher.finalize().as_bytes())
    }

    /// Derives the keyed-MAC key handed to obfs plugin instances.
    pub(crate) fn obfs_mac_key(&self) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(&self.0);
        hasher.update(b"ssrwire obfs ticket mac key");
        *hasher.finalize().as_bytes()
    }
}

impl Debug for MasterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"*****").finish()
    }
}

/// A 256-bit key for a single traffic direction.
#[derive(Clone, Eq, PartialEq, Zeroize, ZeroizeOnDrop)]
pub(crate) struct DirectionKey([u8; 32]);

impl DirectionKey {
    /// Generates an invalid key, used as a placeholder until the tunnel's
    /// role is known. Filled with system entropy to prevent accidental use.
    pub(crate) fn dumb() -> Self {
        let mut key = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut key)
            .expect("system random source failure");
        Self(key)
    }
}

impl Debug for DirectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DirectionKey").field(&"*****").finish()
    }
}

/// One traffic direction of a tunnel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum Direction {
    ClientToServer,
    ServerToClient,
}

/// The encrypt-path engine of one tunnel direction.
#[derive(Debug)]
pub(crate) struct EncryptEngine {
    cipher: StatelessCipher,
    nonce: CounterNonce,
    max_payload: usize,
}

impl EncryptEngine {
    pub(crate) fn new(kind: CipherKind, segment_size: usize) -> Self {
        let max_payload = segment_size
            .clamp(1, CHUNK_BODY_MAX - TAG_LEN);
        Self {
            cipher: StatelessCipher::with_key(kind, DirectionKey::dumb()),
            nonce: CounterNonce::default(),
            max_payload,
        }
    }

    pub(crate) fn set_key(&mut self, key: DirectionKey) {
        self.cipher = StatelessCipher::with_key(self.cipher.kind, key);
    }

    /// Seals `plain` into one or more wire chunks, in order.
    ///
    /// An empty input produces an empty output: zero chunks, zero bytes.
    pub(crate) fn seal_chunks(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        let mut out = Buffer::with_capacity(
            plain.len() + (plain.len() / self.max_payload + 1) * (CHUNK_HDR_LEN + TAG_LEN),
        )?;
        for segment in plain.chunks(self.max_payload) {
            let body_len = segment.len() + TAG_LEN;
            let mut body = Vec::new();
            body.try_reserve(body_len)?;
            body.extend_from_slice(segment);
            body.resize(body_len, 0);
            self.cipher.seal(&mut body, self.nonce.next());
            out.append(&(body_len as u16).to_be_bytes())?;
            out.append(&body)?;
        }
        Ok(out)
    }

    /// Seals one datagram as `[nonce | ciphertext | tag]` with a fresh
    /// random nonce. Packet-oriented: no counter state, so loss and
    /// reordering between packets are harmless.
    pub(crate) fn seal_packet(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .expect("system random source failure");
        let body_len = plain.len() + TAG_LEN;
        let mut body = Vec::new();
        body.try_reserve(body_len)?;
        body.extend_from_slice(plain);
        body.resize(body_len, 0);
        self.cipher.seal(&mut body, nonce);
        let mut out = Buffer::with_capacity(NONCE_LEN + body_len)?;
        out.append(&nonce)?;
        out.append(&body)?;
        Ok(out)
    }
}

/// The decrypt-path engine of one tunnel direction.
///
/// Holds back the tail of a partially received chunk until the rest arrives.
#[derive(Debug)]
pub(crate) struct DecryptEngine {
    cipher: StatelessCipher,
    nonce: CounterNonce,
    pending: Buffer,
}

impl DecryptEngine {
    pub(crate) fn new(kind: CipherKind) -> Self {
        Self {
            cipher: StatelessCipher::with_key(kind, DirectionKey::dumb()),
            nonce: CounterNonce::default(),
            pending: Buffer::new(),
        }
    }

    pub(crate) fn set_key(&mut self, key: DirectionKey) {
        self.cipher = StatelessCipher::with_key(self.cipher.kind, key);
    }

    /// Opens every complete chunk in `wire` plus whatever was pending,
    /// returning the concatenated plaintext. Trailing partial chunks are
    /// retained for the next call.
    ///
    /// # Errors
    ///
    /// [`CipherError::ClientDecode`] for a chunk header too short to hold a
    /// tag; [`CipherError::InvalidPassword`] when authentication fails.
    pub(crate) fn open_chunks(&mut self, wire: &[u8]) -> Result<Buffer, Error> {
        self.pending.append(wire)?;
        let mut out = Buffer::new();
        loop {
            let data = self.pending.as_slice();
            if data.len() < CHUNK_HDR_LEN {
                break;
            }
            let body_len = u16::from_be_bytes([data[0], data[1]]) as usize;
            if body_len < TAG_LEN {
                return Err(CipherError::ClientDecode.into());
            }
            if data.len() < CHUNK_HDR_LEN + body_len {
                break;
            }
            let mut body = Vec::new();
            body.try_reserve(body_len)?;
            body.extend_from_slice(&data[CHUNK_HDR_LEN..CHUNK_HDR_LEN + body_len]);
            if self.cipher.open(&mut body, self.nonce.next()).is_err() {
                return Err(CipherError::InvalidPassword.into());
            }
            out.append(&body[..body_len - TAG_LEN])?;
            self.pending.truncate_front(CHUNK_HDR_LEN + body_len);
        }
        Ok(out)
    }

    /// Opens one datagram sealed by [`EncryptEngine::seal_packet`].
    pub(crate) fn open_packet(&mut self, wire: &[u8]) -> Result<Buffer, Error> {
        if wire.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::ClientDecode.into());
        }
        let (nonce, rest) = wire.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce.try_into().unwrap();
        let mut body = Vec::new();
        body.try_reserve(rest.len())?;
        body.extend_from_slice(rest);
        if self.cipher.open(&mut body, nonce).is_err() {
            return Err(CipherError::InvalidPassword.into());
        }
        Buffer::from_slice(&body[..body.len() - TAG_LEN])
    }
}

/// Reports whether `data` starts with a complete base-cipher chunk.
pub(crate) fn is_complete_chunk(data: &[u8]) -> bool {
    if data.len() < CHUNK_HDR_LEN {
        return false;
    }
    let body_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    data.len() >= CHUNK_HDR_LEN + body_len
}

#[derive(Debug)]
struct StatelessCipher {
    key: LessSafeKey,
    kind: CipherKind,
}

impl StatelessCipher {
    fn with_key(kind: CipherKind, key: DirectionKey) -> Self {
        Self {
            key: LessSafeKey::new(match kind {
                CipherKind::ChaCha20Poly1305 => {
                    UnboundKey::new(&CHACHA20_POLY1305, &key.0).unwrap()
                }
                CipherKind::Aes128Gcm => UnboundKey::new(&AES_128_GCM, &key.0[..16]).unwrap(),
                CipherKind::Aes256Gcm => UnboundKey::new(&AES_256_GCM, &key.0).unwrap(),
            }),
            kind,
        }
    }

    fn open(&self, in_out: &mut [u8], nonce: [u8; NONCE_LEN]) -> Result<(), ()> {
        self.key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), in_out)
            .map_err(|_| ())?;
        Ok(())
    }

    fn seal(&self, in_out: &mut [u8], nonce: [u8; NONCE_LEN]) {
        let (in_out, tag) = in_out.split_at_mut(in_out.len() - TAG_LEN);
        let t = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), in_out)
            .expect("encrypt failed, this should never happen");
        tag.copy_from_slice(t.as_ref());
    }
}

#[derive(Debug, Default)]
struct CounterNonce(u64);

impl CounterNonce {
    fn next(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.0.to_le_bytes());
        self.0 += 1;
        nonce
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn paired_engines(kind: CipherKind, password: &str) -> (EncryptEngine, DecryptEngine) {
        let master = MasterKey::derive_from_password(password);
        let mut enc = EncryptEngine::new(kind, DEFAULT_SEGMENT_SIZE);
        let mut dec = DecryptEngine::new(kind);
        enc.set_key(master.direction_key(Direction::ClientToServer));
        dec.set_key(master.direction_key(Direction::ClientToServer));
        (enc, dec)
    }

    fn test_seal_open(kind: CipherKind) {
        let (mut enc, mut dec) = paired_engines(kind, "test password");
        let plaintext = b"Hello, world!";
        let wire = enc.seal_chunks(plaintext).unwrap();
        assert!(is_complete_chunk(wire.as_slice()));
        let plain = dec.open_chunks(wire.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), plaintext);
    }

    fn test_multi_chunk(kind: CipherKind) {
        let (mut enc, mut dec) = paired_engines(kind, "test password");
        let plaintext = vec![0x5au8; DEFAULT_SEGMENT_SIZE * 3 + 17];
        let wire = enc.seal_chunks(&plaintext).unwrap();
        let plain = dec.open_chunks(wire.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), &plaintext[..]);
    }

    fn test_partial_delivery(kind: CipherKind) {
        let (mut enc, mut dec) = paired_engines(kind, "test password");
        let plaintext = vec![0xa5u8; 4096];
        let wire = enc.seal_chunks(&plaintext).unwrap();
        let mut plain = Vec::new();
        for piece in wire.as_slice().chunks(7) {
            let out = dec.open_chunks(piece).unwrap();
            plain.extend_from_slice(out.as_slice());
        }
        assert_eq!(plain, plaintext);
    }

    fn test_wrong_password(kind: CipherKind) {
        let (mut enc, _) = paired_engines(kind, "password X");
        let (_, mut dec) = paired_engines(kind, "password Y");
        let wire = enc.seal_chunks(b"secret").unwrap();
        assert_eq!(
            dec.open_chunks(wire.as_slice()),
            Err(CipherError::InvalidPassword.into())
        );
    }

    #[test]
    fn test_cipher_chacha20_poly1305() {
        test_seal_open(CipherKind::ChaCha20Poly1305);
        test_multi_chunk(CipherKind::ChaCha20Poly1305);
        test_partial_delivery(CipherKind::ChaCha20Poly1305);
        test_wrong_password(CipherKind::ChaCha20Poly1305);
    }

    #[test]
    fn test_cipher_aes_128_gcm() {
        test_seal_open(CipherKind::Aes128Gcm);
        test_multi_chunk(CipherKind::Aes128Gcm);
        test_partial_delivery(CipherKind::Aes128Gcm);
        test_wrong_password(CipherKind::Aes128Gcm);
    }

    #[test]
    fn test_cipher_aes_256_gcm() {
        test_seal_open(CipherKind::Aes256Gcm);
        test_multi_chunk(CipherKind::Aes256Gcm);
        test_partial_delivery(CipherKind::Aes256Gcm);
        test_wrong_password(CipherKind::Aes256Gcm);
    }

    #[test]
    fn test_packet_seal_open_tolerates_reordering() {
        let (mut enc, mut dec) = paired_engines(CipherKind::Aes256Gcm, "udp pw");
        let packets: Vec<_> = (0..3u8)
            .map(|i| enc.seal_packet(&[i; 100]).unwrap())
            .collect();
        for (i, packet) in packets.iter().enumerate().rev() {
            let plain = dec.open_packet(packet.as_slice()).unwrap();
            assert_eq!(plain.as_slice(), &[i as u8; 100][..]);
        }
    }

    #[test]
    fn test_packet_too_short_is_decode_error() {
        let (_, mut dec) = paired_engines(CipherKind::Aes128Gcm, "udp pw");
        assert_eq!(
            dec.open_packet(&[0u8; NONCE_LEN + TAG_LEN - 1]),
            Err(CipherError::ClientDecode.into())
        );
    }

    #[test]
    fn test_empty_input_empty_output() {
        let (mut enc, mut dec) = paired_engines(CipherKind::default(), "p");
        let wire = enc.seal_chunks(&[]).unwrap();
        assert!(wire.is_empty());
        assert!(dec.open_chunks(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_method_name_lookup() {
        assert_eq!(
            CipherKind::from_name("aes-256-gcm").unwrap(),
            CipherKind::Aes256Gcm
        );
        assert!(CipherKind::from_name("rc4-md5").is_err());
    }
}
