//! Protocol plugin: wire-protocol obfuscation applied around the base
//! cipher.
//!
//! The variant set is closed; plugin identity is resolved from the
//! configured name once at environment creation and never changes for the
//! lifetime of a tunnel. Each tunnel owns its own instance (per-connection
//! continuation state); cross-connection bookkeeping lives in
//! [`ProtocolGlobal`], owned by the environment.
//!
//! ## `verify_simple` unit layout
//!
//! ```text
//! | unit_len | pad_len | padding  | payload  | checksum |
//! |    2B    |   1B    | variable | variable |    4B    |
//! ```
//!
//! `unit_len` is big-endian and counts the whole unit; `checksum` is the
//! first four bytes of blake3 over everything before it. Padding is 0-15
//! random bytes per unit.

use std::sync::Mutex;

use rand::{Rng, RngCore, SeedableRng, TryRngCore, rngs::{OsRng, StdRng}};

use crate::{
    buffer::Buffer,
    error::{CipherError, ConfigError, Error},
};

const UNIT_OVERHEAD: usize = 2 + 1 + 4;
const UNIT_PAYLOAD_MAX: usize = 8192;
const PAD_MAX: usize = 15;
const CHECKSUM_LEN: usize = 4;

/// A supported protocol plugin scheme.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum ProtocolKind {
    /// No wire-protocol obfuscation.
    Origin,
    /// Length/checksum unit framing with random padding.
    VerifySimple,
}

impl ProtocolKind {
    pub(crate) fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "origin" => Ok(ProtocolKind::Origin),
            "verify_simple" => Ok(ProtocolKind::VerifySimple),
            _ => Err(ConfigError::UnknownProtocol {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

/// Cross-connection protocol state, shared by all instances of the same
/// plugin within one environment.
#[derive(Debug, Default)]
pub(crate) struct ProtocolGlobal {
    /// Units that passed checksum verification.
    pub(crate) units_verified: u64,
    /// Units rejected with a bad checksum or length.
    pub(crate) checksum_failures: u64,
}

/// A per-connection protocol plugin instance.
#[derive(Debug)]
pub(crate) enum ProtocolPlugin {
    Origin,
    VerifySimple(VerifySimple),
}

impl ProtocolPlugin {
    pub(crate) fn new(kind: ProtocolKind, _param: &str) -> Self {
        match kind {
            ProtocolKind::Origin => ProtocolPlugin::Origin,
            ProtocolKind::VerifySimple => ProtocolPlugin::VerifySimple(VerifySimple::new()),
        }
    }

    /// Whether the plugin must send a handshake message to the peer even
    /// before any payload exists. None of the supported protocol schemes do.
    pub(crate) fn need_feedback(&self) -> bool {
        false
    }

    pub(crate) fn client_pre_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        match self {
            ProtocolPlugin::Origin => Buffer::from_slice(plain),
            ProtocolPlugin::VerifySimple(v) => v.frame_units(plain),
        }
    }

    pub(crate) fn client_post_decrypt(
        &mut self,
        data: &[u8],
        global: &Mutex<ProtocolGlobal>,
    ) -> Result<Buffer, Error> {
        match self {
            ProtocolPlugin::Origin => Buffer::from_slice(data),
            ProtocolPlugin::VerifySimple(v) => v.open_units(data, global),
        }
    }

    pub(crate) fn server_pre_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        self.client_pre_encrypt(plain)
    }

    /// Server-side inverse transform. The optional confirm buffer is a
    /// protocol-level acknowledgment to relay back to the peer; the
    /// supported schemes never produce one.
    pub(crate) fn server_post_decrypt(
        &mut self,
        data: &[u8],
        global: &Mutex<ProtocolGlobal>,
    ) -> Result<(Buffer, Option<Buffer>), Error> {
        let plain = self.client_post_decrypt(data, global)?;
        Ok((plain, None))
    }

    /// UDP encode path. Packet-oriented: no continuation state is carried
    /// across calls.
    pub(crate) fn client_udp_pre_encrypt(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        match self {
            ProtocolPlugin::Origin => Buffer::from_slice(plain),
            ProtocolPlugin::VerifySimple(_) => {
                let mut out = Buffer::from_slice(plain)?;
                out.append(&checksum(plain))?;
                Ok(out)
            }
        }
    }

    /// UDP decode path, the inverse of [`client_udp_pre_encrypt`].
    ///
    /// [`client_udp_pre_encrypt`]: ProtocolPlugin::client_udp_pre_encrypt
    pub(crate) fn client_udp_post_decrypt(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        match self {
            ProtocolPlugin::Origin => Buffer::from_slice(data),
            ProtocolPlugin::VerifySimple(_) => {
                if data.len() < CHECKSUM_LEN {
                    return Err(CipherError::ClientPostDecrypt.into());
                }
                let (payload, sum) = data.split_at(data.len() - CHECKSUM_LEN);
                if checksum(payload) != sum {
                    return Err(CipherError::ClientPostDecrypt.into());
                }
                Buffer::from_slice(payload)
            }
        }
    }
}

/// Per-connection state of the `verify_simple` scheme.
#[derive(Debug)]
pub(crate) struct VerifySimple {
    rng: StdRng,
    recv: Buffer,
}

impl VerifySimple {
    fn new() -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self {
            rng: StdRng::from_seed(seed),
            recv: Buffer::new(),
        }
    }

    fn frame_units(&mut self, plain: &[u8]) -> Result<Buffer, Error> {
        let mut out = Buffer::new();
        for segment in plain.chunks(UNIT_PAYLOAD_MAX) {
            let pad_len = self.rng.random_range(0..=PAD_MAX);
            let unit_len = UNIT_OVERHEAD + pad_len + segment.len();
            let mut unit = Vec::new();
            unit.try_reserve(unit_len)?;
            unit.extend_from_slice(&(unit_len as u16).to_be_bytes());
            unit.push(pad_len as u8);
            let start = unit.len();
            unit.resize(start + pad_len, 0);
            self.rng.fill_bytes(&mut unit[start..]);
            unit.extend_from_slice(segment);
            let sum = checksum(&unit);
            unit.extend_from_slice(&sum);
            out.append(&unit)?;
        }
        Ok(out)
    }

    fn open_units(
        &mut self,
        data: &[u8],
        global: &Mutex<ProtocolGlobal>,
    ) -> Result<Buffer, Error> {
        self.recv.append(data)?;
        let mut out = Buffer::new();
        loop {
            let pending = self.recv.as_slice();
            if pending.len() < 2 {
                break;
            }
            let unit_len = u16::from_be_bytes([pending[0], pending[1]]) as usize;
            if unit_len < UNIT_OVERHEAD {
                global.lock().unwrap().checksum_failures += 1;
                return Err(CipherError::ClientPostDecrypt.into());
            }
            if pending.len() < unit_len {
                break;
            }
            let unit = &pending[..unit_len];
            let (checked, sum) = unit.split_at(unit_len - CHECKSUM_LEN);
            let pad_len = unit[2] as usize;
            if checksum(checked) != sum || UNIT_OVERHEAD + pad_len > unit_len {
                global.lock().unwrap().checksum_failures += 1;
                return Err(CipherError::ClientPostDecrypt.into());
            }
            out.append(&checked[3 + pad_len..])?;
            global.lock().unwrap().units_verified += 1;
            self.recv.truncate_front(unit_len);
        }
        Ok(out)
    }
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut sum = [0u8; CHECKSUM_LEN];
    sum.copy_from_slice(&blake3::hash(data).as_bytes()[..CHECKSUM_LEN]);
    sum
}

#[cfg(test)]
mod test {
    use super::*;

    fn verify_simple_pair() -> (ProtocolPlugin, ProtocolPlugin) {
        (
            ProtocolPlugin::new(ProtocolKind::VerifySimple, ""),
            ProtocolPlugin::new(ProtocolKind::VerifySimple, ""),
        )
    }

    #[test]
    fn test_name_lookup() {
        assert_eq!(
            ProtocolKind::from_name("origin").unwrap(),
            ProtocolKind::Origin
        );
        assert_eq!(
            ProtocolKind::from_name("verify_simple").unwrap(),
            ProtocolKind::VerifySimple
        );
        assert!(ProtocolKind::from_name("auth_sha1_v4").is_err());
    }

    #[test]
    fn test_origin_is_identity() {
        let global = Mutex::new(ProtocolGlobal::default());
        let mut p = ProtocolPlugin::new(ProtocolKind::Origin, "");
        let wire = p.client_pre_encrypt(b"payload").unwrap();
        assert_eq!(wire.as_slice(), b"payload");
        let plain = p.client_post_decrypt(wire.as_slice(), &global).unwrap();
        assert_eq!(plain.as_slice(), b"payload");
    }

    #[test]
    fn test_verify_simple_roundtrip() {
        let global = Mutex::new(ProtocolGlobal::default());
        let (mut tx, mut rx) = verify_simple_pair();
        for len in [0usize, 1, 100, UNIT_PAYLOAD_MAX, UNIT_PAYLOAD_MAX * 2 + 5] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let wire = tx.client_pre_encrypt(&plain).unwrap();
            let out = rx.client_post_decrypt(wire.as_slice(), &global).unwrap();
            assert_eq!(out.as_slice(), &plain[..]);
        }
        assert!(global.lock().unwrap().units_verified >= 5);
        assert_eq!(global.lock().unwrap().checksum_failures, 0);
    }

    #[test]
    fn test_verify_simple_partial_units() {
        let global = Mutex::new(ProtocolGlobal::default());
        let (mut tx, mut rx) = verify_simple_pair();
        let plain = vec![0x7fu8; 5000];
        let wire = tx.client_pre_encrypt(&plain).unwrap();
        let mut out = Vec::new();
        for piece in wire.as_slice().chunks(11) {
            let got = rx.client_post_decrypt(piece, &global).unwrap();
            out.extend_from_slice(got.as_slice());
        }
        assert_eq!(out, plain);
    }

    #[test]
    fn test_verify_simple_detects_corruption() {
        let global = Mutex::new(ProtocolGlobal::default());
        let (mut tx, mut rx) = verify_simple_pair();
        let mut wire = tx.client_pre_encrypt(b"important data").unwrap().into_vec();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert_eq!(
            rx.client_post_decrypt(&wire, &global),
            Err(CipherError::ClientPostDecrypt.into())
        );
        assert_eq!(global.lock().unwrap().checksum_failures, 1);
    }

    #[test]
    fn test_udp_roundtrip_and_corruption() {
        let mut p = ProtocolPlugin::new(ProtocolKind::VerifySimple, "");
        let wire = p.client_udp_pre_encrypt(b"datagram").unwrap();
        let plain = p.client_udp_post_decrypt(wire.as_slice()).unwrap();
        assert_eq!(plain.as_slice(), b"datagram");

        let mut bad = wire.into_vec();
        bad[0] ^= 0xff;
        assert_eq!(
            p.client_udp_post_decrypt(&bad),
            Err(CipherError::ClientPostDecrypt.into())
        );
    }
}
