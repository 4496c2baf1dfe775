//! RFC6455 WebSocket framing and handshake values.
//!
//! The frame codec carries the already-enciphered tunnel stream when the
//! over-TLS disguise is active. Only binary data frames are produced
//! (`FIN = 1`, opcode 2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Payload lengths are deliberately capped at 32 bits: the 64-bit length
//! form is written with its top four bytes zeroed, and a received frame
//! with any of those bytes non-zero is rejected as malformed. Peers of this
//! protocol family rely on the same cap; do not "fix" it.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::{
    error::{CipherError, Error},
    random::fill_random_bytes,
};

/// The fixed GUID that RFC6455 appends to `Sec-WebSocket-Key` before
/// hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MASK_LEN: usize = 4;
const FIN_BINARY: u8 = 0x82;

/// A parsed WebSocket frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// FIN bit of the first header byte. Read, not enforced.
    pub fin: bool,
    /// The 4-bit opcode.
    pub opcode: u8,
    /// The unmasked payload bytes.
    pub payload: Vec<u8>,
    /// Total bytes the frame occupied on the wire, header included.
    pub consumed: usize,
}

/// Builds a binary WebSocket frame around `payload`.
///
/// When `masked`, a fresh 4-byte CSPRNG mask is placed after the length
/// field and every payload byte is XORed with `mask[i % 4]`. Clients must
/// mask; servers must not.
///
/// Returns `None` for an empty payload.
pub fn build_frame(masked: bool, payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() || payload.len() > u32::MAX as usize {
        return None;
    }

    let mut ext = [0u8; 8];
    let (len_byte, ext_len) = if payload.len() <= 125 {
        (payload.len() as u8, 0)
    } else if payload.len() <= 0xFFFF {
        ext[..2].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        (126, 2)
    } else {
        // 64-bit form, high half always zero.
        ext.copy_from_slice(&(payload.len() as u64).to_be_bytes());
        (127, 8)
    };
    let ext = &ext[..ext_len];

    let header_len = 2 + ext.len() + if masked { MASK_LEN } else { 0 };
    let mut frame = Vec::with_capacity(header_len + payload.len());
    frame.push(FIN_BINARY);
    frame.push(if masked { len_byte | 0x80 } else { len_byte & 0x7F });
    frame.extend_from_slice(ext);

    if masked {
        let mut mask = [0u8; MASK_LEN];
        fill_random_bytes("RANDOM_GEN", &mut mask);
        frame.extend_from_slice(&mask);
        frame.extend(
            payload
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i % MASK_LEN]),
        );
    } else {
        frame.extend_from_slice(payload);
    }
    Some(frame)
}

/// Parses one WebSocket frame from the head of `data`.
///
/// Returns `Ok(None)` when `data` does not yet hold the whole frame; the
/// caller must keep the buffer and retry once more bytes arrive. A 64-bit
/// length whose top four bytes are non-zero is a protocol violation and
/// fails with [`CipherError::ClientDecode`].
pub fn parse_frame(data: &[u8]) -> Result<Option<Frame>, Error> {
    if data.len() < 2 {
        return Ok(None);
    }

    let fin = data[0] & 0x80 == 0x80;
    let opcode = data[0] & 0x0F;
    let masked = data[1] & 0x80 == 0x80;
    let mask_len = if masked { MASK_LEN } else { 0 };

    let (payload_len, header_len) = match data[1] & 0x7F {
        126 => {
            if data.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([data[2], data[3]]) as usize;
            (len, 4 + mask_len)
        }
        127 => {
            if data.len() < 10 {
                return Ok(None);
            }
            // Lengths are capped at 32 bits.
            if data[2..6] != [0, 0, 0, 0] {
                return Err(CipherError::ClientDecode.into());
            }
            let len = u32::from_be_bytes([data[6], data[7], data[8], data[9]]) as usize;
            (len, 10 + mask_len)
        }
        small => (small as usize, 2 + mask_len),
    };

    if data.len() < header_len + payload_len {
        return Ok(None);
    }

    let body = &data[header_len..header_len + payload_len];
    let payload = if masked {
        let mut key = [0u8; MASK_LEN];
        key.copy_from_slice(&data[header_len - MASK_LEN..header_len]);
        body.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % MASK_LEN])
            .collect()
    } else {
        body.to_vec()
    };

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
        consumed: header_len + payload_len,
    }))
}

/// Generates a fresh `Sec-WebSocket-Key`: base64 of 20 random bytes.
pub fn generate_sec_websocket_key() -> String {
    let mut data = [0u8; 20];
    fill_random_bytes("sec-websocket-key seed", &mut data);
    BASE64.encode(data)
}

/// Computes the `Sec-WebSocket-Accept` value for `key` per RFC6455:
/// base64 of SHA-1 over the key concatenated with the fixed GUID.
///
/// Returns `None` for an empty key.
pub fn compute_sec_websocket_accept(key: &str) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    Some(BASE64.encode(sha1.finalize()))
}
