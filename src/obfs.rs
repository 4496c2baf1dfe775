//! Obfs plugin: transport-level camouflage applied to the enciphered
//! stream, independent of the protocol plugin.
//!
//! Like the protocol plugin, the variant set is closed and resolved by name
//! once at environment creation. Per-connection handshake state lives in the
//! plugin instance; the cross-connection replay window lives in
//! [`ObfsGlobal`], owned by the environment and shared by every tunnel.
//!
//! Two camouflage schemes are provided besides the identity transform:
//!
//! * `http_simple` — the client's first packet rides behind an HTTP upgrade
//!   request; the server strips it and answers with a `101 Switching
//!   Protocols` response (the *receipt*), which the client strips in turn.
//!
//! * `session_ticket` — traffic is dressed as TLS records. The client opens
//!   with a fake handshake record carrying a salt, a coarse timestamp and a
//!   keyed MAC; the server validates all three (salt uniqueness against the
//!   replay window), answers with a server-hello record (the *receipt*), and
//!   the client answers that with a finished record (the *feedback*).
//!   Payload rides in application-data records throughout.

use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use log::trace;
use rand::{RngCore, SeedableRng, TryRngCore, rngs::{OsRng, StdRng}};

use crate::{
    buffer::Buffer,
    error::{CipherError, ConfigError, Error},
    websocket::{compute_sec_websocket_accept, generate_sec_websocket_key},
};

/// The acceptable time range [-r, +r] for a ticket timestamp, in seconds.
const ACCEPTABLE_TIME_RANGE_IN_SECOND: u64 = 90;

/// Divisor (in seconds) for the Unix epoch.
const GRANULARITY: u64 = 10;

pub(crate) const TIME_TOLERANCE: u64 = ACCEPTABLE_TIME_RANGE_IN_SECOND / GRANULARITY;

const REC_HDR_LEN: usize = 5;
const REC_BODY_MAX: usize = 16384;
const REC_HANDSHAKE: u8 = 0x16;
const REC_FINISHED: u8 = 0x14;
const REC_APPDATA: u8 = 0x17;

const SALT_LEN: usize = 32;
const MAC_LEN: usize = 16;
const HELLO_BODY_LEN: usize = SALT_LEN + 8 + MAC_LEN;
const SERVER_HELLO_BODY_LEN: usize = SALT_LEN + MAC_LEN;

const DEFAULT_CAMOUFLAGE_HOST: &str = "www.bing.com";

/// Returns the current Unix epoch timestamp divided by the granularity.
///
/// The reduced precision avoids exposing exact endpoint clocks on the wire.
pub(crate) fn current_timestamp_with_granularity() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs()
        / GRANULARITY
}

/// A supported obfs plugin scheme.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum ObfsKind {
    /// No transport camouflage.
    Plain,
    /// HTTP upgrade-request camouflage.
    HttpSimple,
    /// Fake TLS-record camouflage with replay-protected tickets.
    SessionTicket,
}

impl ObfsKind {
    pub(crate) fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "plain" => Ok(ObfsKind::Plain),
            "http_simple" => Ok(ObfsKind::HttpSimple),
            "session_ticket" => Ok(ObfsKind::SessionTicket),
            _ => Err(ConfigError::UnknownObfs {
                name: name.to_string(),
            }
            .into()),
        }
    }
}

/// Cross-connection obfs state: the replay window for session tickets.
#[derive(Debug)]
pub(crate) struct ObfsGlobal {
    pub(crate) replay: ReplayWindow,
}

impl Default for ObfsGlobal {
    fn default() -> Self {
        Self {
            replay: ReplayWindow::with_capacity(1024),
        }
    }
}

/// Remembers recently seen ticket salts so a captured first packet cannot
/// be replayed within the timestamp tolerance.
///
/// The caller holds the environment-level lock; no interior mutex here.
#[derive(Debug)]
pub(crate) struct ReplayWindow {
    salts: HashSet<[u8; SALT_LEN]>,
    oldest: VecDeque<(u64, [u8; SALT_LEN])>,
}

impl ReplayWindow {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            salts: HashSet::with_capacity(capacity),
            oldest: VecDeque::with_capacity(capacity),
        }
    }

    /// Inserts a new salt with its timestamp. Fails if the salt was already
    /// seen; expired entries are evicted opportunistically.
    pub(crate) fn check_or_insert(
        &mut self,
        salt: [u8; SALT_LEN],
        timestamp: u64,
        now: u64,
    ) -> Result<(), Error> {
        if self.salts.contains(&salt) {
            return Err(CipherError::ClientDecode.into());
        }
        self.salts.insert(salt);
        self.oldest.push_back((timestamp, salt));

        while let Some(&(oldest_timestamp, salt)) = self.oldest.front() {
            if now.saturating_sub(oldest_timestamp) <= TIME_TOLERANCE + 2 {
                break;
            }
            self.salts.remove(&salt);
            self.oldest.pop_front();
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.salts.len()
    }
}

/// A per-connection obfs plugin instance.
#[derive(Debug)]
pub(crate) enum ObfsPlugin {
    Plain,
    HttpSimple(HttpSimple),
    SessionTicket(SessionTicket),
}

impl ObfsPlugin {
    /// `param` is the obfs parameter string (camouflage host for
    /// `http_simple`); `server_domain` is the configured over-TLS domain,
    /// used as a fallback host. `mac_key` keys the session-ticket MACs and
    /// is derived from the environment's master key.
    pub(crate) fn new(kind: ObfsKind, param: &str, server_domain: &str, mac_key: [u8; 32]) -> Self {
        match kind {
            ObfsKind::Plain => ObfsPlugin::Plain,
            ObfsKind::HttpSimple => {
                let host = if !param.is_empty() {
                    param
                } else if !server_domain.is_empty() {
                    server_domain
                } else {
                    DEFAULT_CAMOUFLAGE_HOST
                };
                ObfsPlugin::HttpSimple(HttpSimple::new(host))
            }
            ObfsKind::SessionTicket => ObfsPlugin::SessionTicket(SessionTicket::new(mac_key)),
        }
    }

    /// Whether the caller must relay a feedback message to the peer before
    /// assuming the handshake is over.
    pub(crate) fn need_feedback(&self) -> bool {
        match self {
            ObfsPlugin::Plain | ObfsPlugin::HttpSimple(_) => false,
            ObfsPlugin::SessionTicket(t) => t.stage == TicketStage::Handshaking,
        }
    }

    pub(crate) fn client_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        match self {
            ObfsPlugin::Plain => Buffer::from_slice(data),
            ObfsPlugin::HttpSimple(h) => h.client_encode(data),
            ObfsPlugin::SessionTicket(t) => t.client_encode(data),
        }
    }

    /// Client-side inverse transform. The second element is the feedback
    /// message, to be sent back to the peer immediately when present.
    pub(crate) fn client_decode(&mut self, data: &[u8]) -> Result<(Buffer, Option<Buffer>), Error> {
        match self {
            ObfsPlugin::Plain => Ok((Buffer::from_slice(data)?, None)),
            ObfsPlugin::HttpSimple(h) => Ok((h.client_decode(data)?, None)),
            ObfsPlugin::SessionTicket(t) => t.client_decode(data),
        }
    }

    pub(crate) fn server_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        match self {
            ObfsPlugin::Plain | ObfsPlugin::HttpSimple(_) => Buffer::from_slice(data),
            ObfsPlugin::SessionTicket(t) => t.server_encode(data),
        }
    }

    /// Server-side inverse transform. The second element is the receipt:
    /// wire-ready handshake bytes to send straight back to the peer.
    pub(crate) fn server_decode(
        &mut self,
        data: &[u8],
        global: &Mutex<ObfsGlobal>,
    ) -> Result<(Buffer, Option<Buffer>), Error> {
        match self {
            ObfsPlugin::Plain => Ok((Buffer::from_slice(data)?, None)),
            ObfsPlugin::HttpSimple(h) => h.server_decode(data),
            ObfsPlugin::SessionTicket(t) => t.server_decode(data, global),
        }
    }

    /// UDP paths carry no camouflage; both directions are the identity.
    pub(crate) fn client_udp_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        Buffer::from_slice(data)
    }

    /// See [`client_udp_encode`].
    ///
    /// [`client_udp_encode`]: ObfsPlugin::client_udp_encode
    pub(crate) fn client_udp_decode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        Buffer::from_slice(data)
    }
}

/// Per-connection state of the `http_simple` scheme.
#[derive(Debug)]
pub(crate) struct HttpSimple {
    host: String,
    path: String,
    request_sent: bool,
    header_stripped: bool,
    sec_key: String,
    recv: Buffer,
}

impl HttpSimple {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            path: "/".to_string(),
            request_sent: false,
            header_stripped: false,
            sec_key: String::new(),
            recv: Buffer::new(),
        }
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        if self.request_sent {
            return Buffer::from_slice(data);
        }
        self.sec_key = generate_sec_websocket_key();
        let request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             User-Agent: curl/8.1.2\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            self.path, self.host, self.sec_key
        );
        self.request_sent = true;
        let mut out = Buffer::from_slice(request.as_bytes())?;
        out.append(data)?;
        Ok(out)
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        if self.header_stripped {
            return Buffer::from_slice(data);
        }
        self.recv.append(data)?;
        let Some(header_end) = find_header_end(self.recv.as_slice()) else {
            return Buffer::from_slice(&[]);
        };
        let header = &self.recv.as_slice()[..header_end];
        if !header.starts_with(b"HTTP/1.1 101") {
            return Err(CipherError::ClientDecode.into());
        }
        let expected = compute_sec_websocket_accept(&self.sec_key);
        let accept = header_value(header, "sec-websocket-accept");
        if accept.is_none() || accept != expected {
            return Err(CipherError::ClientDecode.into());
        }
        let payload = Buffer::from_slice(&self.recv.as_slice()[header_end..])?;
        self.recv = Buffer::new();
        self.header_stripped = true;
        Ok(payload)
    }

    fn server_decode(&mut self, data: &[u8]) -> Result<(Buffer, Option<Buffer>), Error> {
        if self.header_stripped {
            return Ok((Buffer::from_slice(data)?, None));
        }
        self.recv.append(data)?;
        let Some(header_end) = find_header_end(self.recv.as_slice()) else {
            return Ok((Buffer::from_slice(&[])?, None));
        };
        let header = &self.recv.as_slice()[..header_end];
        if !header.starts_with(b"GET ") {
            return Err(CipherError::ClientDecode.into());
        }
        let Some(key) = header_value(header, "sec-websocket-key") else {
            return Err(CipherError::ClientDecode.into());
        };
        let Some(accept) = compute_sec_websocket_accept(&key) else {
            return Err(CipherError::ClientDecode.into());
        };
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Server: nginx/1.25.3\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        let payload = Buffer::from_slice(&self.recv.as_slice()[header_end..])?;
        self.recv = Buffer::new();
        self.header_stripped = true;
        let receipt = Buffer::from_slice(response.as_bytes())?;
        Ok((payload, Some(receipt)))
    }
}

/// Where the session-ticket handshake currently stands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TicketStage {
    Init,
    Handshaking,
    Established,
}

/// Per-connection state of the `session_ticket` scheme.
#[derive(Debug)]
pub(crate) struct SessionTicket {
    mac_key: [u8; 32],
    salt: [u8; SALT_LEN],
    stage: TicketStage,
    rng: StdRng,
    recv: Buffer,
}

impl SessionTicket {
    fn new(mac_key: [u8; 32]) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self {
            mac_key,
            salt: [0u8; SALT_LEN],
            stage: TicketStage::Init,
            rng: StdRng::from_seed(seed),
            recv: Buffer::new(),
        }
    }

    fn mac(&self, parts: &[&[u8]]) -> [u8; MAC_LEN] {
        let mut hasher = blake3::Hasher::new_keyed(&self.mac_key);
        for part in parts {
            hasher.update(part);
        }
        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&hasher.finalize().as_bytes()[..MAC_LEN]);
        mac
    }

    fn client_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        let mut out = Buffer::new();
        if self.stage == TicketStage::Init {
            self.rng.fill_bytes(&mut self.salt);
            let timestamp = current_timestamp_with_granularity();
            let mut body = Vec::with_capacity(HELLO_BODY_LEN);
            body.extend_from_slice(&self.salt);
            body.extend_from_slice(&timestamp.to_be_bytes());
            let mac = self.mac(&[&self.salt, &timestamp.to_be_bytes(), b"client hello"]);
            body.extend_from_slice(&mac);
            push_record(&mut out, REC_HANDSHAKE, &body)?;
            self.stage = TicketStage::Handshaking;
        }
        push_appdata(&mut out, data)?;
        Ok(out)
    }

    fn client_decode(&mut self, data: &[u8]) -> Result<(Buffer, Option<Buffer>), Error> {
        self.recv.append(data)?;
        let mut out = Buffer::new();
        let mut feedback = None;
        while let Some((rec_type, body)) = pop_record(&mut self.recv)? {
            match (self.stage, rec_type) {
                (TicketStage::Handshaking, REC_HANDSHAKE) => {
                    if body.len() != SERVER_HELLO_BODY_LEN {
                        return Err(CipherError::ClientDecode.into());
                    }
                    let (random, mac) = body.split_at(SALT_LEN);
                    if self.mac(&[random, b"server hello"]) != mac {
                        return Err(CipherError::ClientDecode.into());
                    }
                    let finished = self.mac(&[&self.salt, b"finished"]);
                    let mut fb = Buffer::new();
                    push_record(&mut fb, REC_FINISHED, &finished)?;
                    feedback = Some(fb);
                    self.stage = TicketStage::Established;
                }
                (TicketStage::Established, REC_APPDATA) => out.append(&body)?,
                _ => return Err(CipherError::ClientDecode.into()),
            }
        }
        Ok((out, feedback))
    }

    fn server_encode(&mut self, data: &[u8]) -> Result<Buffer, Error> {
        let mut out = Buffer::new();
        push_appdata(&mut out, data)?;
        Ok(out)
    }

    fn server_decode(
        &mut self,
        data: &[u8],
        global: &Mutex<ObfsGlobal>,
    ) -> Result<(Buffer, Option<Buffer>), Error> {
        self.recv.append(data)?;
        let mut out = Buffer::new();
        let mut receipt = None;
        while let Some((rec_type, body)) = pop_record(&mut self.recv)? {
            match (self.stage, rec_type) {
                (TicketStage::Init, REC_HANDSHAKE) => {
                    if body.len() != HELLO_BODY_LEN {
                        return Err(CipherError::ClientDecode.into());
                    }
                    let salt: [u8; SALT_LEN] = body[..SALT_LEN].try_into().unwrap();
                    let ts_bytes = &body[SALT_LEN..SALT_LEN + 8];
                    let mac = &body[SALT_LEN + 8..];
                    if self.mac(&[&salt, ts_bytes, b"client hello"]) != mac {
                        return Err(CipherError::ClientDecode.into());
                    }
                    let timestamp = u64::from_be_bytes(ts_bytes.try_into().unwrap());
                    let now = current_timestamp_with_granularity();
                    if now.abs_diff(timestamp) > TIME_TOLERANCE {
                        return Err(CipherError::ClientDecode.into());
                    }
                    {
                        let mut global = global.lock().unwrap();
                        global.replay.check_or_insert(salt, timestamp, now)?;
                        trace!("replay window holds {} salts", global.replay.len());
                    }
                    self.salt = salt;

                    let mut random = [0u8; SALT_LEN];
                    self.rng.fill_bytes(&mut random);
                    let mut hello = Vec::with_capacity(SERVER_HELLO_BODY_LEN);
                    hello.extend_from_slice(&random);
                    hello.extend_from_slice(&self.mac(&[&random, b"server hello"]));
                    let mut rc = Buffer::new();
                    push_record(&mut rc, REC_HANDSHAKE, &hello)?;
                    receipt = Some(rc);
                    self.stage = TicketStage::Handshaking;
                }
                (TicketStage::Handshaking, REC_FINISHED) => {
                    if self.mac(&[&self.salt, b"finished"]) != body.as_slice() {
                        return Err(CipherError::ClientDecode.into());
                    }
                    self.stage = TicketStage::Established;
                }
                (TicketStage::Handshaking | TicketStage::Established, REC_APPDATA) => {
                    out.append(&body)?
                }
                _ => return Err(CipherError::ClientDecode.into()),
            }
        }
        Ok((out, receipt))
    }
}

/// Reports whether `data` starts with a complete TLS-style record.
pub(crate) fn is_complete_record(data: &[u8]) -> bool {
    if data.len() < REC_HDR_LEN {
        return false;
    }
    let body_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    data.len() >= REC_HDR_LEN + body_len
}

fn push_record(out: &mut Buffer, rec_type: u8, body: &[u8]) -> Result<(), Error> {
    debug_assert!(body.len() <= REC_BODY_MAX);
    out.append(&[rec_type, 0x03, 0x03])?;
    out.append(&(body.len() as u16).to_be_bytes())?;
    out.append(body)
}

fn push_appdata(out: &mut Buffer, data: &[u8]) -> Result<(), Error> {
    for segment in data.chunks(REC_BODY_MAX) {
        push_record(out, REC_APPDATA, segment)?;
    }
    Ok(())
}

/// Pops one complete record off the head of `recv`, if present.
fn pop_record(recv: &mut Buffer) -> Result<Option<(u8, Vec<u8>)>, Error> {
    let data = recv.as_slice();
    if data.len() < REC_HDR_LEN {
        return Ok(None);
    }
    if data[1] != 0x03 || data[2] != 0x03 {
        return Err(CipherError::ClientDecode.into());
    }
    let body_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if body_len > REC_BODY_MAX {
        return Err(CipherError::ClientDecode.into());
    }
    if data.len() < REC_HDR_LEN + body_len {
        return Ok(None);
    }
    let rec_type = data[0];
    let body = data[REC_HDR_LEN..REC_HDR_LEN + body_len].to_vec();
    recv.truncate_front(REC_HDR_LEN + body_len);
    Ok(Some((rec_type, body)))
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Case-insensitive lookup of one header value in a raw HTTP header block.
fn header_value(header: &[u8], name: &str) -> Option<String> {
    let text = core::str::from_utf8(header).ok()?;
    for line in text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().to_string());
        }
    }
    None
}
