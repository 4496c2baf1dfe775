//! The cipher environment: everything tunnels share.
//!
//! One [`CipherEnv`] is created per loaded configuration and wrapped in an
//! [`Arc`]. It resolves the configured cipher/protocol/obfs names once (so a
//! bad name fails at startup, not mid-connection), derives the master key,
//! and owns the cross-connection plugin state plus a registry of live tunnel
//! ids. Tunnels hold a strong reference back to it; the environment never
//! references tunnels other than by id.

use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, trace};

use crate::{
    config::ServerConfig,
    crypto::{CipherKind, MasterKey, is_complete_chunk},
    error::Error,
    obfs::{ObfsGlobal, ObfsKind, is_complete_record},
    protocol::{ProtocolGlobal, ProtocolKind},
    websocket::parse_frame,
};

/// Shared state for every tunnel built from one configuration.
#[derive(Debug)]
pub struct CipherEnv {
    config: Arc<ServerConfig>,
    cipher_kind: CipherKind,
    protocol_kind: ProtocolKind,
    obfs_kind: ObfsKind,
    master_key: MasterKey,
    protocol_global: Mutex<ProtocolGlobal>,
    obfs_global: Mutex<ObfsGlobal>,
    tunnels: Mutex<BTreeSet<u64>>,
    next_tunnel_id: AtomicU64,
}

impl CipherEnv {
    /// Builds an environment from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Fails with a [`ConfigError`] variant when the configured method,
    /// protocol or obfs name is not supported.
    ///
    /// [`ConfigError`]: crate::error::ConfigError
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let cipher_kind = CipherKind::from_name(&config.method)?;
        let protocol_kind = ProtocolKind::from_name(&config.protocol)?;
        let obfs_kind = ObfsKind::from_name(&config.obfs)?;
        let master_key = MasterKey::derive_from_password(&config.password);
        debug!(
            "cipher environment ready: method={} protocol={} obfs={} over_tls={}",
            config.method, config.protocol, config.obfs, config.over_tls_enable
        );
        Ok(Self {
            config,
            cipher_kind,
            protocol_kind,
            obfs_kind,
            master_key,
            protocol_global: Mutex::new(ProtocolGlobal::default()),
            obfs_global: Mutex::new(ObfsGlobal::default()),
            tunnels: Mutex::new(BTreeSet::new()),
            next_tunnel_id: AtomicU64::new(1),
        })
    }

    /// The configuration this environment was built from.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Number of tunnels currently registered.
    pub fn live_tunnels(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }

    /// Snapshot of the cross-connection protocol counters:
    /// `(units_verified, checksum_failures)`.
    pub fn protocol_unit_counters(&self) -> (u64, u64) {
        let global = self.protocol_global.lock().unwrap();
        (global.units_verified, global.checksum_failures)
    }

    pub(crate) fn cipher_kind(&self) -> CipherKind {
        self.cipher_kind
    }

    pub(crate) fn protocol_kind(&self) -> ProtocolKind {
        self.protocol_kind
    }

    pub(crate) fn obfs_kind(&self) -> ObfsKind {
        self.obfs_kind
    }

    pub(crate) fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    pub(crate) fn protocol_global(&self) -> &Mutex<ProtocolGlobal> {
        &self.protocol_global
    }

    pub(crate) fn obfs_global(&self) -> &Mutex<ObfsGlobal> {
        &self.obfs_global
    }

    /// Allocates a fresh tunnel id and records it as live.
    pub(crate) fn register_tunnel(&self) -> u64 {
        let id = self.next_tunnel_id.fetch_add(1, Ordering::Relaxed);
        self.tunnels.lock().unwrap().insert(id);
        trace!("tunnel {} registered", id);
        id
    }

    pub(crate) fn deregister_tunnel(&self, id: u64) {
        self.tunnels.lock().unwrap().remove(&id);
        trace!("tunnel {} deregistered", id);
    }

    /// Reports whether `data` holds at least one complete incoming unit for
    /// the active outermost layer, so a caller reading from a socket knows
    /// whether to feed the pipeline now or wait for more bytes.
    ///
    /// A malformed head counts as complete: the decode path must see it and
    /// fail properly instead of the reader stalling forever.
    pub fn is_completed_package(&self, data: &[u8]) -> bool {
        if self.config.over_tls_enable {
            return !matches!(parse_frame(data), Ok(None));
        }
        match self.obfs_kind {
            ObfsKind::HttpSimple
                if data.starts_with(b"GET ")
                    || data.starts_with(b"POST ")
                    || data.starts_with(b"HTTP/") =>
            {
                data.windows(4).any(|w| w == b"\r\n\r\n")
            }
            ObfsKind::SessionTicket => is_complete_record(data),
            _ => is_complete_chunk(data),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::websocket::build_frame;

    fn env_with(f: impl FnOnce(&mut ServerConfig)) -> CipherEnv {
        let mut config = ServerConfig {
            password: "p".to_string(),
            ..ServerConfig::default()
        };
        f(&mut config);
        CipherEnv::new(Arc::new(config)).unwrap()
    }

    #[test]
    fn test_unknown_names_fail_at_creation() {
        let config = ServerConfig {
            method: "rc4-md5".to_string(),
            ..ServerConfig::default()
        };
        assert!(CipherEnv::new(Arc::new(config)).is_err());

        let config = ServerConfig {
            protocol: "auth_chain_a".to_string(),
            ..ServerConfig::default()
        };
        assert!(CipherEnv::new(Arc::new(config)).is_err());

        let config = ServerConfig {
            obfs: "tls1.2_ticket_auth".to_string(),
            ..ServerConfig::default()
        };
        assert!(CipherEnv::new(Arc::new(config)).is_err());
    }

    #[test]
    fn test_tunnel_registry() {
        let env = env_with(|_| {});
        assert_eq!(env.live_tunnels(), 0);
        let a = env.register_tunnel();
        let b = env.register_tunnel();
        assert_ne!(a, b);
        assert_eq!(env.live_tunnels(), 2);
        env.deregister_tunnel(a);
        env.deregister_tunnel(b);
        assert_eq!(env.live_tunnels(), 0);
    }

    #[test]
    fn test_completed_package_plain_chunks() {
        let env = env_with(|_| {});
        // 2-byte header announcing a 3-byte body.
        assert!(!env.is_completed_package(&[0, 3, 1, 2]));
        assert!(env.is_completed_package(&[0, 3, 1, 2, 3]));
    }

    #[test]
    fn test_completed_package_over_tls() {
        let env = env_with(|c| c.over_tls_enable = true);
        let frame = build_frame(true, b"body").unwrap();
        assert!(!env.is_completed_package(&frame[..frame.len() - 1]));
        assert!(env.is_completed_package(&frame));
    }

    #[test]
    fn test_completed_package_http_simple() {
        let env = env_with(|c| c.obfs = "http_simple".to_string());
        assert!(!env.is_completed_package(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(env.is_completed_package(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        // Post-handshake traffic falls back to chunk completeness.
        assert!(env.is_completed_package(&[0, 1, 9]));
    }

    #[test]
    fn test_completed_package_session_ticket() {
        let env = env_with(|c| c.obfs = "session_ticket".to_string());
        assert!(!env.is_completed_package(&[0x17, 3, 3, 0, 2, 9]));
        assert!(env.is_completed_package(&[0x17, 3, 3, 0, 2, 9, 9]));
    }
}
