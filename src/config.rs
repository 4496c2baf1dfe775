//! Server configuration: the immutable-after-load record consumed by every
//! [`CipherEnv`] and every tunnel derived from it.
//!
//! Configuration comes from a JSON object with the same key set that
//! ssr-native reads (`local_address`, `local_port`, `server`, `server_port`,
//! `password`, `method`, `protocol`, `protocol_param`, `obfs`, `obfs_param`,
//! `timeout`). Unrecognized keys are ignored. The `timeout` value is given in
//! minutes and stored in milliseconds.
//!
//! Command-line parsing and process bootstrap are the caller's business; the
//! loader functions here are the interface boundary.
//!
//! [`CipherEnv`]: crate::CipherEnv

use std::fs;

use serde::Deserialize;

use crate::error::{ConfigError, Error};

/// The default local listen address.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// The default local listen port.
pub const DEFAULT_BIND_PORT: u16 = 1080;

/// The default connection idle timeout, in milliseconds.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 60 * MILLISECONDS_PER_SECOND;

const MILLISECONDS_PER_SECOND: u32 = 1000;
const MILLISECONDS_PER_MINUTE: u32 = 60 * MILLISECONDS_PER_SECOND;

/// Immutable-after-load tunnel configuration.
///
/// The record is read-shared by every cipher environment and tunnel context
/// derived from it and is never mutated after loading.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerConfig {
    /// Local listen host.
    pub listen_host: String,
    /// Local listen port.
    pub listen_port: u16,
    /// Remote proxy server host.
    pub remote_host: String,
    /// Remote proxy server port.
    pub remote_port: u16,
    /// Password the base cipher key is derived from.
    pub password: String,
    /// Base cipher method name, e.g. `aes-128-gcm`.
    pub method: String,
    /// Protocol plugin name, e.g. `origin` or `verify_simple`.
    pub protocol: String,
    /// Free-form parameter string for the protocol plugin.
    pub protocol_param: String,
    /// Obfs plugin name, e.g. `plain`, `http_simple` or `session_ticket`.
    pub obfs: String,
    /// Free-form parameter string for the obfs plugin.
    pub obfs_param: String,
    /// Whether the wire stream is wrapped in WebSocket frames over TLS.
    pub over_tls_enable: bool,
    /// Server domain presented in the TLS/WebSocket disguise.
    pub over_tls_server_domain: String,
    /// Request path used by the WebSocket disguise.
    pub over_tls_path: String,
    /// Root certificate file for the TLS wrapping, if any.
    pub over_tls_root_cert_file: String,
    /// Whether UDP relaying is enabled.
    pub udp: bool,
    /// Connection idle timeout in milliseconds.
    pub idle_timeout_ms: u32,
    /// Free-text remarks, not interpreted.
    pub remarks: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_BIND_HOST.to_string(),
            listen_port: DEFAULT_BIND_PORT,
            remote_host: String::new(),
            remote_port: 0,
            password: String::new(),
            method: "aes-128-gcm".to_string(),
            protocol: "origin".to_string(),
            protocol_param: String::new(),
            obfs: "plain".to_string(),
            obfs_param: String::new(),
            over_tls_enable: false,
            over_tls_server_domain: String::new(),
            over_tls_path: "/".to_string(),
            over_tls_root_cert_file: String::new(),
            udp: false,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            remarks: String::new(),
        }
    }
}

/// The raw key set recognized in a configuration file.
///
/// serde skips keys this struct does not name, which gives the documented
/// "unrecognized keys are ignored" behavior for free.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    local_address: Option<String>,
    local_port: Option<u16>,
    server: Option<String>,
    server_port: Option<u16>,
    password: Option<String>,
    method: Option<String>,
    protocol: Option<String>,
    protocol_param: Option<String>,
    obfs: Option<String>,
    obfs_param: Option<String>,
    over_tls_enable: Option<bool>,
    over_tls_server_domain: Option<String>,
    over_tls_path: Option<String>,
    over_tls_root_cert_file: Option<String>,
    udp: Option<bool>,
    timeout: Option<u32>,
    remarks: Option<String>,
}

impl ServerConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Unreadable`] if the file cannot be read and
    /// [`ConfigError::Malformed`] if it does not parse as the expected JSON
    /// object.
    pub fn from_json_file(path: &str) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|_| ConfigError::Unreadable {
            path: path.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Parses a configuration from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|e| ConfigError::Malformed {
            detail: e.to_string(),
        })?;

        let mut config = Self::default();
        if let Some(v) = raw.local_address {
            config.listen_host = v;
        }
        if let Some(v) = raw.local_port {
            config.listen_port = v;
        }
        if let Some(v) = raw.server {
            config.remote_host = v;
        }
        if let Some(v) = raw.server_port {
            config.remote_port = v;
        }
        if let Some(v) = raw.password {
            config.password = v;
        }
        if let Some(v) = raw.method {
            config.method = v;
        }
        if let Some(v) = raw.protocol {
            config.protocol = v;
        }
        if let Some(v) = raw.protocol_param {
            config.protocol_param = v;
        }
        if let Some(v) = raw.obfs {
            config.obfs = v;
        }
        if let Some(v) = raw.obfs_param {
            config.obfs_param = v;
        }
        if let Some(v) = raw.over_tls_enable {
            config.over_tls_enable = v;
        }
        if let Some(v) = raw.over_tls_server_domain {
            config.over_tls_server_domain = v;
        }
        if let Some(v) = raw.over_tls_path {
            config.over_tls_path = v;
        }
        if let Some(v) = raw.over_tls_root_cert_file {
            config.over_tls_root_cert_file = v;
        }
        if let Some(v) = raw.udp {
            config.udp = v;
        }
        if let Some(v) = raw.timeout {
            // The file value is in minutes.
            config.idle_timeout_ms = v.saturating_mul(MILLISECONDS_PER_MINUTE);
        }
        if let Some(v) = raw.remarks {
            config.remarks = v;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.method, "aes-128-gcm");
        assert_eq!(config.protocol, "origin");
        assert_eq!(config.obfs, "plain");
    }

    #[test]
    fn test_parse_full_object() {
        let config = ServerConfig::from_json_str(
            r#"{
                "local_address": "0.0.0.0",
                "local_port": 1081,
                "server": "example.net",
                "server_port": 8388,
                "password": "barfoo!",
                "method": "chacha20-poly1305",
                "protocol": "verify_simple",
                "protocol_param": "",
                "obfs": "http_simple",
                "obfs_param": "cdn.example.net",
                "timeout": 5
            }"#,
        )
        .unwrap();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_port, 1081);
        assert_eq!(config.remote_host, "example.net");
        assert_eq!(config.remote_port, 8388);
        assert_eq!(config.password, "barfoo!");
        assert_eq!(config.method, "chacha20-poly1305");
        assert_eq!(config.protocol, "verify_simple");
        assert_eq!(config.obfs, "http_simple");
        assert_eq!(config.obfs_param, "cdn.example.net");
        assert_eq!(config.idle_timeout_ms, 5 * 60 * 1000);
    }

    #[test]
    fn test_over_tls_keys() {
        let config = ServerConfig::from_json_str(
            r#"{
                "over_tls_enable": true,
                "over_tls_server_domain": "gateway.example.com",
                "over_tls_path": "/ws",
                "udp": true
            }"#,
        )
        .unwrap();
        assert!(config.over_tls_enable);
        assert_eq!(config.over_tls_server_domain, "gateway.example.com");
        assert_eq!(config.over_tls_path, "/ws");
        assert!(config.udp);
    }

    #[test]
    fn test_unrecognized_keys_ignored() {
        let config = ServerConfig::from_json_str(
            r#"{"password": "p", "fast_open": true, "workers": 4}"#,
        )
        .unwrap();
        assert_eq!(config.password, "p");
        assert_eq!(config.listen_port, DEFAULT_BIND_PORT);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let err = ServerConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let err = ServerConfig::from_json_file("/nonexistent/config.json").unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::Unreadable { .. })
        ));
    }
}
