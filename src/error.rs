//! All possible errors of the tunnel cipher pipeline.
//!
//! "Not enough bytes yet" is deliberately absent from this taxonomy: the
//! frame parser and the completeness check express it as a retry signal,
//! never as an error.

use core::{
    error,
    fmt::{Display, Formatter},
};
use std::{collections::TryReserveError, io};

/// Enumeration of all possible errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// The configuration is unusable. Surfaced at startup; the process
    /// should exit non-zero.
    Config(ConfigError),

    /// A per-connection pipeline failure. Fatal to the connection that
    /// produced it, harmless to every other connection and to the process.
    Cipher(CipherError),

    /// An allocation could not be satisfied.
    OutOfMemory,
}

/// Errors detected while resolving the configuration.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configured base cipher method name is not recognized.
    UnknownMethod {
        /// The unrecognized method name.
        name: String,
    },

    /// The configured protocol plugin name is not recognized.
    UnknownProtocol {
        /// The unrecognized protocol name.
        name: String,
    },

    /// The configured obfs plugin name is not recognized.
    UnknownObfs {
        /// The unrecognized obfs name.
        name: String,
    },

    /// The configuration file could not be read.
    Unreadable {
        /// The offending path.
        path: String,
    },

    /// The configuration file is not a valid JSON object.
    Malformed {
        /// The parser's description of the problem.
        detail: String,
    },
}

/// The ssr error taxonomy returned by the per-connection pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CipherError {
    /// Malformed wire bytes at the decode stage, before the base cipher
    /// had a chance to authenticate anything.
    ClientDecode,

    /// Authentication failed during base-cipher decrypt. Either the peer
    /// uses a different password or a different cipher method.
    InvalidPassword,

    /// A plugin-level decode failure after base decryption succeeded.
    ClientPostDecrypt,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Config(err) => write!(f, "Config: {}", err),
            Error::Cipher(err) => write!(f, "Cipher: {}", err),
            Error::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnknownMethod { name } => {
                write!(f, "unknown cipher method {:?}", name)
            }
            ConfigError::UnknownProtocol { name } => {
                write!(f, "unknown protocol {:?}", name)
            }
            ConfigError::UnknownObfs { name } => write!(f, "unknown obfs {:?}", name),
            ConfigError::Unreadable { path } => {
                write!(f, "cannot read config file {:?}", path)
            }
            ConfigError::Malformed { detail } => {
                write!(f, "malformed config file: {}", detail)
            }
        }
    }
}

impl Display for CipherError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            CipherError::ClientDecode => write!(f, "client decode error."),
            CipherError::InvalidPassword => write!(f, "invalid password or cipher."),
            CipherError::ClientPostDecrypt => write!(f, "client post decrypt error."),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Cipher(err) => Some(err),
            Error::OutOfMemory => None,
        }
    }
}

impl error::Error for ConfigError {}

impl error::Error for CipherError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

impl From<CipherError> for Error {
    fn from(e: CipherError) -> Self {
        Error::Cipher(e)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::other(e)
    }
}

impl From<CipherError> for io::Error {
    fn from(e: CipherError) -> Self {
        io::Error::other(Error::Cipher(e))
    }
}
