use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub mod config;

pub type Attributes = HashMap<String, String>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// D-Bus error names the Secret Service API defines for its own failures.
pub mod error_names {
    pub const IS_LOCKED: &str = "org.freedesktop.Secret.Error.IsLocked";
    pub const NO_SESSION: &str = "org.freedesktop.Secret.Error.NoSession";
    pub const NO_SUCH_OBJECT: &str = "org.freedesktop.Secret.Error.NoSuchObject";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
}

/// Errors surfaced by the Secret Service client.
///
/// None of these are retried internally: a half-finished session negotiation
/// or prompt may have left the daemon in an unknown state, so the caller
/// decides what to re-query.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure or a remote error with no more specific mapping.
    #[error("bus error: {message}")]
    Bus {
        name: Option<String>,
        message: String,
    },
    /// Encode/decode attempted while the session is not open.
    #[error("session is not open")]
    SessionState,
    /// Generic on purpose: padding, length and key problems are reported alike.
    #[error("secret could not be decrypted")]
    DecryptionFailure,
    #[error("object is locked")]
    Locked,
    /// The prompt did not complete in time. Whatever the prompt was doing on the
    /// daemon side is unknown; re-query the affected objects.
    #[error("prompt timed out")]
    PromptTimeout,
    #[error("crypto failure: {0}")]
    CryptoFailure(String),
    #[error("session algorithm not supported by the service: {0}")]
    AlgorithmUnsupported(String),
    #[error("a prompt is already pending for {0}")]
    PromptBusy(String),
    #[error("no such object: {0}")]
    NoSuchObject(String),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("unexpected reply: {0}")]
    InvalidReply(String),
}

impl Error {
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            name: None,
            message: message.into(),
        }
    }

    /// Map a remote D-Bus error reply onto the client error kinds.
    pub fn from_remote(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            error_names::IS_LOCKED => Self::Locked,
            error_names::NO_SESSION => Self::SessionState,
            error_names::NO_SUCH_OBJECT => Self::NoSuchObject(message),
            _ => Self::Bus {
                name: Some(name.to_string()),
                message,
            },
        }
    }

    /// The remote error name, if this error came from a D-Bus error reply.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Self::Bus { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

/// Session encryption algorithms defined by the Secret Service API.
///
/// `Plain` sends secrets unencrypted over the bus socket.
/// `DhIetf1024Sha256Aes128CbcPkcs7` negotiates an AES-128-CBC key via
/// Diffie-Hellman over the 1024-bit IETF group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAlgorithm {
    #[serde(rename = "plain")]
    Plain,
    #[default]
    #[serde(rename = "dh-ietf1024-sha256-aes128-cbc-pkcs7")]
    DhIetf1024Sha256Aes128CbcPkcs7,
}

impl SessionAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::DhIetf1024Sha256Aes128CbcPkcs7 => "dh-ietf1024-sha256-aes128-cbc-pkcs7",
        }
    }

    pub const fn is_encrypted(self) -> bool {
        matches!(self, Self::DhIetf1024Sha256Aes128CbcPkcs7)
    }
}

impl fmt::Display for SessionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext secret bytes, scrubbed on drop.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Create from an already-zeroizing buffer (avoids a plain copy).
    pub fn from_zeroizing(bytes: Zeroizing<Vec<u8>>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes([redacted])")
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

impl PartialEq<[u8]> for SecretBytes {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl From<&[u8]> for SecretBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}
