//! TLS pre-shared key derivation.
//!
//! The key is `MD5(PSK_PREFIX || serial)`, recomputed on every connection
//! attempt so a serial changed in the parameter store takes effect on the
//! next reconnect.

use md5::{Digest, Md5};

/// Fixed prefix mixed into every key.
pub const PSK_PREFIX: &[u8] = b"LuxD1ngl2X";
pub const PSK_LEN: usize = 16;

/// The only cipher suite offered during the handshake.
pub const PSK_CIPHERSUITE: &str = "TLS-PSK-WITH-AES-128-CBC-SHA256";

/// 16 byte pre-shared key. `Debug` does not print the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PreSharedKey([u8; PSK_LEN]);

impl PreSharedKey {
    pub fn derive(serial: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(PSK_PREFIX);
        hasher.update(serial.as_bytes());
        let mut key = [0u8; PSK_LEN];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PreSharedKey(**redacted**)")
    }
}

/// Everything a TLS backend needs to run the PSK handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPskParams {
    pub identity: String,
    pub key: PreSharedKey,
    pub ciphersuite: &'static str,
    /// The server presents no certificate; nothing is verified.
    pub verify_peer: bool,
    pub timeout_ms: u32,
}

impl TlsPskParams {
    pub fn new(identity: &str, serial: &str, timeout_ms: u32) -> Self {
        Self {
            identity: identity.to_string(),
            key: PreSharedKey::derive(serial),
            ciphersuite: PSK_CIPHERSUITE,
            verify_peer: false,
            timeout_ms,
        }
    }
}
