//! Device identities.

use sha2::{Digest, Sha256};

use crate::error::{SecLevelError, SecLevelResult};

/// Maximum identity length in bytes.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Alias a local caller may use to address the device it runs on.
pub const SELF_ALIAS: &[u8] = b"self";

/// Opaque fixed-capacity device identifier.
///
/// Equality is byte-for-byte over the used length.
#[derive(Clone, Copy)]
pub struct DeviceIdentity {
    bytes: [u8; MAX_IDENTITY_LEN],
    len: usize,
}

impl DeviceIdentity {
    /// Build an identity from raw bytes (1..=64 bytes).
    pub fn new(bytes: &[u8]) -> SecLevelResult<Self> {
        if bytes.is_empty() || bytes.len() > MAX_IDENTITY_LEN {
            return Err(SecLevelError::InvalidParameters(format!(
                "identity length {} outside 1..={}",
                bytes.len(),
                MAX_IDENTITY_LEN
            )));
        }
        let mut buf = [0u8; MAX_IDENTITY_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len(),
        })
    }

    /// Derive the identity of a device from its public key: hex(SHA-256(key)).
    pub fn from_public_key(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        let encoded = hex::encode(digest);
        let mut buf = [0u8; MAX_IDENTITY_LEN];
        buf.copy_from_slice(encoded.as_bytes());
        Self {
            bytes: buf,
            len: MAX_IDENTITY_LEN,
        }
    }

    /// The `self` shorthand.
    pub fn self_alias() -> Self {
        let mut buf = [0u8; MAX_IDENTITY_LEN];
        buf[..SELF_ALIAS.len()].copy_from_slice(SELF_ALIAS);
        Self {
            bytes: buf,
            len: SELF_ALIAS.len(),
        }
    }

    /// Whether this identity is the `self` shorthand.
    pub fn is_self_alias(&self) -> bool {
        self.as_bytes() == SELF_ALIAS
    }

    /// Identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Identity length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false for a constructed identity.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Shortened printable form for logs.
    pub fn short(&self) -> String {
        let full = self.to_string();
        if full.len() <= 12 {
            full
        } else {
            format!("{}..{}", &full[..6], &full[full.len() - 4..])
        }
    }
}

impl PartialEq for DeviceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for DeviceIdentity {}

impl std::hash::Hash for DeviceIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.as_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            // graphic ASCII is valid UTF-8
            write!(f, "{}", String::from_utf8_lossy(bytes))
        } else {
            write!(f, "0x{}", hex::encode(bytes))
        }
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceIdentity({})", self)
    }
}

impl std::str::FromStr for DeviceIdentity {
    type Err = SecLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.as_bytes())
    }
}

impl serde::Serialize for DeviceIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
