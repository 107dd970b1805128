//! Challenge handling and JSON canonicalization.
//!
//! Implements:
//! - 64-bit challenges with a fixed little-endian hex wire encoding
//! - Nonce lifecycle (generation, expiry, validation)
//! - Key-sorted JSON canonicalization for signed claims

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{SecLevelError, SecLevelResult};

/// Default nonce validity window in milliseconds.
pub const DEFAULT_NONCE_WINDOW_MS: u64 = 60_000;

/// Length of the hex-encoded challenge on the wire.
pub const CHALLENGE_HEX_LEN: usize = 16;

/// Random value binding a credential response to its request.
///
/// The wire form is the 8 bytes of the value in little-endian order, hex
/// encoded, regardless of host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Challenge(pub u64);

impl Challenge {
    /// Generate a non-zero random challenge from the OS RNG.
    pub fn random() -> Self {
        loop {
            let value = OsRng.next_u64();
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// Whether the challenge is the zero value (never valid).
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// 16 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_le_bytes())
    }

    /// Parse the 16-character wire form.
    pub fn from_hex(s: &str) -> SecLevelResult<Self> {
        if s.len() != CHALLENGE_HEX_LEN {
            return Err(SecLevelError::Malformed(format!(
                "challenge must be {} hex chars, got {}",
                CHALLENGE_HEX_LEN,
                s.len()
            )));
        }
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| SecLevelError::Malformed(format!("invalid challenge hex: {}", e)))?;
        Ok(Self(u64::from_le_bytes(bytes)))
    }
}

impl std::fmt::Display for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Outstanding challenge for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    challenge: Challenge,
    issued_at_ms: u64,
}

impl Nonce {
    /// Nonce issued at `now_ms`.
    pub fn new(challenge: Challenge, issued_at_ms: u64) -> Self {
        Self {
            challenge,
            issued_at_ms,
        }
    }

    /// The challenge value.
    pub fn challenge(&self) -> Challenge {
        self.challenge
    }

    /// Issue timestamp.
    pub fn issued_at_ms(&self) -> u64 {
        self.issued_at_ms
    }

    /// Usable at `now_ms`: non-zero, clock not behind the issue time, and
    /// inside the window.
    pub fn is_live(&self, now_ms: u64, window_ms: u64) -> bool {
        !self.challenge.is_zero()
            && now_ms >= self.issued_at_ms
            && now_ms - self.issued_at_ms <= window_ms
    }
}

/// Return the current nonce, generating a new one only if it is absent,
/// expired, or the clock went backward.
pub fn refresh_nonce(current: &mut Option<Nonce>, now_ms: u64, window_ms: u64) -> Challenge {
    refresh_nonce_with(current, now_ms, window_ms, Challenge::random)
}

/// [`refresh_nonce`] with an explicit challenge source.
pub fn refresh_nonce_with(
    current: &mut Option<Nonce>,
    now_ms: u64,
    window_ms: u64,
    generate: impl FnOnce() -> Challenge,
) -> Challenge {
    match current {
        Some(nonce) if nonce.is_live(now_ms, window_ms) => nonce.challenge(),
        _ => {
            let nonce = Nonce::new(generate(), now_ms);
            *current = Some(nonce);
            nonce.challenge()
        }
    }
}

/// Check an inbound challenge against the outstanding nonce.
///
/// Rejects zero challenges, missing or expired nonces and mismatches.
pub fn check_challenge(
    current: Option<&Nonce>,
    received: Challenge,
    now_ms: u64,
    window_ms: u64,
) -> SecLevelResult<()> {
    if received.is_zero() {
        return Err(SecLevelError::Challenge("zero challenge".to_string()));
    }
    let nonce = current
        .ok_or_else(|| SecLevelError::Challenge("no outstanding challenge".to_string()))?;
    if !nonce.is_live(now_ms, window_ms) {
        return Err(SecLevelError::Challenge(format!(
            "challenge issued at {} expired at {}",
            nonce.issued_at_ms(),
            now_ms
        )));
    }
    if nonce.challenge() != received {
        return Err(SecLevelError::Challenge(format!(
            "challenge mismatch: expected {}, got {}",
            nonce.challenge(),
            received
        )));
    }
    Ok(())
}

/// Deterministic JSON serialization: keys sorted, no whitespace.
///
/// Signed credential claims are signed over this form so that issuer and
/// verifier agree byte-for-byte.
pub fn canonicalize_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => serde_json::Value::String(s.clone()).to_string(),
        serde_json::Value::Array(arr) => {
            let elements: Vec<String> = arr.iter().map(canonicalize_json).collect();
            format!("[{}]", elements.join(","))
        }
        serde_json::Value::Object(obj) => {
            let mut keys: Vec<_> = obj.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*k).clone()),
                        canonicalize_json(&obj[*k])
                    )
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}
