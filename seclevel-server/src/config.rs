//! Service and node configuration.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use seclevel_core::message::MAX_MESSAGE_LEN;
use seclevel_core::security::DEFAULT_NONCE_WINDOW_MS;
use seclevel_core::{DeviceIdentity, SecLevelError, SecLevelResult, Version};

/// Negotiation limits and timings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Delay before an unanswered credential request is resent.
    #[serde(with = "millis")]
    pub retry_interval: Duration,
    /// Automatic resends allowed before giving up.
    pub max_query_attempts: u32,
    /// Validity window of an outstanding challenge.
    #[serde(with = "millis")]
    pub nonce_window: Duration,
    /// A verified credential younger than this is not re-queried on re-online.
    #[serde(with = "millis")]
    pub fresh_window: Duration,
    /// Maximum tracked devices.
    pub max_devices: usize,
    /// Maximum callers waiting on one device.
    pub max_pending_callers: usize,
    /// Completed calls kept per device for diagnostics.
    pub history_capacity: usize,
    /// Max wire message size in bytes, terminator included.
    pub max_message_len: usize,
    /// Advertised protocol version, packed.
    pub protocol_version: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(40),
            max_query_attempts: 5,
            nonce_window: Duration::from_millis(DEFAULT_NONCE_WINDOW_MS),
            fresh_window: Duration::from_secs(24 * 60 * 60),
            max_devices: 128,
            max_pending_callers: 64,
            history_capacity: 30,
            max_message_len: MAX_MESSAGE_LEN,
            protocol_version: Version::DEFAULT.packed(),
        }
    }
}

impl ServiceConfig {
    /// Load from a JSON document; missing fields take defaults.
    pub fn from_json(text: &str) -> SecLevelResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Set the retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the automatic resend cap.
    pub fn with_max_query_attempts(mut self, attempts: u32) -> Self {
        self.max_query_attempts = attempts;
        self
    }

    /// Set the pending-caller admission cap.
    pub fn with_max_pending_callers(mut self, max: usize) -> Self {
        self.max_pending_callers = max;
        self
    }

    /// Set the tracked-device cap.
    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices = max;
        self
    }

    /// Protocol version as a struct.
    pub fn version(&self) -> Version {
        Version::from_packed(self.protocol_version)
    }

    pub(crate) fn nonce_window_ms(&self) -> u64 {
        self.nonce_window.as_millis() as u64
    }

    pub(crate) fn fresh_window_ms(&self) -> u64 {
        self.fresh_window.as_millis() as u64
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration of the `seclevel-node` binary.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// Identity of this node; derived from a fresh device key when unset.
    pub identity: Option<DeviceIdentity>,
    /// Passphrase from which the shared credential issuer key is derived.
    pub issuer_passphrase: String,
    /// Security level this node's credential asserts.
    pub cred_level: u32,
    /// Known peers.
    pub peers: HashMap<DeviceIdentity, SocketAddr>,
    /// Interval between diagnostic dumps.
    pub dump_interval: Duration,
    /// Negotiation settings.
    pub service: ServiceConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9400)),
            identity: None,
            issuer_passphrase: "seclevel-demo-issuer".to_string(),
            cred_level: 2,
            peers: HashMap::new(),
            dump_interval: Duration::from_secs(30),
            service: ServiceConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a config with a custom bind address.
    pub fn with_addr(addr: impl Into<SocketAddr>) -> Self {
        Self {
            bind_addr: addr.into(),
            ..Default::default()
        }
    }

    /// Add a peer.
    pub fn with_peer(mut self, identity: DeviceIdentity, addr: SocketAddr) -> Self {
        self.peers.insert(identity, addr);
        self
    }

    /// Parse `[bind_addr] [--id ID] [--level N] [--issuer PASS] [--config PATH] [--peer ID=ADDR]...`.
    pub fn from_args<I>(args: I) -> SecLevelResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--level" => {
                    config.cred_level = next_value(&mut args, "--level")?
                        .parse()
                        .map_err(|e| invalid(format!("--level: {}", e)))?;
                }
                "--id" => config.identity = Some(next_value(&mut args, "--id")?.parse()?),
                "--issuer" => config.issuer_passphrase = next_value(&mut args, "--issuer")?,
                "--peer" => {
                    let entry = next_value(&mut args, "--peer")?;
                    let (id, addr) = entry
                        .split_once('=')
                        .ok_or_else(|| invalid(format!("--peer expects ID=ADDR, got {}", entry)))?;
                    let addr: SocketAddr = addr
                        .parse()
                        .map_err(|e| invalid(format!("--peer address {}: {}", addr, e)))?;
                    config.peers.insert(id.parse()?, addr);
                }
                "--config" => {
                    let path = next_value(&mut args, "--config")?;
                    let text = std::fs::read_to_string(&path)
                        .map_err(|e| invalid(format!("reading {}: {}", path, e)))?;
                    config.service = ServiceConfig::from_json(&text)?;
                }
                other => {
                    config.bind_addr = other
                        .parse()
                        .map_err(|e| invalid(format!("bind address {}: {}", other, e)))?;
                }
            }
        }
        Ok(config)
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> SecLevelResult<String> {
    args.next()
        .ok_or_else(|| invalid(format!("{} requires a value", flag)))
}

fn invalid(message: String) -> SecLevelError {
    SecLevelError::InvalidParameters(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.retry_interval, Duration::from_secs(40));
        assert_eq!(config.max_query_attempts, 5);
        assert_eq!(config.nonce_window_ms(), 60_000);
        assert_eq!(config.max_devices, 128);
        assert_eq!(config.max_pending_callers, 64);
        assert_eq!(config.history_capacity, 30);
        assert_eq!(config.version(), Version::new(3, 0, 0));
    }

    #[test]
    fn json_overrides_defaults() {
        let config =
            ServiceConfig::from_json(r#"{"retry_interval":500,"max_pending_callers":4}"#).unwrap();
        assert_eq!(config.retry_interval, Duration::from_millis(500));
        assert_eq!(config.max_pending_callers, 4);
        assert_eq!(config.max_devices, 128);
    }

    #[test]
    fn node_args() {
        let args = [
            "0.0.0.0:9500",
            "--id",
            "peer-a",
            "--level",
            "4",
            "--peer",
            "peer-b=127.0.0.1:9501",
        ]
        .map(String::from);
        let config = NodeConfig::from_args(args).unwrap();

        assert_eq!(config.bind_addr.port(), 9500);
        assert_eq!(config.cred_level, 4);
        assert_eq!(config.identity, Some("peer-a".parse().unwrap()));
        let peer: DeviceIdentity = "peer-b".parse().unwrap();
        assert_eq!(config.peers[&peer].port(), 9501);
    }

    #[test]
    fn node_args_reject_bad_peer() {
        let args = ["--peer", "nope"].map(String::from);
        assert!(NodeConfig::from_args(args).is_err());
    }
}
