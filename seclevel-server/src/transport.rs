//! Transport collaborator interface.

use thiserror::Error;

use seclevel_core::DeviceIdentity;

/// Why a message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendFailure {
    /// No session to the peer could be opened; terminal for the negotiation.
    #[error("failed to open session")]
    SessionOpen,
    /// Transport is not ready.
    #[error("transport not ready")]
    NotReady,
    /// Any other delivery failure; the request is resent.
    #[error("delivery failed")]
    Delivery,
}

/// Reliable delivery of opaque byte buffers to device identities.
///
/// `send` is fire-and-forget: an `Ok` means the message was accepted for
/// delivery. Failures discovered later are reported through
/// [`SecurityLevelService::on_send_result`](crate::SecurityLevelService::on_send_result).
pub trait Transport: Send + Sync {
    /// Whether the transport can carry messages.
    fn is_ready(&self) -> bool;

    /// Identity of the local device.
    fn self_identity(&self) -> Option<DeviceIdentity>;

    /// Whether `identity` is currently reachable.
    fn is_peer_online(&self, identity: &DeviceIdentity) -> bool;

    /// Queue `bytes` for delivery to `identity`.
    fn send(
        &self,
        transaction_id: u32,
        identity: &DeviceIdentity,
        bytes: &[u8],
    ) -> Result<(), SendFailure>;
}

/// Source of wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by `chrono::Utc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Format a millisecond timestamp for diagnostics; zero prints as `-`.
pub fn format_ms(ms: u64) -> String {
    if ms == 0 {
        return "-".to_string();
    }
    i64::try_from(ms)
        .ok()
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}
