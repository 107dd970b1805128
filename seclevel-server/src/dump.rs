//! Diagnostic snapshots of tracked devices.

use std::fmt::Write;

use serde::Serialize;

use seclevel_core::{DeviceIdentity, ErrorCode, NegotiationState};

use crate::negotiation::DeviceNegotiation;
use crate::notify::{CallRecord, CallerId};
use crate::transport::format_ms;

/// A caller still waiting when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCaller {
    pub caller: CallerId,
    pub start_ms: u64,
    pub deadline_ms: u64,
}

/// Point-in-time view of one device's negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    pub machine_id: u32,
    pub is_self: bool,
    pub state: NegotiationState,
    pub online: bool,
    pub device_type: u32,
    pub last_online_ms: u64,
    pub last_offline_ms: u64,
    pub last_request_ms: u64,
    pub last_response_ms: u64,
    pub last_verified_ms: u64,
    pub query_attempts: u32,
    pub transaction_counter: u32,
    pub cred_level: u32,
    pub cred_type: u32,
    pub security_level: String,
    pub result: Option<Result<(), ErrorCode>>,
    pub pending: Vec<PendingCaller>,
    pub history: Vec<CallRecord>,
}

impl DeviceSnapshot {
    /// Capture the current view of `device`.
    pub fn capture(device: &DeviceNegotiation) -> Self {
        let state = device.state();
        let data = device.data();
        Self {
            identity: *device.identity(),
            machine_id: device.machine_id(),
            is_self: device.is_self(),
            state,
            online: data.online,
            device_type: data.device_type,
            last_online_ms: data.last_online_ms,
            last_offline_ms: data.last_offline_ms,
            last_request_ms: data.last_request_ms,
            last_response_ms: data.last_response_ms,
            last_verified_ms: data.last_verified_ms,
            query_attempts: data.query_attempts,
            transaction_counter: data.transaction_counter,
            cred_level: data.credential.cred_level,
            cred_type: data.credential.cred_type,
            security_level: data.credential.security_level.clone(),
            result: data.result,
            pending: data
                .callers
                .pending()
                .iter()
                .map(|entry| PendingCaller {
                    caller: entry.caller,
                    start_ms: entry.start_ms,
                    deadline_ms: entry.deadline_ms(),
                })
                .collect(),
            history: data.callers.history().cloned().collect(),
        }
    }

    fn result_label(&self) -> String {
        match self.result {
            None => "-".to_string(),
            Some(Ok(())) => "ok".to_string(),
            Some(Err(code)) => code.to_string(),
        }
    }
}

fn outcome(result: &Result<u32, ErrorCode>) -> String {
    match result {
        Ok(level) => format!("level {}", level),
        Err(code) => code.to_string(),
    }
}

/// Human-readable rendering of a dump.
pub fn render_text(snapshots: &[DeviceSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} device(s)", snapshots.len());
    for snap in snapshots {
        let _ = writeln!(
            out,
            "[{}] {}{} state={:?} online={} type={} level={} result={}",
            snap.machine_id,
            snap.identity.short(),
            if snap.is_self { " (self)" } else { "" },
            snap.state,
            snap.online,
            snap.device_type,
            snap.cred_level,
            snap.result_label(),
        );
        let _ = writeln!(
            out,
            "    online={} offline={} request={} response={} verified={}",
            format_ms(snap.last_online_ms),
            format_ms(snap.last_offline_ms),
            format_ms(snap.last_request_ms),
            format_ms(snap.last_response_ms),
            format_ms(snap.last_verified_ms),
        );
        let _ = writeln!(
            out,
            "    attempts={} transactions={} pending={} history={}",
            snap.query_attempts,
            snap.transaction_counter,
            snap.pending.len(),
            snap.history.len(),
        );
        for record in &snap.history {
            let _ = writeln!(
                out,
                "      {} {} -> {} ({})",
                record.caller,
                format_ms(record.start_ms),
                format_ms(record.finish_ms),
                outcome(&record.result),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_fresh_device() {
        let identity = DeviceIdentity::new(b"peer-a").unwrap();
        let device = DeviceNegotiation::new(3, identity, false, 30);
        let snap = DeviceSnapshot::capture(&device);

        assert_eq!(snap.state, NegotiationState::Init);
        assert_eq!(snap.machine_id, 3);
        assert!(snap.pending.is_empty());

        let text = render_text(&[snap]);
        assert!(text.starts_with("1 device(s)"));
        assert!(text.contains("peer-a"));
        assert!(text.contains("result=-"));
        assert!(text.contains("verified=-"));
    }

    #[test]
    fn snapshot_serializes() {
        let identity = DeviceIdentity::new(b"peer-a").unwrap();
        let device = DeviceNegotiation::new(0, identity, true, 30);
        let json = serde_json::to_value(DeviceSnapshot::capture(&device)).unwrap();

        assert_eq!(json["identity"], "peer-a");
        assert_eq!(json["is_self"], true);
        assert_eq!(json["result"], serde_json::Value::Null);
    }
}
