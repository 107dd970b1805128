//! Wire messages for credential negotiation.
//!
//! Every message is compact JSON followed by a single NUL byte, printable
//! ASCII only:
//!
//! - request: `{"message":1,"payload":{"version":<u32>,"challenge":"<hex>","support":[..]}}`
//! - response: `{"message":2,"payload":{"version":<u32>,"type":<u32>,"challenge":"<hex>","info":"<base64>"}}`

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::credential::{CredentialBuffer, CRED_TYPE_PLAIN, CRED_TYPE_SIGNED};
use crate::error::{SecLevelError, SecLevelResult};
use crate::security::Challenge;

/// Message discriminator for a credential request.
pub const MSG_CREDENTIAL_REQUEST: u32 = 1;

/// Message discriminator for a credential response.
pub const MSG_CREDENTIAL_RESPONSE: u32 = 2;

/// Default upper bound on a wire message, terminator included.
pub const MAX_MESSAGE_LEN: usize = 40 * 1024;

/// Upper bound on the advertised credential types kept from a request.
pub const MAX_SUPPORT_TYPES: usize = 32;

/// Credential types advertised when no provider narrows the list.
pub const DEFAULT_SUPPORT_TYPES: [u32; 2] = [CRED_TYPE_SIGNED, CRED_TYPE_PLAIN];

/// Protocol version, packed on the wire as `(major << 16) | (minor << 8) | patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    /// Version 3.0.0.
    pub const DEFAULT: Version = Version::new(3, 0, 0);

    /// Create a version.
    pub const fn new(major: u16, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packed wire form.
    pub const fn packed(&self) -> u32 {
        ((self.major as u32) << 16) | ((self.minor as u32) << 8) | self.patch as u32
    }

    /// Unpack the wire form.
    pub const fn from_packed(value: u32) -> Self {
        Self {
            major: (value >> 16) as u16,
            minor: (value >> 8) as u8,
            patch: value as u8,
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parsed credential request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub version: Version,
    pub challenge: Challenge,
    /// Credential types the requester can verify, in preference order.
    pub support: Vec<u32>,
}

impl CredentialRequest {
    /// Request with the default version.
    pub fn new(challenge: Challenge, support: Vec<u32>) -> Self {
        Self {
            version: Version::DEFAULT,
            challenge,
            support,
        }
    }

    /// Whether the requester accepts `cred_type`. An empty list accepts anything.
    pub fn accepts(&self, cred_type: u32) -> bool {
        self.support.is_empty() || self.support.contains(&cred_type)
    }
}

/// Parsed credential response. Owns the credential buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct CredentialResponse {
    pub version: Version,
    pub challenge: Challenge,
    pub credential: CredentialBuffer,
}

/// Inbound peer message.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Request(CredentialRequest),
    Response(CredentialResponse),
}

#[derive(Serialize)]
struct Envelope<T> {
    message: u32,
    payload: T,
}

#[derive(Deserialize)]
struct RawEnvelope {
    message: u32,
    payload: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct RequestPayload {
    version: u32,
    challenge: String,
    support: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct ResponsePayload {
    version: u32,
    #[serde(rename = "type")]
    cred_type: u32,
    challenge: String,
    info: String,
}

/// JSON text of a credential request envelope.
pub fn encode_request(request: &CredentialRequest) -> SecLevelResult<String> {
    let envelope = Envelope {
        message: MSG_CREDENTIAL_REQUEST,
        payload: RequestPayload {
            version: request.version.packed(),
            challenge: request.challenge.to_hex(),
            support: request.support.clone(),
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// JSON text of a credential response envelope.
pub fn encode_response(response: &CredentialResponse) -> SecLevelResult<String> {
    let envelope = Envelope {
        message: MSG_CREDENTIAL_RESPONSE,
        payload: ResponsePayload {
            version: response.version.packed(),
            cred_type: response.credential.cred_type(),
            challenge: response.challenge.to_hex(),
            info: base64::engine::general_purpose::STANDARD.encode(response.credential.as_bytes()),
        },
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Append the NUL terminator.
fn to_wire(text: String) -> Vec<u8> {
    let mut bytes = text.into_bytes();
    bytes.push(0);
    bytes
}

/// Wire bytes of a credential request.
pub fn build_request(request: &CredentialRequest) -> SecLevelResult<Vec<u8>> {
    encode_request(request).map(to_wire)
}

/// Wire bytes of a credential response.
pub fn build_response(response: &CredentialResponse) -> SecLevelResult<Vec<u8>> {
    encode_response(response).map(to_wire)
}

/// Check buffer shape: NUL-terminated printable ASCII within `max_len`.
///
/// Returns the text without the terminator.
pub fn validate_buffer(bytes: &[u8], max_len: usize) -> SecLevelResult<&str> {
    if bytes.len() < 2 {
        return Err(SecLevelError::Malformed("message too short".to_string()));
    }
    if bytes.len() > max_len {
        return Err(SecLevelError::Malformed(format!(
            "message too large: {} > {}",
            bytes.len(),
            max_len
        )));
    }
    let (body, terminator) = bytes.split_at(bytes.len() - 1);
    if terminator != [0] {
        return Err(SecLevelError::Malformed("missing NUL terminator".to_string()));
    }
    if let Some(pos) = body.iter().position(|b| !(0x20..=0x7e).contains(b)) {
        return Err(SecLevelError::Malformed(format!(
            "non-printable byte {:#04x} at offset {}",
            body[pos], pos
        )));
    }
    std::str::from_utf8(body).map_err(|e| SecLevelError::Malformed(e.to_string()))
}

/// Parse a request payload object.
pub fn parse_request(payload: &str) -> SecLevelResult<CredentialRequest> {
    let raw: RequestPayload = serde_json::from_str(payload)?;
    request_from_payload(raw)
}

/// Parse a response payload object.
pub fn parse_response(payload: &str) -> SecLevelResult<CredentialResponse> {
    let raw: ResponsePayload = serde_json::from_str(payload)?;
    response_from_payload(raw)
}

fn request_from_payload(raw: RequestPayload) -> SecLevelResult<CredentialRequest> {
    let mut support = raw.support;
    if support.len() > MAX_SUPPORT_TYPES {
        tracing::warn!(
            "request advertises {} credential types, keeping {}",
            support.len(),
            MAX_SUPPORT_TYPES
        );
        support.truncate(MAX_SUPPORT_TYPES);
    }
    Ok(CredentialRequest {
        version: Version::from_packed(raw.version),
        challenge: Challenge::from_hex(&raw.challenge)?,
        support,
    })
}

fn response_from_payload(raw: ResponsePayload) -> SecLevelResult<CredentialResponse> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&raw.info)
        .map_err(|e| SecLevelError::Malformed(format!("invalid base64 credential: {}", e)))?;
    if bytes.is_empty() {
        return Err(SecLevelError::Malformed("empty credential".to_string()));
    }
    Ok(CredentialResponse {
        version: Version::from_packed(raw.version),
        challenge: Challenge::from_hex(&raw.challenge)?,
        credential: CredentialBuffer::new(raw.cred_type, bytes),
    })
}

/// Validate and parse an inbound wire buffer.
pub fn parse_message(bytes: &[u8], max_len: usize) -> SecLevelResult<PeerMessage> {
    let text = validate_buffer(bytes, max_len)?;
    let envelope: RawEnvelope = serde_json::from_str(text)?;
    match envelope.message {
        MSG_CREDENTIAL_REQUEST => {
            let raw: RequestPayload = serde_json::from_value(envelope.payload)?;
            request_from_payload(raw).map(PeerMessage::Request)
        }
        MSG_CREDENTIAL_RESPONSE => {
            let raw: ResponsePayload = serde_json::from_value(envelope.payload)?;
            response_from_payload(raw).map(PeerMessage::Response)
        }
        other => Err(SecLevelError::Malformed(format!(
            "unknown message type {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_literal() {
        let request = CredentialRequest::new(
            Challenge(0x0807060504030201),
            DEFAULT_SUPPORT_TYPES.to_vec(),
        );
        assert_eq!(
            encode_request(&request).unwrap(),
            r#"{"message":1,"payload":{"version":196608,"challenge":"0102030405060708","support":[3000,2000]}}"#
        );
        let wire = build_request(&request).unwrap();
        assert_eq!(wire.last(), Some(&0));
    }

    #[test]
    fn request_payload_literal() {
        let parsed = parse_request(
            r#"{"version":3351057,"challenge":"010203040a0b0c0d","support":[33,44,55]}"#,
        )
        .unwrap();
        assert_eq!(parsed.version.packed(), 0x332211);
        assert_eq!(parsed.version, Version::new(0x33, 0x22, 0x11));
        assert_eq!(parsed.challenge, Challenge(0x0d0c0b0a04030201));
        assert_eq!(parsed.support, vec![33, 44, 55]);
    }

    #[test]
    fn request_round_trip() {
        let request = CredentialRequest::new(Challenge(0xdead_beef_0102_0304), vec![3000]);
        let wire = build_request(&request).unwrap();
        match parse_message(&wire, MAX_MESSAGE_LEN).unwrap() {
            PeerMessage::Request(parsed) => {
                assert_eq!(parsed.challenge, request.challenge);
                assert_eq!(parsed.version, request.version);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn response_round_trip() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let response = CredentialResponse {
            version: Version::DEFAULT,
            challenge: Challenge(99),
            credential: CredentialBuffer::new(CRED_TYPE_SIGNED, payload.clone()),
        };
        let wire = build_response(&response).unwrap();
        match parse_message(&wire, MAX_MESSAGE_LEN).unwrap() {
            PeerMessage::Response(parsed) => {
                assert_eq!(parsed.challenge, Challenge(99));
                assert_eq!(parsed.credential.cred_type(), CRED_TYPE_SIGNED);
                assert_eq!(parsed.credential.as_bytes(), payload.as_slice());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn buffer_shape_is_enforced() {
        assert!(validate_buffer(b"{}", MAX_MESSAGE_LEN).is_err());
        assert!(validate_buffer(b"{\n}\0", MAX_MESSAGE_LEN).is_err());
        assert!(validate_buffer(b"{}\0", 2).is_err());
        assert_eq!(validate_buffer(b"{}\0", MAX_MESSAGE_LEN).unwrap(), "{}");
    }

    #[test]
    fn unknown_type_and_missing_fields_rejected() {
        let err = parse_message(b"{\"message\":9,\"payload\":{}}\0", MAX_MESSAGE_LEN).unwrap_err();
        assert!(matches!(err, SecLevelError::Malformed(_)));

        let err = parse_message(
            b"{\"message\":1,\"payload\":{\"version\":1}}\0",
            MAX_MESSAGE_LEN,
        )
        .unwrap_err();
        assert!(matches!(err, SecLevelError::Serialization(_)));
    }

    #[test]
    fn support_list_is_bounded() {
        let support: Vec<String> = (0..40).map(|i| i.to_string()).collect();
        let payload = format!(
            r#"{{"version":1,"challenge":"0102030405060708","support":[{}]}}"#,
            support.join(",")
        );
        assert_eq!(parse_request(&payload).unwrap().support.len(), MAX_SUPPORT_TYPES);
    }

    #[test]
    fn version_packing() {
        assert_eq!(Version::DEFAULT.packed(), 0x030000);
        assert_eq!(Version::from_packed(0x030102).to_string(), "3.1.2");
    }
}
