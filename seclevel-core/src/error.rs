//! Error types and result codes for security-level negotiation.

use thiserror::Error;

/// Failure codes reported to local callers.
///
/// A negotiation outcome is fanned out to every waiting caller, so the code is
/// `Copy` while [`SecLevelError`] carries the context for a single call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Caller supplied a malformed identity, zero timeout or similar.
    InvalidParameters,
    /// Transport (or self identity) is not available yet.
    NotReady,
    /// No negotiation exists for the device.
    UnknownDevice,
    /// Device is known but currently offline.
    DeviceOffline,
    /// Admission cap reached (pending callers or tracked devices).
    Overloaded,
    /// Bad buffer shape, JSON error or missing field.
    MalformedMessage,
    /// Nonce mismatch, expired or zero.
    ChallengeError,
    /// Credential provider rejected the credential or is absent.
    CredentialError,
    /// Caller deadline or query attempts exhausted.
    Timeout,
    /// Opaque provider or transport failure.
    Failure,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameters => write!(f, "invalid_parameters"),
            Self::NotReady => write!(f, "not_ready"),
            Self::UnknownDevice => write!(f, "unknown_device"),
            Self::DeviceOffline => write!(f, "device_offline"),
            Self::Overloaded => write!(f, "overloaded"),
            Self::MalformedMessage => write!(f, "malformed_message"),
            Self::ChallengeError => write!(f, "challenge_error"),
            Self::CredentialError => write!(f, "credential_error"),
            Self::Timeout => write!(f, "timeout"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Security-level negotiation errors.
#[derive(Debug, Error)]
pub enum SecLevelError {
    /// Invalid arguments from a local caller.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Transport is not ready to carry messages.
    #[error("transport not ready")]
    NotReady,

    /// Device has never been seen.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// Device is not online.
    #[error("device not online: {0}")]
    DeviceOffline(String),

    /// Too many outstanding requests against one device.
    #[error("too many outstanding requests (limit {limit})")]
    Overloaded { limit: usize },

    /// Registry refused to track another device.
    #[error("device registry full (limit {limit})")]
    RegistryFull { limit: usize },

    /// Inbound buffer or message failed validation.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Challenge did not match the outstanding nonce.
    #[error("challenge error: {0}")]
    Challenge(String),

    /// Credential provider rejected the credential.
    #[error("credential error: {0}")]
    Credential(String),

    /// Deadline elapsed.
    #[error("timed out")]
    Timeout,

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Asynchronous negotiation outcome.
    #[error("negotiation failed: {0}")]
    Negotiation(ErrorCode),
}

impl SecLevelError {
    /// Map the error onto the caller-visible taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameters(_) => ErrorCode::InvalidParameters,
            Self::NotReady => ErrorCode::NotReady,
            Self::UnknownDevice(_) => ErrorCode::UnknownDevice,
            Self::DeviceOffline(_) => ErrorCode::DeviceOffline,
            Self::Overloaded { .. } | Self::RegistryFull { .. } => ErrorCode::Overloaded,
            Self::Malformed(_) | Self::Serialization(_) => ErrorCode::MalformedMessage,
            Self::Challenge(_) => ErrorCode::ChallengeError,
            Self::Credential(_) => ErrorCode::CredentialError,
            Self::Timeout => ErrorCode::Timeout,
            Self::Transport(_) => ErrorCode::Failure,
            Self::Negotiation(code) => *code,
        }
    }

    /// Rebuild an error from a fanned-out code.
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::NotReady => Self::NotReady,
            other => Self::Negotiation(other),
        }
    }
}

/// Result type alias for negotiation operations.
pub type SecLevelResult<T> = Result<T, SecLevelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::ChallengeError.to_string(), "challenge_error");
        assert_eq!(ErrorCode::DeviceOffline.to_string(), "device_offline");
        assert_eq!(ErrorCode::Overloaded.to_string(), "overloaded");
    }

    #[test]
    fn error_code_serde() {
        let json = serde_json::to_string(&ErrorCode::CredentialError).unwrap();
        assert_eq!(json, "\"credential_error\"");

        let parsed: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ErrorCode::CredentialError);
    }

    #[test]
    fn errors_map_to_codes() {
        assert_eq!(SecLevelError::Overloaded { limit: 64 }.code(), ErrorCode::Overloaded);
        assert_eq!(SecLevelError::RegistryFull { limit: 128 }.code(), ErrorCode::Overloaded);
        assert_eq!(
            SecLevelError::Challenge("zero".into()).code(),
            ErrorCode::ChallengeError
        );

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(SecLevelError::from(json_err).code(), ErrorCode::MalformedMessage);
    }

    #[test]
    fn from_code_round_trips_code() {
        for code in [ErrorCode::Timeout, ErrorCode::NotReady, ErrorCode::Failure] {
            assert_eq!(SecLevelError::from_code(code).code(), code);
        }
    }
}
