//! Credential types and the provider registry.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SecLevelError, SecLevelResult};
use crate::identity::DeviceIdentity;
use crate::message::CredentialRequest;

/// Ed25519-signed JSON claims.
pub const CRED_TYPE_SIGNED: u32 = 3000;

/// Claims without an issuer signature, accepted only by permissive providers.
pub const CRED_TYPE_PLAIN: u32 = 2000;

/// Opaque credential bytes tagged with their type.
///
/// Single owner at all times; released on drop.
#[derive(Debug, PartialEq, Eq)]
pub struct CredentialBuffer {
    cred_type: u32,
    bytes: Vec<u8>,
}

impl CredentialBuffer {
    /// Wrap credential bytes.
    pub fn new(cred_type: u32, bytes: Vec<u8>) -> Self {
        Self { cred_type, bytes }
    }

    /// Credential type tag.
    pub fn cred_type(&self) -> u32 {
        self.cred_type
    }

    /// Credential bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Take ownership of the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Validated attributes of a peer credential.
///
/// `cred_level == 0` means no level has been established.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_time: Option<DateTime<Utc>>,
    pub manufacture: String,
    pub model: String,
    pub brand: String,
    pub security_level: String,
    pub cred_type: u32,
    pub cred_level: u32,
}

impl CredentialInfo {
    /// Whether a level has been established.
    pub fn is_established(&self) -> bool {
        self.cred_level > 0
    }
}

/// Pluggable credential construction and verification.
pub trait CredentialProvider: Send + Sync {
    /// One-time initialization at registration.
    fn init(&self) -> SecLevelResult<()> {
        Ok(())
    }

    /// Credential types this provider can produce and verify.
    fn supported_types(&self) -> &[u32];

    /// Produce our own credential in answer to a peer's request.
    fn request(&self, request: &CredentialRequest) -> SecLevelResult<CredentialBuffer>;

    /// Verify a credential received from `identity`.
    fn verify(
        &self,
        identity: &DeviceIdentity,
        credential: &CredentialBuffer,
    ) -> SecLevelResult<CredentialInfo>;
}

/// Slot holding the registered provider.
///
/// Registration is expected once at startup; later registrations replace the
/// earlier one. With nothing registered every call fails with a credential
/// error.
#[derive(Default)]
pub struct ProviderRegistry {
    provider: RwLock<Option<Arc<dyn CredentialProvider>>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with `provider` already registered.
    pub fn with_provider(provider: Arc<dyn CredentialProvider>) -> Self {
        let registry = Self::new();
        registry.register(provider);
        registry
    }

    /// Register `provider`, replacing any earlier one.
    pub fn register(&self, provider: Arc<dyn CredentialProvider>) {
        let mut slot = self.provider.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            tracing::warn!("replacing registered credential provider");
        }
        *slot = Some(provider);
    }

    /// Whether a provider is registered.
    pub fn is_registered(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<dyn CredentialProvider>> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require(&self) -> SecLevelResult<Arc<dyn CredentialProvider>> {
        self.current()
            .ok_or_else(|| SecLevelError::Credential("no credential provider registered".to_string()))
    }

    /// Forward to the registered provider's `init`.
    pub fn default_init(&self) -> SecLevelResult<()> {
        self.require()?.init()
    }

    /// Forward to the registered provider's `request`.
    pub fn default_request(&self, request: &CredentialRequest) -> SecLevelResult<CredentialBuffer> {
        self.require()?.request(request)
    }

    /// Forward to the registered provider's `verify`.
    pub fn default_verify(
        &self,
        identity: &DeviceIdentity,
        credential: &CredentialBuffer,
    ) -> SecLevelResult<CredentialInfo> {
        self.require()?.verify(identity, credential)
    }

    /// Copy up to `max_count` supported types.
    pub fn supported_types(&self, max_count: usize) -> Vec<u32> {
        match self.current() {
            Some(provider) => provider
                .supported_types()
                .iter()
                .take(max_count)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Version;
    use crate::security::Challenge;

    struct Fixed {
        level: u32,
        types: Vec<u32>,
    }

    impl CredentialProvider for Fixed {
        fn supported_types(&self) -> &[u32] {
            &self.types
        }

        fn request(&self, _request: &CredentialRequest) -> SecLevelResult<CredentialBuffer> {
            Ok(CredentialBuffer::new(CRED_TYPE_PLAIN, vec![self.level as u8]))
        }

        fn verify(
            &self,
            _identity: &DeviceIdentity,
            credential: &CredentialBuffer,
        ) -> SecLevelResult<CredentialInfo> {
            Ok(CredentialInfo {
                cred_type: credential.cred_type(),
                cred_level: u32::from(credential.as_bytes()[0]),
                ..Default::default()
            })
        }
    }

    fn sample_request() -> CredentialRequest {
        CredentialRequest {
            version: Version::DEFAULT,
            challenge: Challenge(1),
            support: vec![CRED_TYPE_PLAIN],
        }
    }

    #[test]
    fn empty_registry_fails_with_credential_error() {
        let registry = ProviderRegistry::new();
        assert!(!registry.is_registered());
        assert!(registry.default_init().is_err());
        assert!(registry.default_request(&sample_request()).is_err());
        assert!(registry.supported_types(8).is_empty());
    }

    #[test]
    fn last_registration_wins() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(Fixed { level: 1, types: vec![1] }));
        registry.register(Arc::new(Fixed { level: 4, types: vec![2] }));

        let buf = registry.default_request(&sample_request()).unwrap();
        let id = DeviceIdentity::new(b"peer").unwrap();
        let info = registry.default_verify(&id, &buf).unwrap();
        assert_eq!(info.cred_level, 4);
        assert_eq!(registry.supported_types(8), vec![2]);
    }

    #[test]
    fn supported_types_respects_max_count() {
        let registry = ProviderRegistry::with_provider(Arc::new(Fixed {
            level: 1,
            types: vec![3000, 2000, 1000],
        }));
        assert_eq!(registry.supported_types(2), vec![3000, 2000]);
        assert!(registry.supported_types(0).is_empty());
    }

    #[test]
    fn credential_info_level() {
        let mut info = CredentialInfo::default();
        assert!(!info.is_established());
        info.cred_level = 2;
        assert!(info.is_established());
    }
}
