//! Ed25519-signed credentials.
//!
//! A credential is a JSON document `{"claims":{..},"issuer":"<b64>","signature":"<b64>"}`
//! where the signature covers the canonical (key-sorted) form of `claims`.
//! Verification requires a trusted issuer key and a claims identity equal to
//! the sender's device identity.

use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::credential::{
    CredentialBuffer, CredentialInfo, CredentialProvider, CRED_TYPE_SIGNED,
};
use crate::error::{SecLevelError, SecLevelResult};
use crate::identity::DeviceIdentity;
use crate::message::CredentialRequest;
use crate::security::canonicalize_json;

/// Attributes asserted by the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialClaims {
    /// Device identity the credential is bound to.
    pub udid: String,
    pub version: String,
    pub sign_time: DateTime<Utc>,
    pub manufacture: String,
    pub model: String,
    pub brand: String,
    pub security_level: String,
    pub cred_level: u32,
}

#[derive(Serialize, Deserialize)]
struct SignedDocument {
    claims: serde_json::Value,
    issuer: String,
    signature: String,
}

fn b64() -> base64::engine::general_purpose::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Sign `claims` with the issuer key, producing credential bytes.
pub fn issue_credential(issuer: &SigningKey, claims: &CredentialClaims) -> SecLevelResult<Vec<u8>> {
    let value = serde_json::to_value(claims)?;
    let canonical = canonicalize_json(&value);
    let signature: Signature = issuer.sign(canonical.as_bytes());

    let document = SignedDocument {
        claims: value,
        issuer: b64().encode(issuer.verifying_key().to_bytes()),
        signature: b64().encode(signature.to_bytes()),
    };
    Ok(serde_json::to_vec(&document)?)
}

/// Check the signature on credential bytes and return the claims.
pub fn verify_credential(bytes: &[u8], trusted: &[VerifyingKey]) -> SecLevelResult<CredentialClaims> {
    let document: SignedDocument = serde_json::from_slice(bytes)
        .map_err(|e| SecLevelError::Credential(format!("unreadable credential: {}", e)))?;

    let issuer_bytes = b64()
        .decode(&document.issuer)
        .map_err(|e| SecLevelError::Credential(format!("invalid issuer encoding: {}", e)))?;
    let issuer = trusted
        .iter()
        .find(|key| key.as_bytes().as_slice() == issuer_bytes.as_slice())
        .ok_or_else(|| SecLevelError::Credential("untrusted issuer".to_string()))?;

    let signature_bytes = b64()
        .decode(&document.signature)
        .map_err(|e| SecLevelError::Credential(format!("invalid signature encoding: {}", e)))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| SecLevelError::Credential(format!("invalid signature format: {}", e)))?;

    let canonical = canonicalize_json(&document.claims);
    issuer
        .verify(canonical.as_bytes(), &signature)
        .map_err(|_| SecLevelError::Credential("signature verification failed".to_string()))?;

    serde_json::from_value(document.claims)
        .map_err(|e| SecLevelError::Credential(format!("invalid claims: {}", e)))
}

/// Provider answering with a pre-issued signed credential and verifying
/// peers against a set of trusted issuers.
pub struct SignedCredentialProvider {
    own_credential: Vec<u8>,
    trusted: Vec<VerifyingKey>,
    types: [u32; 1],
}

impl SignedCredentialProvider {
    /// Create a provider from our own credential bytes and trusted issuers.
    pub fn new(own_credential: Vec<u8>, trusted: Vec<VerifyingKey>) -> Self {
        Self {
            own_credential,
            trusted,
            types: [CRED_TYPE_SIGNED],
        }
    }

    /// Issue a credential for `claims` and trust the same issuer.
    pub fn self_issued(issuer: &SigningKey, claims: &CredentialClaims) -> SecLevelResult<Self> {
        let credential = issue_credential(issuer, claims)?;
        Ok(Self::new(credential, vec![issuer.verifying_key()]))
    }
}

impl CredentialProvider for SignedCredentialProvider {
    fn init(&self) -> SecLevelResult<()> {
        let claims = verify_credential(&self.own_credential, &self.trusted)?;
        tracing::info!(
            udid = %claims.udid,
            level = claims.cred_level,
            "signed credential provider ready"
        );
        Ok(())
    }

    fn supported_types(&self) -> &[u32] {
        &self.types
    }

    fn request(&self, request: &CredentialRequest) -> SecLevelResult<CredentialBuffer> {
        if !request.accepts(CRED_TYPE_SIGNED) {
            return Err(SecLevelError::Credential(format!(
                "requester supports {:?}, none produced here",
                request.support
            )));
        }
        Ok(CredentialBuffer::new(CRED_TYPE_SIGNED, self.own_credential.clone()))
    }

    fn verify(
        &self,
        identity: &DeviceIdentity,
        credential: &CredentialBuffer,
    ) -> SecLevelResult<CredentialInfo> {
        if credential.cred_type() != CRED_TYPE_SIGNED {
            return Err(SecLevelError::Credential(format!(
                "unsupported credential type {}",
                credential.cred_type()
            )));
        }
        let claims = verify_credential(credential.as_bytes(), &self.trusted)?;
        if claims.udid.as_bytes() != identity.as_bytes() {
            return Err(SecLevelError::Credential(format!(
                "credential bound to {}, received from {}",
                claims.udid, identity
            )));
        }
        if claims.cred_level == 0 {
            return Err(SecLevelError::Credential("credential asserts no level".to_string()));
        }
        Ok(CredentialInfo {
            version: claims.version,
            sign_time: Some(claims.sign_time),
            manufacture: claims.manufacture,
            model: claims.model,
            brand: claims.brand,
            security_level: claims.security_level,
            cred_type: credential.cred_type(),
            cred_level: claims.cred_level,
        })
    }
}
