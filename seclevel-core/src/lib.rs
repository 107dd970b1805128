//! # seclevel-core
//!
//! Core library for negotiating the security level of peer devices.
//!
//! This crate provides the error taxonomy, device identities, the generic
//! event-driven state machine engine, the per-device negotiation transition
//! table, challenge handling, the JSON wire codec, and credential types with
//! the provider registry.

pub mod credential;
pub mod error;
pub mod fsm;
pub mod identity;
pub mod message;
pub mod security;
pub mod signed;
pub mod state;

pub use credential::{
    CredentialBuffer, CredentialInfo, CredentialProvider, ProviderRegistry, CRED_TYPE_PLAIN,
    CRED_TYPE_SIGNED,
};
pub use error::{ErrorCode, SecLevelError, SecLevelResult};
pub use fsm::{StateMachine, Transition, TransitionTable};
pub use identity::DeviceIdentity;
pub use message::{CredentialRequest, CredentialResponse, PeerMessage, Version};
pub use security::{check_challenge, refresh_nonce, Challenge, Nonce};
pub use signed::{CredentialClaims, SignedCredentialProvider};
pub use state::{route, Action, EventKind, NegotiationState};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: Version = Version::DEFAULT;
