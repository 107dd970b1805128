//! Negotiation state machine definitions.
//!
//! Each known device runs one negotiation automaton. The table in [`route`]
//! is shared read-only by every device; anything not listed there is dropped
//! without a state change.

use serde::{Deserialize, Serialize};

use crate::fsm::Transition;

/// Per-device negotiation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationState {
    /// Nothing in flight.
    Init,
    /// Credential request sent, awaiting the peer's response.
    WaitingCredentialResponse,
    /// Credential verified.
    Success,
    /// Negotiation failed; waiting for recovery.
    Failed,
}

impl NegotiationState {
    /// All states.
    pub const ALL: [NegotiationState; 4] = [
        Self::Init,
        Self::WaitingCredentialResponse,
        Self::Success,
        Self::Failed,
    ];

    /// Check if the negotiation has concluded.
    pub fn is_concluded(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

/// Discriminant of a negotiation event, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DeviceOnline,
    CredentialResponseReceived,
    MessageSendFailed,
    DeviceOffline,
    RequestTimedOut,
    /// A local caller asked for the level.
    LocalRequest,
    /// A specific caller's personal deadline passed.
    LocalRequestTimedOut,
    ForceRecheck,
    /// Internal fast path for a credential that is still fresh.
    AlreadyFreshSync,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [EventKind; 9] = [
        Self::DeviceOnline,
        Self::CredentialResponseReceived,
        Self::MessageSendFailed,
        Self::DeviceOffline,
        Self::RequestTimedOut,
        Self::LocalRequest,
        Self::LocalRequestTimedOut,
        Self::ForceRecheck,
        Self::AlreadyFreshSync,
    ];
}

/// Handler run by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Mark online; fast-path a fresh credential or send a request.
    Online,
    /// Verify a credential response and flush waiting callers.
    VerifyResponse,
    /// Finalize on session-open failure, otherwise resend.
    SendFailed,
    /// Resend, capped at the attempt limit.
    RetryOnTimeout,
    /// Mark offline, stop retries, flush callers.
    Offline,
    /// Caller is already queued; nothing concluded yet.
    QueueCaller,
    /// Resolve queued callers with the concluded result.
    ResolveCallers,
    /// Flush callers whose personal deadline elapsed.
    ExpireCallers,
    /// Resend regardless of the attempt cap.
    ForceRecheck,
}

/// Look up the transition for `(state, event)`.
pub fn route(
    state: NegotiationState,
    event: EventKind,
) -> Option<Transition<NegotiationState, Action>> {
    use EventKind as E;
    use NegotiationState::{Failed, Init, Success, WaitingCredentialResponse as Waiting};

    let row = match (state, event) {
        (Init, E::DeviceOnline) => Transition::new(Action::Online, Waiting, Failed),
        (Init, E::LocalRequest) => Transition::new(Action::QueueCaller, Init, Init),

        (Waiting, E::DeviceOnline) => Transition::new(Action::Online, Waiting, Failed),
        (Waiting, E::CredentialResponseReceived) => {
            Transition::new(Action::VerifyResponse, Success, Failed)
        }
        (Waiting, E::MessageSendFailed) => Transition::new(Action::SendFailed, Waiting, Failed),
        (Waiting, E::RequestTimedOut) => Transition::new(Action::RetryOnTimeout, Waiting, Failed),
        (Waiting, E::DeviceOffline) => Transition::new(Action::Offline, Init, Init),
        (Waiting, E::AlreadyFreshSync) => Transition::always(Success),
        (Waiting, E::LocalRequest) => Transition::new(Action::QueueCaller, Waiting, Waiting),
        (Waiting, E::LocalRequestTimedOut) => {
            Transition::new(Action::ExpireCallers, Waiting, Waiting)
        }

        (Success, E::DeviceOffline) => Transition::new(Action::Offline, Init, Init),
        (Success, E::LocalRequest) => Transition::new(Action::ResolveCallers, Success, Success),

        (Failed, E::DeviceOnline) => Transition::new(Action::Online, Waiting, Failed),
        (Failed, E::CredentialResponseReceived) => {
            Transition::new(Action::VerifyResponse, Success, Failed)
        }
        (Failed, E::DeviceOffline) => Transition::new(Action::Offline, Init, Init),
        (Failed, E::ForceRecheck) => Transition::new(Action::ForceRecheck, Waiting, Waiting),
        (Failed, E::LocalRequest) => Transition::new(Action::ResolveCallers, Failed, Failed),
        (Failed, E::LocalRequestTimedOut) => Transition::new(Action::ExpireCallers, Failed, Failed),

        _ => return None,
    };
    Some(row)
}
