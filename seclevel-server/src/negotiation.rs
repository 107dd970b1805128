//! Per-device negotiation.
//!
//! Every tracked device owns a [`StateMachine`] driven by the shared
//! [`NegotiationTable`]. Handlers run one at a time per device; they never
//! hold the device data lock while calling the transport, the credential
//! provider or caller callbacks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seclevel_core::message::{build_request, MAX_SUPPORT_TYPES, DEFAULT_SUPPORT_TYPES};
use seclevel_core::{
    check_challenge, refresh_nonce, route, Action, CredentialInfo, CredentialRequest,
    CredentialResponse, DeviceIdentity, ErrorCode, EventKind, NegotiationState, Nonce,
    StateMachine, Transition, TransitionTable,
};

use crate::notify::{fire_all, CallerId, CallerQueues, LevelResult};
use crate::service::ServiceInner;
use crate::timer::TimerHandle;
use crate::transport::SendFailure;

/// Event delivered to a device's negotiation, with its payload.
#[derive(Debug)]
pub enum NegotiationEvent {
    DeviceOnline { device_type: u32 },
    CredentialResponseReceived(CredentialResponse),
    MessageSendFailed(SendFailure),
    DeviceOffline,
    /// Retry timer expiry, tagged with the generation of the timer that fired.
    RequestTimedOut(u64),
    LocalRequest(CallerId),
    LocalRequestTimedOut(CallerId),
    ForceRecheck,
    AlreadyFreshSync,
}

impl NegotiationEvent {
    /// Payload-free discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceOnline { .. } => EventKind::DeviceOnline,
            Self::CredentialResponseReceived(_) => EventKind::CredentialResponseReceived,
            Self::MessageSendFailed(_) => EventKind::MessageSendFailed,
            Self::DeviceOffline => EventKind::DeviceOffline,
            Self::RequestTimedOut(_) => EventKind::RequestTimedOut,
            Self::LocalRequest(_) => EventKind::LocalRequest,
            Self::LocalRequestTimedOut(_) => EventKind::LocalRequestTimedOut,
            Self::ForceRecheck => EventKind::ForceRecheck,
            Self::AlreadyFreshSync => EventKind::AlreadyFreshSync,
        }
    }
}

/// Mutable negotiation data of one device.
#[derive(Debug)]
pub struct NegotiationData {
    pub online: bool,
    pub device_type: u32,
    pub(crate) nonce: Option<Nonce>,
    pub last_online_ms: u64,
    pub last_offline_ms: u64,
    pub last_request_ms: u64,
    pub last_response_ms: u64,
    pub last_verified_ms: u64,
    pub query_attempts: u32,
    pub transaction_counter: u32,
    pub(crate) retry_timer: Option<TimerHandle>,
    /// Bumped every time a retry timer is armed.
    pub(crate) retry_generation: u64,
    pub credential: CredentialInfo,
    /// Outcome of the latest negotiation round; `None` until one concludes.
    pub result: Option<Result<(), ErrorCode>>,
    pub callers: CallerQueues,
}

impl NegotiationData {
    fn new(history_capacity: usize) -> Self {
        Self {
            online: false,
            device_type: 0,
            nonce: None,
            last_online_ms: 0,
            last_offline_ms: 0,
            last_request_ms: 0,
            last_response_ms: 0,
            last_verified_ms: 0,
            query_attempts: 0,
            transaction_counter: 0,
            retry_timer: None,
            retry_generation: 0,
            credential: CredentialInfo::default(),
            result: None,
            callers: CallerQueues::new(history_capacity),
        }
    }

    /// What a caller resolved now receives; `fallback` if nothing concluded.
    pub fn level_result(&self, fallback: ErrorCode) -> LevelResult {
        match self.result {
            Some(Ok(())) if self.credential.is_established() => Ok(self.credential.cred_level),
            Some(Ok(())) => Err(ErrorCode::CredentialError),
            Some(Err(code)) => Err(code),
            None => Err(fallback),
        }
    }

    /// Verified, with a known level, less than `window_ms` ago.
    pub fn is_fresh(&self, now_ms: u64, window_ms: u64) -> bool {
        matches!(self.result, Some(Ok(())))
            && self.credential.is_established()
            && self.last_verified_ms > 0
            && now_ms >= self.last_verified_ms
            && now_ms - self.last_verified_ms < window_ms
    }

    /// Outstanding challenge, if any.
    pub fn nonce(&self) -> Option<&Nonce> {
        self.nonce.as_ref()
    }
}

/// Negotiation state of one peer (or of this device).
pub struct DeviceNegotiation {
    identity: DeviceIdentity,
    is_self: bool,
    machine: StateMachine<NegotiationState, NegotiationEvent>,
    data: Mutex<NegotiationData>,
}

impl DeviceNegotiation {
    /// New negotiation in `Init`.
    pub fn new(id: u32, identity: DeviceIdentity, is_self: bool, history_capacity: usize) -> Self {
        Self {
            identity,
            is_self,
            machine: StateMachine::new(id, NegotiationState::Init),
            data: Mutex::new(NegotiationData::new(history_capacity)),
        }
    }

    /// Device identity.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Whether this entry represents the local device.
    pub fn is_self(&self) -> bool {
        self.is_self
    }

    /// Current negotiation state.
    pub fn state(&self) -> NegotiationState {
        self.machine.state()
    }

    /// Machine id.
    pub fn machine_id(&self) -> u32 {
        self.machine.id()
    }

    /// Lock the negotiation data.
    pub fn data(&self) -> MutexGuard<'_, NegotiationData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeviceNegotiation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceNegotiation")
            .field("identity", &self.identity)
            .field("is_self", &self.is_self)
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

/// The static negotiation transition table.
pub(crate) struct NegotiationTable;

impl TransitionTable for NegotiationTable {
    type State = NegotiationState;
    type Event = NegotiationEvent;
    type Handler = Action;
    type Context = Negotiator;

    fn lookup(
        &self,
        state: NegotiationState,
        event: &NegotiationEvent,
    ) -> Option<Transition<NegotiationState, Action>> {
        route(state, event.kind())
    }

    fn invoke(&self, handler: Action, ctx: &Negotiator, event: NegotiationEvent) -> bool {
        match handler {
            Action::Online => ctx.on_online(event),
            Action::VerifyResponse => ctx.on_response(event),
            Action::SendFailed => ctx.on_send_failed(event),
            Action::RetryOnTimeout => ctx.on_retry_timeout(event),
            Action::Offline => ctx.on_offline(),
            Action::QueueCaller => ctx.on_queue_caller(event),
            Action::ResolveCallers => ctx.on_resolve_callers(),
            Action::ExpireCallers => ctx.on_expire_callers(event),
            Action::ForceRecheck => ctx.on_force_recheck(),
        }
    }
}

/// Handler context: the service plus the device being driven.
pub(crate) struct Negotiator {
    service: Arc<ServiceInner>,
    device: Arc<DeviceNegotiation>,
}

impl Negotiator {
    pub(crate) fn new(service: Arc<ServiceInner>, device: Arc<DeviceNegotiation>) -> Self {
        Self { service, device }
    }

    /// Feed an event to this device's machine.
    pub(crate) fn raise(&self, event: NegotiationEvent) {
        self.device.machine.schedule(&NegotiationTable, self, event);
    }

    fn identity(&self) -> &DeviceIdentity {
        self.device.identity()
    }

    fn now_ms(&self) -> u64 {
        self.service.clock.now_ms()
    }

    fn stop_timer(&self, handle: Option<TimerHandle>) {
        if let Some(handle) = handle {
            self.service.timer.stop(handle);
        }
    }

    fn on_online(&self, event: NegotiationEvent) -> bool {
        let NegotiationEvent::DeviceOnline { device_type } = event else {
            return false;
        };
        let now = self.now_ms();
        let fresh_window = self.service.config.fresh_window_ms();

        let resolved = {
            let mut data = self.device.data();
            data.online = true;
            data.device_type = device_type;
            data.last_online_ms = now;
            data.query_attempts = 0;
            if data.is_fresh(now, fresh_window) {
                let result = data.level_result(ErrorCode::Failure);
                Some(data.callers.flush_all(now, result))
            } else {
                None
            }
        };

        match resolved {
            Some(resolved) => {
                tracing::debug!(device = %self.identity().short(), "credential still fresh, skipping query");
                fire_all(resolved, self.identity());
                self.raise(NegotiationEvent::AlreadyFreshSync);
                true
            }
            None => self.send_credential_request(),
        }
    }

    fn on_response(&self, event: NegotiationEvent) -> bool {
        let NegotiationEvent::CredentialResponseReceived(response) = event else {
            return false;
        };
        let now = self.now_ms();
        let window = self.service.config.nonce_window_ms();

        let checked = {
            let data = self.device.data();
            check_challenge(data.nonce.as_ref(), response.challenge, now, window)
        };
        let verdict = checked.and_then(|()| {
            self.service
                .providers
                .default_verify(self.identity(), &response.credential)
        });
        drop(response);

        let (ok, resolved, retry_timer) = {
            let mut data = self.device.data();
            data.last_response_ms = now;
            match verdict {
                Ok(info) => {
                    tracing::info!(
                        device = %self.identity().short(),
                        level = info.cred_level,
                        "credential verified"
                    );
                    let level = info.cred_level;
                    data.credential = info;
                    data.last_verified_ms = now;
                    data.result = Some(Ok(()));
                    data.nonce = None;
                    let retry_timer = data.retry_timer.take();
                    (true, data.callers.flush_all(now, Ok(level)), retry_timer)
                }
                Err(err) => {
                    tracing::warn!(device = %self.identity().short(), "credential response rejected: {}", err);
                    let code = err.code();
                    data.result = Some(Err(code));
                    let retry_timer = data.retry_timer.take();
                    (false, data.callers.flush_all(now, Err(code)), retry_timer)
                }
            }
        };

        self.stop_timer(retry_timer);
        fire_all(resolved, self.identity());
        ok
    }

    fn on_send_failed(&self, event: NegotiationEvent) -> bool {
        let NegotiationEvent::MessageSendFailed(failure) = event else {
            return false;
        };
        if failure == SendFailure::SessionOpen {
            tracing::error!(device = %self.identity().short(), "cannot open session, negotiation failed");
            self.conclude_failed(ErrorCode::Failure);
            return false;
        }

        tracing::debug!(device = %self.identity().short(), "send failed ({}), resending", failure);
        {
            let mut data = self.device.data();
            data.query_attempts = data.query_attempts.saturating_add(1);
        }
        self.send_credential_request()
    }

    fn on_retry_timeout(&self, event: NegotiationEvent) -> bool {
        let NegotiationEvent::RequestTimedOut(generation) = event else {
            return false;
        };
        let max_attempts = self.service.config.max_query_attempts;
        let exhausted = {
            let mut data = self.device.data();
            if data.retry_timer.is_none() || data.retry_generation != generation {
                // superseded by a later send
                tracing::debug!(device = %self.identity().short(), generation, "stale retry timer ignored");
                return true;
            }
            data.retry_timer = None;
            if data.query_attempts >= max_attempts {
                true
            } else {
                data.query_attempts += 1;
                false
            }
        };

        if exhausted {
            tracing::warn!(
                device = %self.identity().short(),
                attempts = max_attempts,
                "no credential response, giving up"
            );
            self.conclude_failed(ErrorCode::Timeout);
            return false;
        }
        self.send_credential_request()
    }

    fn on_offline(&self) -> bool {
        let now = self.now_ms();
        let (resolved, retry_timer) = {
            let mut data = self.device.data();
            data.online = false;
            data.last_offline_ms = now;
            let retry_timer = data.retry_timer.take();
            let result = data.level_result(ErrorCode::DeviceOffline);
            (data.callers.flush_all(now, result), retry_timer)
        };
        self.stop_timer(retry_timer);
        fire_all(resolved, self.identity());
        true
    }

    fn on_queue_caller(&self, event: NegotiationEvent) -> bool {
        if let NegotiationEvent::LocalRequest(caller) = event {
            tracing::debug!(device = %self.identity().short(), %caller, "caller waiting for negotiation");
        }
        true
    }

    fn on_resolve_callers(&self) -> bool {
        let now = self.now_ms();
        let resolved = {
            let mut data = self.device.data();
            let result = data.level_result(ErrorCode::Failure);
            data.callers.flush_all(now, result)
        };
        fire_all(resolved, self.identity());
        true
    }

    fn on_expire_callers(&self, event: NegotiationEvent) -> bool {
        let now = self.now_ms();
        let resolved = {
            let mut data = self.device.data();
            let mut resolved = data.callers.flush_expired(now);
            if let NegotiationEvent::LocalRequestTimedOut(caller) = event {
                resolved.extend(data.callers.expire(caller, now));
            }
            resolved
        };
        if !resolved.is_empty() {
            tracing::debug!(device = %self.identity().short(), count = resolved.len(), "callers timed out");
        }
        fire_all(resolved, self.identity());
        true
    }

    fn on_force_recheck(&self) -> bool {
        self.device.data().query_attempts = 0;
        self.send_credential_request()
    }

    /// Record a failed round, stop retrying and resolve everyone waiting.
    fn conclude_failed(&self, code: ErrorCode) {
        let now = self.now_ms();
        let (resolved, retry_timer) = {
            let mut data = self.device.data();
            data.result = Some(Err(code));
            let retry_timer = data.retry_timer.take();
            (data.callers.flush_all(now, Err(code)), retry_timer)
        };
        self.stop_timer(retry_timer);
        fire_all(resolved, self.identity());
    }

    fn arm_retry_timer(&self) {
        let generation = {
            let mut data = self.device.data();
            data.retry_generation = data.retry_generation.wrapping_add(1);
            data.retry_generation
        };
        let service = Arc::downgrade(&self.service);
        let identity = *self.identity();
        let handle = self.service.timer.start_once(
            self.service.config.retry_interval,
            Box::new(move || {
                if let Some(service) = service.upgrade() {
                    let _ = service.raise(&identity, NegotiationEvent::RequestTimedOut(generation));
                }
            }),
        );
        self.device.data().retry_timer = Some(handle);
    }

    /// Send (or resend) a credential request with a live challenge and
    /// re-arm the retry timer. Returns `false` if no request could be built.
    fn send_credential_request(&self) -> bool {
        let now = self.now_ms();
        let config = &self.service.config;

        let mut support = self.service.providers.supported_types(MAX_SUPPORT_TYPES);
        if support.is_empty() {
            support = DEFAULT_SUPPORT_TYPES.to_vec();
        }

        let (transaction_id, request, previous_timer) = {
            let mut data = self.device.data();
            let challenge = refresh_nonce(&mut data.nonce, now, config.nonce_window_ms());
            data.transaction_counter = data.transaction_counter.wrapping_add(1);
            data.last_request_ms = now;
            let request = CredentialRequest {
                version: config.version(),
                challenge,
                support,
            };
            (data.transaction_counter, request, data.retry_timer.take())
        };
        self.stop_timer(previous_timer);

        if self.device.is_self() {
            return self.answer_locally(&request);
        }

        let bytes = match build_request(&request) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(device = %self.identity().short(), "cannot build credential request: {}", err);
                return false;
            }
        };

        self.arm_retry_timer();

        tracing::debug!(
            device = %self.identity().short(),
            transaction = transaction_id,
            challenge = %request.challenge,
            "sending credential request"
        );
        match self.service.transport.send(transaction_id, self.identity(), &bytes) {
            Ok(()) => {}
            Err(SendFailure::SessionOpen) => {
                self.raise(NegotiationEvent::MessageSendFailed(SendFailure::SessionOpen));
            }
            Err(failure) => {
                // the retry timer resends
                tracing::warn!(device = %self.identity().short(), "send rejected: {}", failure);
            }
        }
        true
    }

    /// The local device answers its own request through the provider.
    fn answer_locally(&self, request: &CredentialRequest) -> bool {
        match self.service.providers.default_request(request) {
            Ok(credential) => {
                self.raise(NegotiationEvent::CredentialResponseReceived(CredentialResponse {
                    version: request.version,
                    challenge: request.challenge,
                    credential,
                }));
                true
            }
            Err(err) => {
                tracing::warn!("no local credential: {}", err);
                self.conclude_failed(err.code());
                false
            }
        }
    }
}
