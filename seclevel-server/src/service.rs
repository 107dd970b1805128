//! The security-level service and its entry points.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use seclevel_core::message::{build_response, parse_message};
use seclevel_core::{
    CredentialProvider, CredentialRequest, CredentialResponse, DeviceIdentity, ErrorCode,
    NegotiationState, PeerMessage, ProviderRegistry, SecLevelError, SecLevelResult,
};

use crate::config::ServiceConfig;
use crate::dump::DeviceSnapshot;
use crate::negotiation::{DeviceNegotiation, NegotiationEvent, Negotiator};
use crate::notify::{CallerId, LevelCallback, LevelResult, NotifyEntry};
use crate::registry::DeviceRegistry;
use crate::timer::TimerService;
use crate::transport::{Clock, SendFailure, SystemClock, Transport};

/// Shared service state reachable from handlers and timer callbacks.
pub(crate) struct ServiceInner {
    pub(crate) config: ServiceConfig,
    pub(crate) registry: DeviceRegistry,
    pub(crate) providers: ProviderRegistry,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) timer: Arc<dyn TimerService>,
    pub(crate) clock: Arc<dyn Clock>,
    response_counter: AtomicU32,
}

impl ServiceInner {
    /// Raise `event` on a tracked device.
    pub(crate) fn raise(
        self: &Arc<Self>,
        identity: &DeviceIdentity,
        event: NegotiationEvent,
    ) -> SecLevelResult<()> {
        let device = self
            .registry
            .get(identity)
            .ok_or_else(|| SecLevelError::UnknownDevice(identity.to_string()))?;
        self.raise_on(device, event);
        Ok(())
    }

    fn raise_on(self: &Arc<Self>, device: Arc<DeviceNegotiation>, event: NegotiationEvent) {
        Negotiator::new(Arc::clone(self), device).raise(event);
    }

    fn is_self(&self, identity: &DeviceIdentity) -> bool {
        self.transport.self_identity().as_ref() == Some(identity)
    }
}

/// Builder for [`SecurityLevelService`].
pub struct ServiceBuilder {
    config: ServiceConfig,
    providers: ProviderRegistry,
    transport: Arc<dyn Transport>,
    timer: Arc<dyn TimerService>,
    clock: Arc<dyn Clock>,
}

impl ServiceBuilder {
    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the credential provider.
    pub fn provider(self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    /// Use a custom clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the provider (if any) and build the service.
    pub fn build(self) -> SecLevelResult<SecurityLevelService> {
        if self.providers.is_registered() {
            self.providers.default_init()?;
        } else {
            tracing::warn!("no credential provider registered, negotiations will fail");
        }

        let registry = DeviceRegistry::new(self.config.max_devices, self.config.history_capacity);
        let inner = Arc::new(ServiceInner {
            config: self.config,
            registry,
            providers: self.providers,
            transport: self.transport,
            timer: self.timer,
            clock: self.clock,
            response_counter: AtomicU32::new(0),
        });
        Ok(SecurityLevelService { inner })
    }
}

/// Negotiates and caches the security level of peer devices.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct SecurityLevelService {
    inner: Arc<ServiceInner>,
}

/// Non-owning handle to a [`SecurityLevelService`], held by transports.
#[derive(Clone, Default)]
pub struct WeakService {
    inner: Weak<ServiceInner>,
}

impl WeakService {
    /// The service, if it is still alive.
    pub fn upgrade(&self) -> Option<SecurityLevelService> {
        self.inner
            .upgrade()
            .map(|inner| SecurityLevelService { inner })
    }
}

impl SecurityLevelService {
    /// Start building a service on the given collaborators.
    pub fn builder(transport: Arc<dyn Transport>, timer: Arc<dyn TimerService>) -> ServiceBuilder {
        ServiceBuilder {
            config: ServiceConfig::default(),
            providers: ProviderRegistry::new(),
            transport,
            timer,
            clock: Arc::new(SystemClock),
        }
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakService {
        WeakService {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The provider registry; registering replaces the current provider.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    /// Current state of a tracked device.
    pub fn state_of(&self, identity: &DeviceIdentity) -> Option<NegotiationState> {
        self.inner.registry.get(identity).map(|d| d.state())
    }

    /// Tracked device, for inspection.
    pub fn device(&self, identity: &DeviceIdentity) -> Option<Arc<DeviceNegotiation>> {
        self.inner.registry.get(identity)
    }

    /// Raise an event directly on a tracked device.
    pub fn raise(&self, identity: &DeviceIdentity, event: NegotiationEvent) -> SecLevelResult<()> {
        self.inner.raise(identity, event)
    }

    fn resolve(&self, identity: &DeviceIdentity) -> SecLevelResult<DeviceIdentity> {
        if !identity.is_self_alias() {
            return Ok(*identity);
        }
        self.inner
            .transport
            .self_identity()
            .ok_or(SecLevelError::NotReady)
    }

    /// A peer came online or went offline.
    pub fn on_peer_status_changed(
        &self,
        identity: &DeviceIdentity,
        online: bool,
        device_type: u32,
    ) -> SecLevelResult<()> {
        let identity = self.resolve(identity)?;
        tracing::info!(device = %identity.short(), online, device_type, "peer status changed");

        let device = self
            .inner
            .registry
            .get_or_create(&identity, self.inner.is_self(&identity))?;
        let event = if online {
            NegotiationEvent::DeviceOnline { device_type }
        } else {
            NegotiationEvent::DeviceOffline
        };
        self.inner.raise_on(device, event);
        Ok(())
    }

    /// A message arrived from a peer.
    ///
    /// Requests are answered immediately through the registered provider.
    /// Responses feed the sender's negotiation.
    pub fn on_peer_message(&self, identity: &DeviceIdentity, bytes: &[u8]) -> SecLevelResult<()> {
        let message = parse_message(bytes, self.inner.config.max_message_len).map_err(|e| {
            tracing::warn!(device = %identity.short(), "dropping peer message: {}", e);
            e
        })?;

        match message {
            PeerMessage::Request(request) => self.answer_request(identity, &request),
            PeerMessage::Response(response) => {
                tracing::debug!(
                    device = %identity.short(),
                    challenge = %response.challenge,
                    "credential response received"
                );
                self.inner
                    .raise(identity, NegotiationEvent::CredentialResponseReceived(response))
            }
        }
    }

    fn answer_request(
        &self,
        identity: &DeviceIdentity,
        request: &CredentialRequest,
    ) -> SecLevelResult<()> {
        tracing::debug!(
            device = %identity.short(),
            challenge = %request.challenge,
            version = %request.version,
            "credential request received"
        );
        let credential = self.inner.providers.default_request(request)?;
        let response = CredentialResponse {
            version: self.inner.config.version(),
            challenge: request.challenge,
            credential,
        };
        let bytes = build_response(&response)?;
        drop(response);

        let transaction_id = self.inner.response_counter.fetch_add(1, Ordering::Relaxed);
        self.inner
            .transport
            .send(transaction_id, identity, &bytes)
            .map_err(|e| SecLevelError::Transport(e.to_string()))
    }

    /// Asynchronous delivery failure reported by the transport.
    pub fn on_send_result(
        &self,
        identity: &DeviceIdentity,
        transaction_id: u32,
        failure: SendFailure,
    ) -> SecLevelResult<()> {
        tracing::debug!(device = %identity.short(), transaction = transaction_id, "send failed: {}", failure);
        self.inner
            .raise(identity, NegotiationEvent::MessageSendFailed(failure))
    }

    /// Ask for the security level of `identity`.
    ///
    /// `callback` runs exactly once, with the level or a failure code, no
    /// later than `timeout` after this call returns `Ok`. On `Err` it never
    /// runs.
    pub fn request_local_security_level(
        &self,
        identity: &DeviceIdentity,
        timeout: Duration,
        caller: CallerId,
        callback: LevelCallback,
    ) -> SecLevelResult<()> {
        if timeout.is_zero() {
            return Err(SecLevelError::InvalidParameters(
                "timeout must be positive".into(),
            ));
        }
        if !self.inner.transport.is_ready() {
            return Err(SecLevelError::NotReady);
        }
        let identity = self.resolve(identity)?;
        let is_self = self.inner.is_self(&identity);
        let reachable = || is_self || self.inner.transport.is_peer_online(&identity);

        // rejected queries must not leave entries behind
        let device = match self.inner.registry.get(&identity) {
            Some(device) => device,
            None if reachable() => self.inner.registry.get_or_create(&identity, is_self)?,
            None => return Err(SecLevelError::UnknownDevice(identity.to_string())),
        };

        let online = device.data().online;
        if !online {
            if reachable() {
                self.inner
                    .raise_on(Arc::clone(&device), NegotiationEvent::DeviceOnline { device_type: 0 });
            } else {
                return Err(SecLevelError::DeviceOffline(identity.to_string()));
            }
        }

        let limit = self.inner.config.max_pending_callers;
        let now = self.inner.clock.now_ms();
        let keep_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        {
            let mut data = device.data();
            if data.callers.pending().len() >= limit {
                tracing::warn!(device = %identity.short(), %caller, limit, "too many waiting callers");
                return Err(SecLevelError::Overloaded { limit });
            }
            data.callers
                .push(NotifyEntry::new(caller, now, keep_ms, callback));
        }

        let service = Arc::downgrade(&self.inner);
        self.inner.timer.start_once(
            timeout,
            Box::new(move || {
                if let Some(service) = service.upgrade() {
                    let _ = service.raise(&identity, NegotiationEvent::LocalRequestTimedOut(caller));
                }
            }),
        );

        tracing::debug!(device = %identity.short(), %caller, "security level requested");
        self.inner.raise_on(device, NegotiationEvent::LocalRequest(caller));
        Ok(())
    }

    /// Re-run the credential query for a tracked device.
    pub fn force_recheck(&self, identity: &DeviceIdentity) -> SecLevelResult<()> {
        let identity = self.resolve(identity)?;
        self.inner.raise(&identity, NegotiationEvent::ForceRecheck)
    }

    /// Cached level of a device, without negotiating.
    pub fn cached_level(&self, identity: &DeviceIdentity) -> Option<LevelResult> {
        let identity = self.resolve(identity).ok()?;
        let device = self.inner.registry.get(&identity)?;
        let data = device.data();
        data.result
            .map(|_| data.level_result(ErrorCode::Failure))
    }

    /// Diagnostic snapshot of every tracked device.
    pub fn dump(&self) -> Vec<DeviceSnapshot> {
        self.inner
            .registry
            .snapshot()
            .iter()
            .map(|device| DeviceSnapshot::capture(device))
            .collect()
    }

    /// Number of tracked devices.
    pub fn device_count(&self) -> usize {
        self.inner.registry.len()
    }
}

impl std::fmt::Debug for SecurityLevelService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLevelService")
            .field("devices", &self.inner.registry.len())
            .field("provider", &self.inner.providers.is_registered())
            .finish()
    }
}
