//! Deterministic collaborators for driving a service by hand.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use seclevel_core::message::{build_response, parse_message};
use seclevel_core::{
    Challenge, CredentialBuffer, CredentialInfo, CredentialProvider, CredentialRequest,
    CredentialResponse, DeviceIdentity, PeerMessage, SecLevelError, SecLevelResult, Version,
    CRED_TYPE_PLAIN,
};
use seclevel_server::{
    CallerId, Clock, LevelResult, SecurityLevelService, SendFailure, ServiceConfig, TimerCallback,
    TimerHandle, TimerService, Transport,
};

pub const START_MS: u64 = 1_700_000_000_000;
pub const RETRY: Duration = Duration::from_secs(40);
pub const LONG_WAIT: Duration = Duration::from_secs(3600);

struct Armed {
    handle: TimerHandle,
    delay: Duration,
    callback: TimerCallback,
}

/// Timers that only fire when the test says so.
#[derive(Default)]
pub struct ManualTimer {
    next: AtomicU64,
    armed: Mutex<Vec<Armed>>,
}

impl ManualTimer {
    /// Fire every armed timer started with `delay`; returns how many fired.
    pub fn fire(&self, delay: Duration) -> usize {
        let due: Vec<Armed> = {
            let mut armed = self.armed.lock().unwrap();
            let (due, rest) = std::mem::take(&mut *armed)
                .into_iter()
                .partition(|a| a.delay == delay);
            *armed = rest;
            due
        };
        let count = due.len();
        for timer in due {
            (timer.callback)();
        }
        count
    }

    pub fn armed(&self, delay: Duration) -> usize {
        self.armed
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.delay == delay)
            .count()
    }
}

impl TimerService for ManualTimer {
    fn start_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle(self.next.fetch_add(1, Ordering::SeqCst));
        self.armed.lock().unwrap().push(Armed {
            handle,
            delay,
            callback,
        });
        handle
    }

    fn stop(&self, handle: TimerHandle) {
        self.armed.lock().unwrap().retain(|a| a.handle != handle);
    }
}

/// Clock advanced by hand.
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub transaction_id: u32,
    pub to: DeviceIdentity,
    pub bytes: Vec<u8>,
}

/// Transport that records what would go on the wire.
pub struct RecordingTransport {
    local: DeviceIdentity,
    ready: AtomicBool,
    online: Mutex<HashSet<DeviceIdentity>>,
    sent: Mutex<Vec<Sent>>,
    fail_with: Mutex<Option<SendFailure>>,
}

impl RecordingTransport {
    pub fn new(local: DeviceIdentity) -> Self {
        Self {
            local,
            ready: AtomicBool::new(true),
            online: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_online(&self, identity: DeviceIdentity, online: bool) {
        let mut set = self.online.lock().unwrap();
        if online {
            set.insert(identity);
        } else {
            set.remove(&identity);
        }
    }

    pub fn fail_with(&self, failure: Option<SendFailure>) {
        *self.fail_with.lock().unwrap() = failure;
    }

    pub fn sent_to(&self, identity: &DeviceIdentity) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|s| &s.to == identity)
            .cloned()
            .collect()
    }

    pub fn total_sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Requests sent to `identity`, decoded.
    pub fn requests_to(&self, identity: &DeviceIdentity) -> Vec<CredentialRequest> {
        self.sent_to(identity)
            .iter()
            .filter_map(|s| match parse_message(&s.bytes, usize::MAX).ok()? {
                PeerMessage::Request(request) => Some(request),
                PeerMessage::Response(_) => None,
            })
            .collect()
    }

    pub fn last_challenge(&self, identity: &DeviceIdentity) -> Challenge {
        self.requests_to(identity)
            .last()
            .map(|r| r.challenge)
            .expect("no request sent")
    }
}

impl Transport for RecordingTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn self_identity(&self) -> Option<DeviceIdentity> {
        Some(self.local)
    }

    fn is_peer_online(&self, identity: &DeviceIdentity) -> bool {
        self.online.lock().unwrap().contains(identity)
    }

    fn send(
        &self,
        transaction_id: u32,
        identity: &DeviceIdentity,
        bytes: &[u8],
    ) -> Result<(), SendFailure> {
        self.sent.lock().unwrap().push(Sent {
            transaction_id,
            to: *identity,
            bytes: bytes.to_vec(),
        });
        match *self.fail_with.lock().unwrap() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Provider speaking `level:N` plain credentials.
pub struct StubProvider {
    pub level: u32,
}

impl CredentialProvider for StubProvider {
    fn supported_types(&self) -> &[u32] {
        &[CRED_TYPE_PLAIN]
    }

    fn request(&self, _request: &CredentialRequest) -> SecLevelResult<CredentialBuffer> {
        Ok(plain_credential(self.level))
    }

    fn verify(
        &self,
        _identity: &DeviceIdentity,
        credential: &CredentialBuffer,
    ) -> SecLevelResult<CredentialInfo> {
        let text = std::str::from_utf8(credential.as_bytes())
            .map_err(|_| SecLevelError::Credential("not utf-8".into()))?;
        let level: u32 = text
            .strip_prefix("level:")
            .and_then(|n| n.parse().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| SecLevelError::Credential(format!("bad credential {}", text)))?;
        Ok(CredentialInfo {
            security_level: format!("SL{}", level),
            cred_type: credential.cred_type(),
            cred_level: level,
            ..Default::default()
        })
    }
}

pub fn plain_credential(level: u32) -> CredentialBuffer {
    CredentialBuffer::new(CRED_TYPE_PLAIN, format!("level:{}", level).into_bytes())
}

/// Wire bytes of a response carrying `challenge` and a `level:N` credential.
pub fn response_bytes(challenge: Challenge, level: u32) -> Vec<u8> {
    build_response(&CredentialResponse {
        version: Version::DEFAULT,
        challenge,
        credential: plain_credential(level),
    })
    .unwrap()
}

pub fn id(name: &str) -> DeviceIdentity {
    DeviceIdentity::new(name.as_bytes()).unwrap()
}

pub type Outcomes = Arc<Mutex<Vec<(u32, LevelResult)>>>;

/// A service wired to manual collaborators.
pub struct World {
    pub service: SecurityLevelService,
    pub transport: Arc<RecordingTransport>,
    pub timer: Arc<ManualTimer>,
    pub clock: Arc<ManualClock>,
    pub outcomes: Outcomes,
    cookie: AtomicU32,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let transport = Arc::new(RecordingTransport::new(id("local")));
        let timer = Arc::new(ManualTimer::default());
        let clock = Arc::new(ManualClock::new(START_MS));
        let service = SecurityLevelService::builder(transport.clone(), timer.clone())
            .config(config)
            .clock(clock.clone())
            .provider(Arc::new(StubProvider { level: 4 }))
            .build()
            .unwrap();
        Self {
            service,
            transport,
            timer,
            clock,
            outcomes: Outcomes::default(),
            cookie: AtomicU32::new(1),
        }
    }

    pub fn bring_online(&self, peer: &DeviceIdentity) {
        self.transport.set_online(*peer, true);
        self.service.on_peer_status_changed(peer, true, 0).unwrap();
    }

    pub fn take_offline(&self, peer: &DeviceIdentity) {
        self.transport.set_online(*peer, false);
        self.service.on_peer_status_changed(peer, false, 0).unwrap();
    }

    /// Answer the last request to `peer` with a `level:N` credential.
    pub fn answer(&self, peer: &DeviceIdentity, level: u32) -> SecLevelResult<()> {
        let challenge = self.transport.last_challenge(peer);
        self.service.on_peer_message(peer, &response_bytes(challenge, level))
    }

    /// Issue a local request; returns the cookie identifying its outcome.
    pub fn request(&self, peer: &DeviceIdentity, timeout: Duration) -> SecLevelResult<u32> {
        let cookie = self.cookie.fetch_add(1, Ordering::SeqCst);
        let outcomes = Arc::clone(&self.outcomes);
        self.service
            .request_local_security_level(
                peer,
                timeout,
                CallerId { owner: 7, cookie },
                Box::new(move |_, result| outcomes.lock().unwrap().push((cookie, result))),
            )
            .map(|()| cookie)
    }

    pub fn outcome(&self, cookie: u32) -> Option<LevelResult> {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| *c == cookie)
            .map(|(_, r)| *r)
    }

    pub fn outcome_count(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }
}
