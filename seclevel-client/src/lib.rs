//! # seclevel-client
//!
//! Local caller SDK for asking a [`SecurityLevelService`] about the security
//! level of a peer device.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use seclevel_client::SecurityLevelClient;
//! use seclevel_core::DeviceIdentity;
//! # async fn demo(service: seclevel_server::SecurityLevelService) -> seclevel_core::SecLevelResult<()> {
//! let client = SecurityLevelClient::new(service, 42);
//! let peer: DeviceIdentity = "living-room-hub".parse()?;
//!
//! let level = client.query(&peer, Duration::from_secs(5)).await?;
//! println!("peer level: {}", level);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use seclevel_core::{DeviceIdentity, ErrorCode, SecLevelError, SecLevelResult};
use seclevel_server::{CallerId, LevelResult, SecurityLevelService};

/// How long past its own timeout a query waits for the service's answer.
const CALLBACK_GRACE: Duration = Duration::from_secs(1);

fn into_result(result: LevelResult) -> SecLevelResult<u32> {
    result.map_err(SecLevelError::from_code)
}

/// Handle a local component uses to query peer levels.
///
/// Every query gets a fresh caller id made of the client's `owner` and an
/// increasing cookie.
pub struct SecurityLevelClient {
    service: SecurityLevelService,
    owner: u32,
    next_cookie: AtomicU32,
}

impl SecurityLevelClient {
    /// Create a client identified by `owner`.
    pub fn new(service: SecurityLevelService, owner: u32) -> Self {
        Self {
            service,
            owner,
            next_cookie: AtomicU32::new(1),
        }
    }

    /// Owner id stamped on every query.
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Underlying service.
    pub fn service(&self) -> &SecurityLevelService {
        &self.service
    }

    fn next_caller(&self) -> CallerId {
        CallerId {
            owner: self.owner,
            cookie: self.next_cookie.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Query with a callback.
    ///
    /// On `Ok` the callback runs exactly once, possibly before this returns.
    pub fn query_with<F>(
        &self,
        target: &DeviceIdentity,
        timeout: Duration,
        callback: F,
    ) -> SecLevelResult<CallerId>
    where
        F: FnOnce(&DeviceIdentity, LevelResult) + Send + 'static,
    {
        let caller = self.next_caller();
        self.service
            .request_local_security_level(target, timeout, caller, Box::new(callback))?;
        Ok(caller)
    }

    /// Query and await the level.
    pub async fn query(&self, target: &DeviceIdentity, timeout: Duration) -> SecLevelResult<u32> {
        let (tx, rx) = oneshot::channel();
        let caller = self.next_caller();
        let service = self.service.clone();
        let target = *target;

        // negotiation handlers take blocking locks and may call the transport inline
        tokio::task::spawn_blocking(move || {
            service.request_local_security_level(
                &target,
                timeout,
                caller,
                Box::new(move |_, result| {
                    let _ = tx.send(result);
                }),
            )
        })
        .await
        .map_err(|e| SecLevelError::Transport(format!("query task failed: {}", e)))??;

        tracing::debug!(%caller, device = %target.short(), "waiting for security level");
        match tokio::time::timeout(timeout + CALLBACK_GRACE, rx).await {
            Ok(Ok(result)) => into_result(result),
            Ok(Err(_)) => Err(SecLevelError::Negotiation(ErrorCode::Failure)),
            Err(_) => Err(SecLevelError::Timeout),
        }
    }

    /// Level of the device this client runs on.
    pub async fn query_self(&self, timeout: Duration) -> SecLevelResult<u32> {
        self.query(&DeviceIdentity::self_alias(), timeout).await
    }

    /// Query and block the calling thread until the level is known.
    ///
    /// Must not be called from inside an async task.
    pub fn query_blocking(&self, target: &DeviceIdentity, timeout: Duration) -> SecLevelResult<u32> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.query_with(target, timeout, move |_, result| {
            let _ = tx.send(result);
        })?;
        match rx.recv_timeout(timeout + CALLBACK_GRACE) {
            Ok(result) => into_result(result),
            Err(_) => Err(SecLevelError::Timeout),
        }
    }

    /// Last negotiated level of `target`, without querying.
    pub fn cached(&self, target: &DeviceIdentity) -> Option<SecLevelResult<u32>> {
        self.service.cached_level(target).map(into_result)
    }
}

impl std::fmt::Debug for SecurityLevelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityLevelClient")
            .field("owner", &self.owner)
            .field("next_cookie", &self.next_cookie.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    use seclevel_core::{CredentialClaims, SignedCredentialProvider};
    use seclevel_server::{MemoryNetwork, TokioTimer};

    fn identity(name: &str) -> DeviceIdentity {
        DeviceIdentity::new(name.as_bytes()).unwrap()
    }

    fn node(
        network: &Arc<MemoryNetwork>,
        name: &str,
        issuer: Option<&SigningKey>,
        level: u32,
        runtime: tokio::runtime::Handle,
    ) -> SecurityLevelService {
        let id = identity(name);
        let builder = SecurityLevelService::builder(
            network.transport(id),
            Arc::new(TokioTimer::new(runtime)),
        );
        let builder = match issuer {
            Some(issuer) => {
                let claims = CredentialClaims {
                    udid: name.to_string(),
                    version: "1.0.0".to_string(),
                    sign_time: chrono::Utc::now(),
                    manufacture: "acme".to_string(),
                    model: "sensor".to_string(),
                    brand: "acme".to_string(),
                    security_level: format!("SL{}", level),
                    cred_level: level,
                };
                let provider = SignedCredentialProvider::self_issued(issuer, &claims).unwrap();
                builder.provider(Arc::new(provider))
            }
            None => builder,
        };
        let service = builder.build().unwrap();
        network.attach(id, &service);
        network.set_online(id, true);
        service
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn query_peer_and_self() {
        let network = MemoryNetwork::new();
        let issuer = SigningKey::generate(&mut OsRng);
        let handle = tokio::runtime::Handle::current();
        let a = node(&network, "node-a", Some(&issuer), 2, handle.clone());
        let _b = node(&network, "node-b", Some(&issuer), 4, handle);

        let client = SecurityLevelClient::new(a, 7);
        let level = client
            .query(&identity("node-b"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(level, 4);
        assert_eq!(client.query_self(Duration::from_secs(2)).await.unwrap(), 2);
        assert_eq!(client.cached(&identity("node-b")).unwrap().unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unanswered_query_times_out() {
        let network = MemoryNetwork::new();
        let issuer = SigningKey::generate(&mut OsRng);
        let handle = tokio::runtime::Handle::current();
        let a = node(&network, "node-a", Some(&issuer), 2, handle.clone());
        // no provider: requests to this node go unanswered
        let _mute = node(&network, "node-mute", None, 0, handle);

        let client = SecurityLevelClient::new(a, 7);
        let err = client
            .query(&identity("node-mute"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SecLevelError::Timeout), "{:?}", err);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_peer_is_rejected_immediately() {
        let network = MemoryNetwork::new();
        let issuer = SigningKey::generate(&mut OsRng);
        let a = node(
            &network,
            "node-a",
            Some(&issuer),
            2,
            tokio::runtime::Handle::current(),
        );

        let client = SecurityLevelClient::new(a, 7);
        let err = client
            .query(&identity("node-gone"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownDevice);
    }

    #[test]
    fn blocking_query() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let network = MemoryNetwork::new();
        let issuer = SigningKey::generate(&mut OsRng);
        let a = node(&network, "node-a", Some(&issuer), 3, runtime.handle().clone());
        let _b = node(&network, "node-b", Some(&issuer), 1, runtime.handle().clone());

        let client = SecurityLevelClient::new(a, 9);
        assert_eq!(
            client
                .query_blocking(&identity("node-b"), Duration::from_secs(2))
                .unwrap(),
            1
        );
    }

    #[test]
    fn callers_get_distinct_cookies() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let network = MemoryNetwork::new();
        let issuer = SigningKey::generate(&mut OsRng);
        let a = node(&network, "node-a", Some(&issuer), 3, runtime.handle().clone());
        let client = SecurityLevelClient::new(a, 5);

        let first = client
            .query_with(&DeviceIdentity::self_alias(), Duration::from_secs(1), |_, _| {})
            .unwrap();
        let second = client
            .query_with(&DeviceIdentity::self_alias(), Duration::from_secs(1), |_, _| {})
            .unwrap();

        assert_eq!(first.owner, 5);
        assert_ne!(first.cookie, second.cookie);
    }
}
