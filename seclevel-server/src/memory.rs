//! In-process transport connecting several services.
//!
//! Delivery is synchronous: `send` calls straight into the receiving
//! service. Useful for tests and for running several logical devices inside
//! one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seclevel_core::DeviceIdentity;

use crate::service::{SecurityLevelService, WeakService};
use crate::transport::{SendFailure, Transport};

#[derive(Default)]
struct Node {
    service: WeakService,
    online: bool,
}

/// Shared medium all [`MemoryTransport`]s of a test world attach to.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: Mutex<HashMap<DeviceIdentity, Node>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceIdentity, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport for the device `identity`.
    pub fn transport(self: &Arc<Self>, identity: DeviceIdentity) -> Arc<MemoryTransport> {
        self.lock().entry(identity).or_default();
        Arc::new(MemoryTransport {
            network: Arc::clone(self),
            identity,
        })
    }

    /// Route messages for `identity` to `service`.
    pub fn attach(&self, identity: DeviceIdentity, service: &SecurityLevelService) {
        self.lock().entry(identity).or_default().service = service.downgrade();
    }

    /// Bring a device up or down and tell every other attached service.
    pub fn set_online(&self, identity: DeviceIdentity, online: bool) {
        let observers: Vec<SecurityLevelService> = {
            let mut nodes = self.lock();
            nodes.entry(identity).or_default().online = online;
            nodes
                .iter()
                .filter(|(id, _)| **id != identity)
                .filter_map(|(_, node)| node.service.upgrade())
                .collect()
        };
        for service in observers {
            if let Err(e) = service.on_peer_status_changed(&identity, online, 0) {
                tracing::warn!(device = %identity.short(), "status change not applied: {}", e);
            }
        }
    }

    /// Whether `identity` is up.
    pub fn is_online(&self, identity: &DeviceIdentity) -> bool {
        self.lock().get(identity).is_some_and(|node| node.online)
    }
}

/// One device's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    identity: DeviceIdentity,
}

impl Transport for MemoryTransport {
    fn is_ready(&self) -> bool {
        true
    }

    fn self_identity(&self) -> Option<DeviceIdentity> {
        Some(self.identity)
    }

    fn is_peer_online(&self, identity: &DeviceIdentity) -> bool {
        self.network.is_online(identity)
    }

    fn send(
        &self,
        transaction_id: u32,
        identity: &DeviceIdentity,
        bytes: &[u8],
    ) -> Result<(), SendFailure> {
        let target = {
            let nodes = self.network.lock();
            match nodes.get(identity) {
                Some(node) if node.online => node.service.upgrade(),
                _ => None,
            }
        };
        let Some(target) = target else {
            tracing::debug!(device = %identity.short(), transaction = transaction_id, "no session to peer");
            return Err(SendFailure::SessionOpen);
        };
        if let Err(e) = target.on_peer_message(&self.identity, bytes) {
            tracing::debug!(from = %self.identity.short(), "peer rejected message: {}", e);
        }
        Ok(())
    }
}
