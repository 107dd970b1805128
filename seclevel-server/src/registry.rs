//! Registry of tracked devices.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seclevel_core::{DeviceIdentity, SecLevelError, SecLevelResult};

use crate::negotiation::DeviceNegotiation;

/// Bounded set of device negotiations, looked up by identity.
///
/// Entries are never removed; the machine id of an entry is its insertion
/// index.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Arc<DeviceNegotiation>>>,
    max_devices: usize,
    history_capacity: usize,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new(max_devices: usize, history_capacity: usize) -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            max_devices,
            history_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<DeviceNegotiation>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Find a device.
    pub fn get(&self, identity: &DeviceIdentity) -> Option<Arc<DeviceNegotiation>> {
        self.lock()
            .iter()
            .find(|d| d.identity() == identity)
            .cloned()
    }

    /// Find a device, creating it in `Init` if it is not tracked yet.
    pub fn get_or_create(
        &self,
        identity: &DeviceIdentity,
        is_self: bool,
    ) -> SecLevelResult<Arc<DeviceNegotiation>> {
        if identity.is_self_alias() {
            return Err(SecLevelError::InvalidParameters(
                "self alias must be resolved before registration".into(),
            ));
        }

        let mut devices = self.lock();
        if let Some(device) = devices.iter().find(|d| d.identity() == identity) {
            return Ok(Arc::clone(device));
        }
        if devices.len() >= self.max_devices {
            tracing::warn!(device = %identity.short(), limit = self.max_devices, "device registry full");
            return Err(SecLevelError::RegistryFull {
                limit: self.max_devices,
            });
        }

        let id = devices.len() as u32;
        let device = Arc::new(DeviceNegotiation::new(
            id,
            *identity,
            is_self,
            self.history_capacity,
        ));
        devices.push(Arc::clone(&device));
        tracing::debug!(device = %identity.short(), machine = id, is_self, "tracking device");
        Ok(device)
    }

    /// Number of tracked devices.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no device is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All devices, in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<DeviceNegotiation>> {
        self.lock().clone()
    }
}
