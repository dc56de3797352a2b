//! Shared engine context handed to every component.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::NetworkConfig;
use crate::device::Device;
use crate::events::{EventSender, NetworkEvent};
use crate::peer::PeerRegistry;
use crate::transport::ConnectionEventSender;

/// Everything the advertiser, browser and router share.
///
/// The registry mutex is the engine's one serialization point. It is never
/// held across an `.await`; events caused by a registry mutation are queued
/// while it is held so their order matches the order of the mutations.
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<NetworkConfig>,
    pub registry: Arc<Mutex<PeerRegistry>>,
    pub events: EventSender,
    pub connection_events: ConnectionEventSender,
    local: Arc<RwLock<Option<Device>>>,
}

impl EngineContext {
    pub fn new(
        config: NetworkConfig,
        events: EventSender,
        connection_events: ConnectionEventSender,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(Mutex::new(PeerRegistry::new())),
            events,
            connection_events,
            local: Arc::new(RwLock::new(None)),
        }
    }

    /// Our own identity, once set.
    pub fn local_device(&self) -> Option<Device> {
        self.local.read().clone()
    }

    pub fn set_local_device(&self, device: Device) {
        *self.local.write() = Some(device);
    }

    /// Queue a device snapshot taken from an already locked registry.
    pub fn emit_snapshot(&self, registry: &PeerRegistry) {
        self.events.emit(NetworkEvent::AvailableDevices {
            devices: registry.snapshot(),
        });
    }
}
