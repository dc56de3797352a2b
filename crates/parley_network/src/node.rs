//! ParleyNode: top-level coordinator for the networking engine.
//!
//! [`ParleyNode`] is the primary public API for parley_network. It owns:
//! - the advertiser (our discovery record plus the TCP listener)
//! - the browser (finding and dialing other advertisers)
//! - the message router (outbound sends, inbound frames)
//! - the event hub and its dispatcher task

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::advertiser::Advertiser;
use crate::browser::Browser;
use crate::config::NetworkConfig;
use crate::context::EngineContext;
use crate::device::{Device, ServiceNamespace};
use crate::error::NetworkError;
use crate::events::{EventHub, Subscriber, SubscriberId, spawn_dispatcher};
use crate::router::{MessageRouter, run_inbound_loop};

/// A discoverable chat endpoint on the local network.
///
/// Create one per application instance, inside a Tokio runtime. Call
/// [`set_identity`](ParleyNode::set_identity) to start advertising, then
/// [`start_discovery`](ParleyNode::start_discovery) to find peers.
pub struct ParleyNode {
    ctx: EngineContext,
    hub: Arc<EventHub>,
    advertiser: Advertiser,
    browser: Browser,
    router: MessageRouter,
    /// Namespace chosen by the last `set_identity`.
    namespace: RwLock<Option<ServiceNamespace>>,
    /// Stops the inbound loop.
    shutdown_tx: broadcast::Sender<()>,
}

impl ParleyNode {
    /// Create a node and start its dispatcher and inbound loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: NetworkConfig) -> Self {
        let hub = Arc::new(EventHub::new());
        let (events, _dispatcher) = spawn_dispatcher(hub.clone());
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let ctx = EngineContext::new(config.normalized(), events, conn_tx);

        let router = MessageRouter::new(ctx.clone());
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(run_inbound_loop(
            router.clone(),
            conn_rx,
            shutdown_tx.subscribe(),
        ));

        Self {
            advertiser: Advertiser::new(ctx.clone()),
            browser: Browser::new(ctx.clone()),
            router,
            ctx,
            hub,
            namespace: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Create a node with default config.
    pub fn with_defaults() -> Self {
        Self::new(NetworkConfig::default())
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.ctx.config
    }

    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        self.hub.add_subscriber(subscriber)
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.hub.remove_subscriber(id)
    }

    /// Set our identity and publish it under `service`.
    ///
    /// Returns whether the record is live. Calling it again while
    /// advertising re-publishes under the new identity on the same port.
    pub async fn set_identity(
        &self,
        service: &str,
        name: &str,
        json_data: Option<String>,
    ) -> bool {
        let namespace = ServiceNamespace::new(service);
        let device = Device::new(name, json_data);

        self.ctx.set_local_device(device.clone());
        *self.namespace.write() = Some(namespace.clone());

        match self.advertiser.publish(&namespace, &device).await {
            Ok(addr) => {
                debug!("'{name}' reachable on {addr}");
                true
            }
            Err(e) => {
                warn!("Advertising '{name}' failed: {e}");
                false
            }
        }
    }

    /// Start browsing the namespace set by [`set_identity`](Self::set_identity).
    ///
    /// When already browsing, the current device snapshot is re-emitted.
    pub async fn start_discovery(&self) -> Result<(), NetworkError> {
        let namespace = self.namespace.read().clone().ok_or(NetworkError::NoIdentity)?;
        if !self.browser.start_browsing(&namespace).await? {
            debug!("Already browsing, re-sending device list");
            let registry = self.ctx.registry.lock();
            self.ctx.emit_snapshot(&registry);
        }
        Ok(())
    }

    /// Send a message to each target. See [`MessageRouter::send`].
    pub fn send_message(
        &self,
        text: Option<String>,
        json_data: Option<String>,
        targets: &[Device],
        message_id: &str,
    ) -> Result<usize, NetworkError> {
        self.router.send(text, json_data, targets, message_id)
    }

    pub async fn stop_advertising(&self) -> bool {
        self.advertiser.stop().await
    }

    pub async fn stop_discovery(&self) -> bool {
        self.browser.stop_browsing().await
    }

    /// Withdraw, stop browsing and close every connection.
    ///
    /// The node can be started again afterwards.
    pub async fn stop(&self) {
        self.advertiser.stop().await;
        self.browser.stop_browsing().await;

        let mut registry = self.ctx.registry.lock();
        let known = registry.total_count();
        let closed = registry.close_all();
        if known > 0 {
            self.ctx.emit_snapshot(&registry);
        }
        info!("Node stopped ({closed} connection(s) closed)");
    }

    pub fn local_device(&self) -> Option<Device> {
        self.ctx.local_device()
    }

    /// The current device list, as last reported to subscribers.
    pub fn available_devices(&self) -> Vec<Device> {
        self.ctx.registry.lock().snapshot()
    }

    pub async fn is_advertising(&self) -> bool {
        self.advertiser.is_active().await
    }

    pub async fn is_browsing(&self) -> bool {
        self.browser.is_browsing().await
    }

    /// Address of the TCP listener, while advertising.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.advertiser.local_addr().await
    }

    /// Address discovery records are received on, while browsing.
    pub async fn browse_addr(&self) -> Option<SocketAddr> {
        self.browser.local_addr().await
    }
}

impl Drop for ParleyNode {
    fn drop(&mut self) {
        self.ctx.registry.lock().close_all();
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
