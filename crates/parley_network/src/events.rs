//! Event hub: fan-out of engine events to subscribers.
//!
//! Components publish [`NetworkEvent`]s through an [`EventSender`]. A single
//! dispatcher task drains the queue in order and hands each event to every
//! registered [`Subscriber`] exactly once, so subscriber callbacks never run
//! concurrently with one another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::device::Device;
use crate::error::ErrorKind;
use crate::message::Message;

/// Receives engine events.
///
/// Only device snapshots and received messages must be handled; every other
/// callback defaults to a debug log line.
pub trait Subscriber: Send + Sync {
    fn on_service_started(&self, namespace: &str, instance_name: &str) {
        debug!("Service started: namespace '{namespace}' name '{instance_name}'");
    }

    fn on_service_stopped(&self, namespace: &str, instance_name: &str) {
        debug!("Service stopped: namespace '{namespace}' name '{instance_name}'");
    }

    fn on_service_failed(&self, namespace: &str, instance_name: &str, error: ErrorKind) {
        debug!("Service failed: namespace '{namespace}' name '{instance_name}': {error}");
    }

    fn on_resolve_error(&self, namespace: &str, instance_name: &str, error: ErrorKind) {
        debug!("Resolve failed: namespace '{namespace}' name '{instance_name}': {error}");
    }

    /// The current de-duplicated device list.
    fn on_available_devices(&self, devices: &[Device]);

    fn on_message_received(&self, message: &Message);

    fn on_message_cannot_be_sent_to_devices(&self, messages: &[Message], error: ErrorKind) {
        debug!("{} message(s) could not be sent: {error}", messages.len());
    }
}

/// Everything the engine reports to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ServiceStarted {
        namespace: String,
        name: String,
    },
    ServiceStopped {
        namespace: String,
        name: String,
    },
    ServiceFailed {
        namespace: String,
        name: String,
        error: ErrorKind,
    },
    ResolveError {
        namespace: String,
        name: String,
        error: ErrorKind,
    },
    AvailableDevices {
        devices: Vec<Device>,
    },
    MessageReceived {
        message: Message,
    },
    MessageCannotBeSentToDevices {
        messages: Vec<Message>,
        error: ErrorKind,
    },
}

impl NetworkEvent {
    /// Invoke the matching subscriber callback.
    pub fn deliver_to(&self, subscriber: &dyn Subscriber) {
        match self {
            Self::ServiceStarted { namespace, name } => {
                subscriber.on_service_started(namespace, name)
            }
            Self::ServiceStopped { namespace, name } => {
                subscriber.on_service_stopped(namespace, name)
            }
            Self::ServiceFailed {
                namespace,
                name,
                error,
            } => subscriber.on_service_failed(namespace, name, *error),
            Self::ResolveError {
                namespace,
                name,
                error,
            } => subscriber.on_resolve_error(namespace, name, *error),
            Self::AvailableDevices { devices } => subscriber.on_available_devices(devices),
            Self::MessageReceived { message } => subscriber.on_message_received(message),
            Self::MessageCannotBeSentToDevices { messages, error } => {
                subscriber.on_message_cannot_be_sent_to_devices(messages, *error)
            }
        }
    }
}

/// Handle returned by [`EventHub::add_subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

/// Ordered set of subscribers.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<BTreeMap<SubscriberId, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Delivery order follows registration order.
    pub fn add_subscriber(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().insert(id, subscriber);
        id
    }

    /// Unregister a subscriber. Returns `false` if it was not registered.
    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver one event to every subscriber registered right now.
    ///
    /// The list is copied before delivery, so subscribers added or removed
    /// by a callback only affect later events. Returns the number of
    /// subscribers the event was delivered to.
    pub fn fan_out(&self, event: &NetworkEvent) -> usize {
        let targets: Vec<Arc<dyn Subscriber>> = self.subscribers.lock().values().cloned().collect();
        for subscriber in &targets {
            event.deliver_to(subscriber.as_ref());
        }
        targets.len()
    }
}

/// Cloneable publishing handle used by every engine component.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

impl EventSender {
    /// Queue an event for delivery. Events are dropped once the dispatcher
    /// has stopped.
    pub fn emit(&self, event: NetworkEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dispatcher gone, dropping event");
        }
    }
}

/// An event queue without a dispatcher, for inspecting emitted events.
#[cfg(test)]
pub(crate) fn test_sender() -> (EventSender, mpsc::UnboundedReceiver<NetworkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Create the event queue and spawn the dispatcher task that drains it.
pub fn spawn_dispatcher(hub: Arc<EventHub>) -> (EventSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let delivered = hub.fan_out(&event);
            trace!("Delivered {event:?} to {delivered} subscriber(s)");
        }
        debug!("Event dispatcher shutting down");
    });
    (EventSender { tx }, handle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
