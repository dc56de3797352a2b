//! Message router: outbound delivery and inbound frame handling.
//!
//! Outbound, a message is framed once per target and queued on that
//! target's live connection; targets without one are reported back to
//! subscribers in a single event. Inbound, frames from every connection
//! arrive on one queue; the first frame on an accepted connection tells us
//! who is on the other end.

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::context::EngineContext;
use crate::device::Device;
use crate::error::{ErrorKind, NetworkError};
use crate::events::NetworkEvent;
use crate::message::Message;
use crate::peer::{Identified, PeerKey};
use crate::transport::ConnectionEvent;

#[derive(Clone)]
pub struct MessageRouter {
    ctx: EngineContext,
}

impl MessageRouter {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Send one message to each of `targets`.
    ///
    /// Returns how many were queued. Every target that could not be reached
    /// is reported once in a `MessageCannotBeSentToDevices` event, so the
    /// queued count plus the reported messages always equals
    /// `targets.len()`.
    pub fn send(
        &self,
        body: Option<String>,
        json_data: Option<String>,
        targets: &[Device],
        message_id: &str,
    ) -> Result<usize, NetworkError> {
        let local = self.ctx.local_device().ok_or(NetworkError::NoIdentity)?;

        let registry = self.ctx.registry.lock();
        let mut sent = 0;
        let mut unreachable = Vec::new();

        for target in targets {
            let message = Message::new(
                body.clone(),
                json_data.clone(),
                message_id,
                local.clone(),
                target.clone(),
            );
            let delivered = registry
                .find(&target.name)
                .and_then(|entry| entry.live_connection())
                .map(|conn| conn.send(&message));

            match delivered {
                Some(Ok(())) => {
                    trace!("Queued {message_id} for '{}'", target.name);
                    sent += 1;
                }
                Some(Err(e)) => {
                    debug!("Queue for '{}' rejected {message_id}: {e}", target.name);
                    unreachable.push(message);
                }
                None => unreachable.push(message),
            }
        }

        if !unreachable.is_empty() {
            warn!(
                "{} of {} target(s) unreachable for {message_id}",
                unreachable.len(),
                targets.len()
            );
            self.ctx.events.emit(NetworkEvent::MessageCannotBeSentToDevices {
                messages: unreachable,
                error: ErrorKind::DeviceNotFound,
            });
        }
        Ok(sent)
    }

    /// Apply one event from a connection's reader.
    pub fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame {
                connection,
                message,
            } => {
                let mut registry = self.ctx.registry.lock();
                if registry.identify_inbound(connection, &message.sending_device)
                    == Identified::Attached
                {
                    info!(
                        "Accepted connection {connection} is '{}'",
                        message.sending_device.name
                    );
                    self.ctx.emit_snapshot(&registry);
                }

                if message.is_control() {
                    trace!("{connection}: control frame {:?}", message.message);
                    return;
                }
                debug!(
                    "Received {} from '{}'",
                    message.message_id, message.sending_device.name
                );
                self.ctx.events.emit(NetworkEvent::MessageReceived { message });
            }
            ConnectionEvent::Closed { connection } => {
                let mut registry = self.ctx.registry.lock();
                let Some(entry) = registry.remove(PeerKey::Connection(connection)) else {
                    return;
                };
                let name = entry.device.name.clone();
                if registry.promote_inbound(entry) {
                    debug!("'{name}' lost {connection}, still reachable on its inbound link");
                    return;
                }
                info!("'{name}' disconnected");
                self.ctx.emit_snapshot(&registry);
            }
        }
    }
}

/// Drain connection events until shutdown.
pub async fn run_inbound_loop(
    router: MessageRouter,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                router.handle_connection_event(event);
            }
        }
    }
    debug!("Inbound loop shutting down");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
