//! Advertiser: makes this process discoverable and accepts peers.
//!
//! Publishing binds a TCP listener and starts two background tasks:
//! an accept loop that hands every inbound stream to the peer registry,
//! and an announce loop that re-sends our discovery record at the
//! configured interval. The record lives in a `watch` channel so a new
//! identity can be announced without re-binding.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::MIN_ANNOUNCE_INTERVAL;
use crate::context::EngineContext;
use crate::device::{Device, ServiceNamespace};
use crate::discovery::{self, Announcement};
use crate::error::{ErrorKind, NetworkError};
use crate::events::NetworkEvent;
use crate::transport::{Direction, spawn_connection};

/// A published service and the handles that control its tasks.
struct ActiveService {
    namespace: ServiceNamespace,
    record: watch::Sender<Announcement>,
    shutdown: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

pub struct Advertiser {
    ctx: EngineContext,
    active: Mutex<Option<ActiveService>>,
}

impl Advertiser {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            active: Mutex::new(None),
        }
    }

    /// Whether a record is currently published.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// The address of the TCP listener, while published.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.active.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// Publish `device` under `namespace`.
    ///
    /// When already published, the record is updated in place and the
    /// listener is kept. Otherwise the listener is bound and the first
    /// record is sent; `ServiceStarted` follows on success, `ServiceFailed`
    /// on any failure, after which nothing is left running.
    pub async fn publish(
        &self,
        namespace: &ServiceNamespace,
        device: &Device,
    ) -> Result<SocketAddr, NetworkError> {
        let mut active = self.active.lock().await;

        if let Some(service) = active.as_mut() {
            let service_type = namespace.service_type();
            service.record.send_modify(|record| {
                record.namespace = service_type;
                record.instance_name = device.name.clone();
            });
            service.namespace = namespace.clone();
            info!(
                "Updated published identity to '{}' in '{}'",
                device.name,
                namespace.service_type()
            );
            return Ok(service.local_addr);
        }

        let (listener, socket, record) = match self.bind(namespace, device).await {
            Ok(bound) => bound,
            Err(e) => {
                error!(
                    "Failed to publish '{}' in '{}': {e}",
                    device.name,
                    namespace.service_type()
                );
                self.ctx.events.emit(NetworkEvent::ServiceFailed {
                    namespace: namespace.name().to_string(),
                    name: device.name.clone(),
                    error: ErrorKind::ServiceFailed,
                });
                return Err(NetworkError::ServiceFailed(e.to_string()));
            }
        };

        let local_addr = listener.local_addr()?;
        let (record_tx, record_rx) = watch::channel(record);
        let (shutdown_tx, _) = broadcast::channel(4);

        tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(announce_loop(
            socket,
            record_rx,
            self.ctx.config.announce_targets(),
            self.ctx.config.announce_interval,
            shutdown_tx.subscribe(),
        ));

        *active = Some(ActiveService {
            namespace: namespace.clone(),
            record: record_tx,
            shutdown: shutdown_tx,
            local_addr,
        });

        info!(
            "Published '{}' in '{}' on {local_addr}",
            device.name,
            namespace.service_type()
        );
        self.ctx.events.emit(NetworkEvent::ServiceStarted {
            namespace: namespace.name().to_string(),
            name: device.name.clone(),
        });
        Ok(local_addr)
    }

    /// Withdraw the record and close the listener. Returns `false` when
    /// nothing was published.
    pub async fn stop(&self) -> bool {
        let Some(service) = self.active.lock().await.take() else {
            return false;
        };

        let _ = service.shutdown.send(());
        let name = service.record.borrow().instance_name.clone();
        info!(
            "Withdrew '{name}' from '{}'",
            service.namespace.service_type()
        );
        self.ctx.events.emit(NetworkEvent::ServiceStopped {
            namespace: service.namespace.name().to_string(),
            name,
        });
        true
    }

    /// Bind the listener and announcer, then confirm the record is out.
    async fn bind(
        &self,
        namespace: &ServiceNamespace,
        device: &Device,
    ) -> Result<(TcpListener, UdpSocket, Announcement), NetworkError> {
        let listener = TcpListener::bind(self.ctx.config.listen_addr)
            .await
            .map_err(|e| NetworkError::ServiceFailed(format!("Bind failed: {e}")))?;
        let port = listener.local_addr()?.port();

        let socket = discovery::bind_announcer().await?;
        let record = Announcement::new(
            namespace,
            device.name.clone(),
            port,
            self.ctx.config.advertise_host.clone(),
        );
        discovery::send_announcement(&socket, &record, &self.ctx.config.announce_targets())
            .await?;

        Ok((listener, socket, record))
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: EngineContext,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        match spawn_connection(
                            stream,
                            Direction::Inbound,
                            ctx.connection_events.clone(),
                            ctx.config.max_frame_len,
                        ) {
                            Ok(conn) => {
                                debug!("Accepted {} from {peer_addr}", conn.id());
                                ctx.registry.lock().adopt_inbound(conn);
                            }
                            Err(e) => warn!("Could not start connection from {peer_addr}: {e}"),
                        }
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
        }
    }
}

async fn announce_loop(
    socket: UdpSocket,
    mut record_rx: watch::Receiver<Announcement>,
    targets: Vec<SocketAddr>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut current = record_rx.borrow_and_update().clone();
    let mut ticker = tokio::time::interval(interval.max(MIN_ANNOUNCE_INTERVAL));
    // The first tick fires immediately; publish already sent that record.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                if let Err(e) = discovery::send_announcement(&socket, &current.withdrawal(), &targets).await {
                    debug!("Withdrawal announce failed: {e}");
                }
                debug!("Announce loop shutting down");
                break;
            }
            changed = record_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = record_rx.borrow_and_update().clone();
                if next != current {
                    let _ = discovery::send_announcement(&socket, &current.withdrawal(), &targets).await;
                    current = next;
                    if let Err(e) = discovery::send_announcement(&socket, &current, &targets).await {
                        warn!("Announce of '{}' failed: {e}", current.instance_name);
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = discovery::send_announcement(&socket, &current, &targets).await {
                    debug!("Periodic announce failed: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
