//! Resolver/Browser: turns discovery records into live connections.
//!
//! The enumeration task listens on the discovery port. Each record in our
//! namespace upserts a registry entry; entries in `Discovered` state are
//! resolved and dialed on their own task. Everything a task learns is
//! applied under the registry lock, and only if the browse session that
//! started it is still current.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, trace, warn};

use crate::config::MIN_ANNOUNCE_INTERVAL;
use crate::context::EngineContext;
use crate::device::{Device, ServiceNamespace};
use crate::discovery::{self, Announcement, MAX_RECORD_LEN};
use crate::error::NetworkError;
use crate::events::NetworkEvent;
use crate::message::Message;
use crate::peer::PeerState;
use crate::transport::{self, Connection};

/// Announcement periods a discovered peer may stay silent before it is dropped.
const STALE_AFTER_INTERVALS: u32 = 3;

struct BrowseSession {
    namespace: ServiceNamespace,
    shutdown: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

pub struct Browser {
    ctx: EngineContext,
    session: Mutex<Option<BrowseSession>>,
}

impl Browser {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            session: Mutex::new(None),
        }
    }

    pub async fn is_browsing(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// The UDP address records are received on, while browsing.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.session.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// Start enumerating records in `namespace`.
    ///
    /// Returns `Ok(false)` without doing anything when already browsing.
    pub async fn start_browsing(&self, namespace: &ServiceNamespace) -> Result<bool, NetworkError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(false);
        }

        let socket = discovery::bind_browser(self.ctx.config.discovery_port).await?;
        let local_addr = socket.local_addr()?;
        let epoch = self.ctx.registry.lock().begin_browse();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(enumerate(
            self.ctx.clone(),
            namespace.clone(),
            socket,
            epoch,
            shutdown_rx,
        ));

        info!(
            "Browsing for '{}' on {local_addr}",
            namespace.service_type()
        );
        *session = Some(BrowseSession {
            namespace: namespace.clone(),
            shutdown: shutdown_tx,
            local_addr,
        });
        Ok(true)
    }

    /// Stop enumerating and forget every peer that is not connected.
    ///
    /// Resolve and connect attempts still in flight finish on their own;
    /// their results are discarded.
    pub async fn stop_browsing(&self) -> bool {
        let Some(session) = self.session.lock().await.take() else {
            return false;
        };
        let _ = session.shutdown.send(());

        let mut registry = self.ctx.registry.lock();
        if registry.end_browse() {
            self.ctx.emit_snapshot(&registry);
        }
        info!(
            "Stopped browsing for '{}'",
            session.namespace.service_type()
        );
        true
    }
}

async fn enumerate(
    ctx: EngineContext,
    namespace: ServiceNamespace,
    socket: UdpSocket,
    epoch: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = ctx.config.announce_interval.max(MIN_ANNOUNCE_INTERVAL);
    let mut sweep = tokio::time::interval(period);
    let mut buf = vec![0u8; MAX_RECORD_LEN];
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("Browser shutting down");
                break;
            }
            _ = sweep.tick() => expire_stale(&ctx, epoch, period * STALE_AFTER_INTERVALS),
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => match Announcement::from_bytes(&buf[..len]) {
                        Ok(record) => handle_record(&ctx, &namespace, epoch, record, source),
                        Err(e) => trace!("Ignoring datagram from {source}: {e}"),
                    },
                    Err(e) => warn!("Discovery recv error: {e}"),
                }
            }
        }
    }
}

/// Forget discovered peers whose records stopped arriving without a withdrawal.
fn expire_stale(ctx: &EngineContext, epoch: u64, ttl: Duration) {
    let Ok(ttl) = TimeDelta::from_std(ttl) else {
        return;
    };
    let mut registry = ctx.registry.lock();
    if !registry.is_current_browse(epoch) {
        return;
    }
    let expired = registry.expire_discovered(Utc::now() - ttl);
    if !expired.is_empty() {
        debug!("Forgetting silent peer(s) {expired:?}");
        ctx.emit_snapshot(&registry);
    }
}

fn handle_record(
    ctx: &EngineContext,
    namespace: &ServiceNamespace,
    epoch: u64,
    record: Announcement,
    source: SocketAddr,
) {
    if record.namespace != namespace.service_type() {
        return;
    }
    if ctx
        .local_device()
        .is_some_and(|local| local.name == record.instance_name)
    {
        return;
    }

    let name = record.instance_name.clone();
    let mut registry = ctx.registry.lock();
    if !registry.is_current_browse(epoch) {
        return;
    }

    if record.withdrawn {
        if registry.forget_unconnected(&name) {
            debug!("'{name}' withdrew its record");
            ctx.emit_snapshot(&registry);
        }
        return;
    }

    if registry.upsert(Device::named(name.clone()), None).state != PeerState::Discovered {
        return;
    }
    registry.set_state(&name, PeerState::Resolving);
    drop(registry);

    debug!("Discovered '{name}' (announced from {source})");
    tokio::spawn(resolve_and_connect(
        ctx.clone(),
        namespace.clone(),
        epoch,
        record,
        source,
    ));
}

/// Resolve a record to candidate addresses.
///
/// Records naming a host are looked up (bounded by `timeout`); otherwise the
/// datagram's source IP is paired with the advertised port.
pub async fn resolve(
    record: &Announcement,
    source: SocketAddr,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, NetworkError> {
    let unresolved = |reason: String| NetworkError::Resolve {
        name: record.instance_name.clone(),
        reason,
    };

    if record.port == 0 {
        return Err(unresolved("record advertises port 0".into()));
    }

    let addrs: Vec<SocketAddr> = match &record.host {
        Some(host) => tokio::time::timeout(
            timeout,
            tokio::net::lookup_host((host.as_str(), record.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
        .map_err(|e| unresolved(e.to_string()))?
        .collect(),
        None => vec![SocketAddr::new(source.ip(), record.port)],
    };

    if addrs.is_empty() {
        return Err(unresolved("no addresses".into()));
    }
    Ok(addrs)
}

async fn resolve_and_connect(
    ctx: EngineContext,
    namespace: ServiceNamespace,
    epoch: u64,
    record: Announcement,
    source: SocketAddr,
) {
    let name = record.instance_name.clone();

    let target = match resolve(&record, source, ctx.config.resolve_timeout).await {
        Ok(addrs) => addrs[0],
        Err(e) => {
            warn!("Could not resolve '{name}': {e}");
            let mut registry = ctx.registry.lock();
            if registry.is_current_browse(epoch) {
                registry.reset_pending(&name);
                ctx.events.emit(NetworkEvent::ResolveError {
                    namespace: namespace.name().to_string(),
                    name,
                    error: e.kind(),
                });
            }
            return;
        }
    };

    {
        let mut registry = ctx.registry.lock();
        if !registry.is_current_browse(epoch) {
            debug!("Discarding resolution of '{name}' from a stopped browse");
            return;
        }
        let Some(entry) = registry.find(&name) else {
            return;
        };
        if entry.live_connection().is_some() {
            debug!("'{name}' is already connected");
            return;
        }
        registry.set_address(&name, target);
        registry.set_state(&name, PeerState::Connecting);
    }

    let connected = transport::connect(
        target,
        ctx.config.connect_timeout,
        ctx.connection_events.clone(),
        ctx.config.max_frame_len,
    )
    .await;

    let conn = match connected {
        Ok(conn) => conn,
        Err(e) => {
            // Retried when the peer's next record arrives.
            warn!("Failed to connect to '{name}' at {target}: {e}");
            let mut registry = ctx.registry.lock();
            if registry.is_current_browse(epoch) {
                registry.reset_pending(&name);
            }
            return;
        }
    };

    if adopt_outbound(&ctx, epoch, &name, conn) {
        info!("Connected to '{name}' at {target}");
    }
}

/// Attach a freshly dialed connection to `name` and introduce ourselves.
///
/// The connection is closed instead when the browse session that dialed it
/// has ended or the peer is already connected.
fn adopt_outbound(ctx: &EngineContext, epoch: u64, name: &str, conn: Connection) -> bool {
    let local = ctx.local_device();
    let mut registry = ctx.registry.lock();
    if !registry.is_current_browse(epoch) || !registry.attach_connection(name, conn.clone()) {
        debug!("Dropping redundant connection {} to '{name}'", conn.id());
        conn.close();
        return false;
    }

    if let (Some(local), Some(entry)) = (local, registry.find(name)) {
        let intro = Message::ping_check(local, entry.device.clone());
        if let Err(e) = conn.send(&intro) {
            warn!("Could not introduce ourselves to '{name}': {e}");
        }
    }

    ctx.emit_snapshot(&registry);
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
