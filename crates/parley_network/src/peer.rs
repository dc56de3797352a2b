//! Peer registry: the single source of truth for known devices.
//!
//! Maps a device name to its resolved address, its active connection and
//! its presence state. The registry also holds inbound connections that
//! have not identified themselves yet, and the epoch of the current browse
//! session so stale resolve/connect results can be discarded.
//!
//! The registry is plain data; the engine wraps it in a single mutex.

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::transport::{Connection, ConnectionId};

/// Presence state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Found via discovery, nothing in flight.
    Discovered,
    /// Address resolution in progress.
    Resolving,
    /// TCP connect in progress.
    Connecting,
    /// A live connection is attached.
    Connected,
    /// Was connected; about to be removed.
    Disconnected,
}

/// Tracked state for one remote device.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub device: Device,
    pub address: Option<SocketAddr>,
    pub connection: Option<Connection>,
    pub state: PeerState,
    /// Last time a discovery record or connection vouched for the device.
    pub last_seen: DateTime<Utc>,
    seq: u64,
}

impl PeerEntry {
    /// The attached connection, if its writer is still running.
    pub fn live_connection(&self) -> Option<&Connection> {
        self.connection.as_ref().filter(|c| c.is_open())
    }
}

/// Selects an entry for removal.
#[derive(Debug, Clone, Copy)]
pub enum PeerKey<'a> {
    Device(&'a str),
    Connection(ConnectionId),
}

/// An accepted connection whose peer may not be known yet.
#[derive(Debug, Clone)]
struct InboundLink {
    connection: Connection,
    device: Option<Device>,
}

/// Result of identifying an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identified {
    /// The connection was not tracked as inbound (or already identified).
    NotInbound,
    /// Identity recorded; the entry already had a live connection.
    Recorded,
    /// The connection became the entry's active connection.
    Attached,
}

/// Registry of all known peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
    inbound: HashMap<ConnectionId, InboundLink>,
    next_seq: u64,
    browse_epoch: u64,
    browsing: bool,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device or refresh the existing entry with the same name.
    ///
    /// A repeated upsert never creates a second entry. An `address` of
    /// `None` keeps whatever address is already known.
    pub fn upsert(&mut self, device: Device, address: Option<SocketAddr>) -> &PeerEntry {
        let now = Utc::now();
        let seq = self.next_seq;
        let entry = self
            .peers
            .entry(device.name.clone())
            .and_modify(|entry| {
                entry.last_seen = now;
                if address.is_some() {
                    entry.address = address;
                }
                if device.json_data.is_some() {
                    entry.device = device.clone();
                }
            })
            .or_insert_with(|| PeerEntry {
                device,
                address,
                connection: None,
                state: PeerState::Discovered,
                last_seen: now,
                seq,
            });
        if entry.seq == seq {
            self.next_seq += 1;
        }
        entry
    }

    /// Install a connection for a device and mark it connected.
    ///
    /// Returns `false`, leaving the entry untouched, when the device is
    /// unknown or already has a live connection.
    pub fn attach_connection(&mut self, name: &str, connection: Connection) -> bool {
        let Some(entry) = self.peers.get_mut(name) else {
            return false;
        };
        if entry.live_connection().is_some() {
            return false;
        }
        if entry.address.is_none() {
            entry.address = Some(connection.remote_addr());
        }
        entry.connection = Some(connection);
        entry.state = PeerState::Connected;
        entry.last_seen = Utc::now();
        true
    }

    /// Look up a device by name.
    pub fn find(&self, name: &str) -> Option<&PeerEntry> {
        self.peers.get(name)
    }

    /// Update the state of a known device.
    pub fn set_state(&mut self, name: &str, state: PeerState) {
        if let Some(entry) = self.peers.get_mut(name) {
            entry.state = state;
        }
    }

    /// Return an entry with an abandoned resolve or connect to `Discovered`,
    /// making it eligible for the next discovery pass.
    pub fn reset_pending(&mut self, name: &str) {
        if let Some(entry) = self.peers.get_mut(name) {
            if matches!(entry.state, PeerState::Resolving | PeerState::Connecting) {
                entry.state = PeerState::Discovered;
            }
        }
    }

    /// Record that a discovered device's address is known.
    pub fn set_address(&mut self, name: &str, address: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(name) {
            entry.address = Some(address);
        }
    }

    /// Remove an entry by device name or by its attached connection.
    ///
    /// Removing by connection also forgets a matching inbound link.
    pub fn remove(&mut self, key: PeerKey<'_>) -> Option<PeerEntry> {
        match key {
            PeerKey::Device(name) => self.peers.remove(name),
            PeerKey::Connection(id) => {
                self.inbound.remove(&id);
                let name = self
                    .peers
                    .iter()
                    .find(|(_, e)| e.connection.as_ref().is_some_and(|c| c.id() == id))
                    .map(|(name, _)| name.clone())?;
                self.peers.remove(&name).map(|mut entry| {
                    entry.state = PeerState::Disconnected;
                    entry
                })
            }
        }
    }

    /// Re-home an entry whose active connection closed onto another open
    /// inbound link from the same device.
    ///
    /// `entry` is what [`remove`](Self::remove) returned. Returns `false`,
    /// leaving the entry gone, when no such link exists.
    pub fn promote_inbound(&mut self, mut entry: PeerEntry) -> bool {
        let name = entry.device.name.as_str();
        let Some(id) = self
            .inbound
            .iter()
            .find(|(_, link)| {
                link.connection.is_open()
                    && link.device.as_ref().is_some_and(|d| d.name == name)
            })
            .map(|(id, _)| *id)
        else {
            return false;
        };
        let Some(link) = self.inbound.remove(&id) else {
            return false;
        };

        entry.address = Some(link.connection.remote_addr());
        entry.connection = Some(link.connection);
        entry.state = PeerState::Connected;
        entry.last_seen = Utc::now();
        self.peers.insert(entry.device.name.clone(), entry);
        true
    }

    /// Drop `Discovered` entries that nothing has vouched for since
    /// `cutoff`. Returns the removed names.
    pub fn expire_discovered(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, e)| e.state == PeerState::Discovered && e.last_seen < cutoff)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.peers.remove(name);
        }
        stale
    }

    /// Current devices, one per name, in discovery order.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut entries: Vec<&PeerEntry> = self
            .peers
            .values()
            .filter(|e| e.state != PeerState::Disconnected)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.device.clone()).collect()
    }

    /// Return the number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Return the total number of known peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    // -- Inbound connections ------------------------------------------------

    /// Track a freshly accepted connection whose peer is not known yet.
    pub fn adopt_inbound(&mut self, connection: Connection) {
        self.inbound.insert(
            connection.id(),
            InboundLink {
                connection,
                device: None,
            },
        );
    }

    /// Number of accepted connections tracked outside any entry.
    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    /// Learn the identity behind an inbound connection from its first frame.
    ///
    /// If the device has no entry, or an entry without a live connection,
    /// the inbound connection is attached to it.
    pub fn identify_inbound(&mut self, id: ConnectionId, device: &Device) -> Identified {
        let Some(link) = self.inbound.get_mut(&id) else {
            return Identified::NotInbound;
        };
        if link.device.is_some() {
            return Identified::NotInbound;
        }
        link.device = Some(device.clone());
        let connection = link.connection.clone();

        let has_live = self
            .peers
            .get(&device.name)
            .is_some_and(|e| e.live_connection().is_some());
        if has_live {
            return Identified::Recorded;
        }

        self.upsert(device.clone(), Some(connection.remote_addr()));
        if self.attach_connection(&device.name, connection) {
            self.inbound.remove(&id);
            Identified::Attached
        } else {
            Identified::Recorded
        }
    }

    // -- Browse session -------------------------------------------------------

    /// Start a new browse session and return its epoch.
    pub fn begin_browse(&mut self) -> u64 {
        self.browse_epoch += 1;
        self.browsing = true;
        self.browse_epoch
    }

    /// Whether results tagged with `epoch` may still be applied.
    pub fn is_current_browse(&self, epoch: u64) -> bool {
        self.browsing && self.browse_epoch == epoch
    }

    /// End the browse session and drop every entry that is not connected.
    ///
    /// Returns `true` if the snapshot changed.
    pub fn end_browse(&mut self) -> bool {
        self.browsing = false;
        let before = self.peers.len();
        self.peers.retain(|_, e| e.state == PeerState::Connected);
        before != self.peers.len()
    }

    /// Drop a device whose record was withdrawn, unless it is connected.
    ///
    /// Returns `true` if an entry was removed.
    pub fn forget_unconnected(&mut self, name: &str) -> bool {
        match self.peers.get(name) {
            Some(entry) if entry.state != PeerState::Connected => {
                self.peers.remove(name);
                true
            }
            _ => false,
        }
    }

    /// Close and forget every connection, returning how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for link in self.inbound.drain().map(|(_, link)| link) {
            link.connection.close();
            closed += 1;
        }
        for entry in self.peers.values() {
            if let Some(conn) = &entry.connection {
                conn.close();
                closed += 1;
            }
        }
        self.peers.clear();
        closed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
