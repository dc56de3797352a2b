//! TCP transport: one framed, bidirectional connection per peer.
//!
//! Every stream (accepted or dialed) is split into a reader task and a
//! writer task. The [`Connection`] handle only holds the writer's queue and
//! a shutdown signal, so sending never blocks and the handle can be cloned
//! freely into the peer registry.
//!
//! The reader answers every non-PING frame with a PING acknowledgment before
//! forwarding it to the engine as a [`ConnectionEvent`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::error::NetworkError;
use crate::framing::{FrameDecoder, encode_frame};
use crate::message::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our advertiser.
    Inbound,
    /// Dialed by our browser after resolving a peer.
    Outbound,
}

/// An event from a connection's reader task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A decoded, non-PING frame. Its acknowledgment is already queued.
    Frame {
        connection: ConnectionId,
        message: Message,
    },
    /// The connection is gone. Sent exactly once per connection.
    Closed { connection: ConnectionId },
}

/// Sender half the engine hands to every connection.
pub type ConnectionEventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// A handle to a live connection with a peer.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: broadcast::Sender<()>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the writer task is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Frame and queue a message.
    pub fn send(&self, message: &Message) -> Result<(), NetworkError> {
        let frame = encode_frame(message)?;
        self.send_frame(frame)
    }

    /// Queue an already-encoded frame.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), NetworkError> {
        self.outbound
            .send(frame)
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Ask both tasks to stop. A `Closed` event follows.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Start the reader and writer tasks for an established stream.
pub fn spawn_connection(
    stream: TcpStream,
    direction: Direction,
    events: ConnectionEventSender,
    max_frame_len: usize,
) -> Result<Connection, NetworkError> {
    let remote_addr = stream.peer_addr()?;
    if let Err(e) = stream.set_nodelay(true) {
        trace!("set_nodelay on {remote_addr} failed: {e}");
    }

    let id = ConnectionId::next();
    let (reader, writer) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel(4);

    let writer_shutdown = shutdown_tx.subscribe();
    let reader_shutdown = shutdown_tx.subscribe();

    tokio::spawn(write_loop(
        id,
        writer,
        outbound_rx,
        shutdown_tx.clone(),
        writer_shutdown,
    ));
    tokio::spawn(read_loop(
        id,
        remote_addr,
        reader,
        outbound_tx.clone(),
        events,
        shutdown_tx.clone(),
        reader_shutdown,
        max_frame_len,
    ));

    debug!("{id} established ({direction:?}) with {remote_addr}");
    Ok(Connection {
        id,
        remote_addr,
        direction,
        outbound: outbound_tx,
        shutdown: shutdown_tx,
    })
}

/// Dial a peer and start its connection tasks.
pub async fn connect(
    addr: SocketAddr,
    timeout: Duration,
    events: ConnectionEventSender,
    max_frame_len: usize,
) -> Result<Connection, NetworkError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))?
        .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;

    spawn_connection(stream, Direction::Outbound, events, max_frame_len)
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("{id} write failed: {e}");
                    break;
                }
                trace!("{id} wrote {} bytes", frame.len());
            }
            _ = shutdown.recv() => break,
        }
    }

    outbound.close();
    let _ = writer.shutdown().await;
    // Wake the reader if we are the side that noticed the failure.
    let _ = shutdown_tx.send(());
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    id: ConnectionId,
    remote_addr: SocketAddr,
    mut reader: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Vec<u8>>,
    events: ConnectionEventSender,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
    max_frame_len: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_len);
    let mut buf = vec![0u8; 4096];

    'read: loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("{id} closed by {remote_addr}");
                        break;
                    }
                    Ok(n) => {
                        decoder.extend(&buf[..n]);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => {
                                    handle_frame(id, remote_addr, &frame, &replies, &events);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("{id} dropping {remote_addr}: {e}");
                                    break 'read;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("{id} read error from {remote_addr}: {e}");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    let _ = shutdown_tx.send(());
    let _ = events.send(ConnectionEvent::Closed { connection: id });
}

fn handle_frame(
    id: ConnectionId,
    remote_addr: SocketAddr,
    frame: &[u8],
    replies: &mpsc::UnboundedSender<Vec<u8>>,
    events: &ConnectionEventSender,
) {
    let message = match Message::from_slice(frame) {
        Ok(message) => message,
        Err(e) => {
            // Malformed input is dropped; the stream stays usable.
            warn!("{id} malformed frame from {remote_addr}: {e}");
            return;
        }
    };

    if message.is_ping() {
        trace!("{id} PING for '{}'", message.message_id);
        return;
    }

    match encode_frame(&message.ping_reply()) {
        Ok(ack) => {
            let _ = replies.send(ack);
        }
        Err(e) => warn!("{id} could not encode PING: {e}"),
    }

    let _ = events.send(ConnectionEvent::Frame {
        connection: id,
        message,
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
