//! Parley Network: serverless peer-to-peer messaging on the local network.
//!
//! Every process publishes itself under a service namespace, browses the
//! same namespace for other devices, and keeps one TCP connection per
//! discovered peer. Messages are JSON objects framed by `\r\n`.
//!
//! # Architecture
//!
//! - **Advertiser**: TCP listener plus a periodic UDP discovery record.
//! - **Browser**: listens for records, resolves them and dials each peer.
//! - **Transport**: framed connections with a reader and a writer task;
//!   every inbound frame is acknowledged with `PING`.
//! - **Registry**: one entry per device name, the single source of truth.
//! - **Router / Event hub**: sends to devices, fans events out to
//!   subscribers on a single dispatcher task.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parley_network::{Device, Message, ParleyNode, Subscriber};
//!
//! struct Printer;
//!
//! impl Subscriber for Printer {
//!     fn on_available_devices(&self, devices: &[Device]) {
//!         println!("{} device(s) nearby", devices.len());
//!     }
//!     fn on_message_received(&self, message: &Message) {
//!         println!("{:?}", message.message);
//!     }
//! }
//!
//! # async fn example() {
//! let node = ParleyNode::with_defaults();
//! node.add_subscriber(Arc::new(Printer));
//! node.set_identity("chat", "alice", None).await;
//! node.start_discovery().await.unwrap();
//! // ...
//! node.stop().await;
//! # }
//! ```

pub mod advertiser;
pub mod browser;
pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod framing;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use device::{Device, ServiceNamespace};
pub use error::{ErrorKind, NetworkError};
pub use events::{NetworkEvent, Subscriber, SubscriberId};
pub use message::Message;
pub use node::ParleyNode;
pub use peer::{PeerRegistry, PeerState};
