//! Discovery records exchanged over UDP.
//!
//! An advertiser periodically sends its [`Announcement`] to the configured
//! targets (the LAN broadcast address by default). Browsers listen on the
//! discovery port and turn every record in their namespace into a peer.
//! A record with `withdrawn` set tells browsers the service went away.

use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::device::ServiceNamespace;
use crate::error::NetworkError;

/// Largest datagram a browser reads.
pub const MAX_RECORD_LEN: usize = 2048;

/// The advertised tuple peers use to find each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// Wrapped namespace, e.g. `_chat._tcp`.
    pub namespace: String,
    /// The advertised device name.
    pub instance_name: String,
    /// TCP port the advertiser accepts connections on.
    pub port: u16,
    /// Optional host name to resolve instead of the datagram source.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub withdrawn: bool,
}

impl Announcement {
    pub fn new(
        namespace: &ServiceNamespace,
        instance_name: impl Into<String>,
        port: u16,
        host: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.service_type(),
            instance_name: instance_name.into(),
            port,
            host,
            withdrawn: false,
        }
    }

    /// The same record, marked as withdrawn.
    pub fn withdrawal(&self) -> Self {
        Self {
            withdrawn: true,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Bind the socket an advertiser sends records from.
pub async fn bind_announcer() -> Result<UdpSocket, NetworkError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .await
        .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
    Ok(socket)
}

/// Bind the socket a browser receives records on.
pub async fn bind_browser(port: u16) -> Result<UdpSocket, NetworkError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|e| NetworkError::Discovery(format!("Bind {addr} failed: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
    Ok(socket)
}

/// Send a record to every target.
///
/// Succeeds when at least one target accepted the datagram and returns how
/// many did.
pub async fn send_announcement(
    socket: &UdpSocket,
    record: &Announcement,
    targets: &[SocketAddr],
) -> Result<usize, NetworkError> {
    let bytes = record.to_bytes()?;
    let mut delivered = 0;
    let mut last_error = None;

    for target in targets {
        match socket.send_to(&bytes, target).await {
            Ok(_) => {
                trace!("Announced '{}' to {target}", record.instance_name);
                delivered += 1;
            }
            Err(e) => {
                debug!("Announce to {target} failed: {e}");
                last_error = Some(e);
            }
        }
    }

    match (delivered, last_error) {
        (0, Some(e)) => Err(NetworkError::Discovery(format!("Announce failed: {e}"))),
        (0, None) => Err(NetworkError::Discovery("No announce targets".into())),
        (n, _) => Ok(n),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Announcement {
        Announcement::new(&ServiceNamespace::new("chat"), "bob", 5001, None)
    }

    #[test]
    fn test_record_wire_format() {
        let value: serde_json::Value = serde_json::from_slice(&record().to_bytes().unwrap()).unwrap();
        assert_eq!(value["namespace"], "_chat._tcp");
        assert_eq!(value["instanceName"], "bob");
        assert_eq!(value["port"], 5001);
        assert_eq!(value["withdrawn"], false);
    }

    #[test]
    fn test_minimal_record_parses() {
        let parsed = Announcement::from_bytes(
            br#"{"namespace":"_chat._tcp","instanceName":"bob","port":5001}"#,
        )
        .unwrap();
        assert_eq!(parsed, record());
    }

    #[test]
    fn test_withdrawal_keeps_identity() {
        let gone = record().withdrawal();
        assert!(gone.withdrawn);
        assert_eq!(gone.instance_name, "bob");
        assert_eq!(gone.port, 5001);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Announcement::from_bytes(b"hello").is_err());
    }

    #[tokio::test]
    async fn test_send_announcement_loopback() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = bind_announcer().await.unwrap();

        let sent = send_announcement(&sender, &record(), &[target]).await.unwrap();
        assert_eq!(sent, 1);

        let mut buf = vec![0u8; MAX_RECORD_LEN];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(Announcement::from_bytes(&buf[..len]).unwrap(), record());
    }

    #[tokio::test]
    async fn test_send_announcement_without_targets_fails() {
        let sender = bind_announcer().await.unwrap();
        assert!(send_announcement(&sender, &record(), &[]).await.is_err());
    }
}
