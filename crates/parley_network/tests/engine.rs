//! Loopback tests running whole engines against each other, or against a
//! hand-driven peer speaking the raw wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_network::discovery::Announcement;
use parley_network::{
    Device, ErrorKind, Message, NetworkConfig, NetworkEvent, ParleyNode, ServiceNamespace,
    Subscriber,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Turns every callback back into an event and forwards it.
struct Recorder(mpsc::UnboundedSender<NetworkEvent>);

impl Subscriber for Recorder {
    fn on_service_started(&self, namespace: &str, instance_name: &str) {
        let _ = self.0.send(NetworkEvent::ServiceStarted {
            namespace: namespace.into(),
            name: instance_name.into(),
        });
    }

    fn on_service_stopped(&self, namespace: &str, instance_name: &str) {
        let _ = self.0.send(NetworkEvent::ServiceStopped {
            namespace: namespace.into(),
            name: instance_name.into(),
        });
    }

    fn on_available_devices(&self, devices: &[Device]) {
        let _ = self.0.send(NetworkEvent::AvailableDevices {
            devices: devices.to_vec(),
        });
    }

    fn on_message_received(&self, message: &Message) {
        let _ = self.0.send(NetworkEvent::MessageReceived {
            message: message.clone(),
        });
    }

    fn on_message_cannot_be_sent_to_devices(&self, messages: &[Message], error: ErrorKind) {
        let _ = self.0.send(NetworkEvent::MessageCannotBeSentToDevices {
            messages: messages.to_vec(),
            error,
        });
    }
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A node browsing on `discovery_port` and announcing to `announce_to`.
fn node(discovery_port: u16, announce_to: SocketAddr) -> (ParleyNode, mpsc::UnboundedReceiver<NetworkEvent>) {
    let config = NetworkConfig {
        listen_addr: loopback(0),
        discovery_port,
        announce_addrs: vec![announce_to],
        announce_interval: Duration::from_millis(200),
        resolve_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..NetworkConfig::default()
    };
    let node = ParleyNode::new(config);
    let (tx, rx) = mpsc::unbounded_channel();
    node.add_subscriber(Arc::new(Recorder(tx)));
    (node, rx)
}

/// Wait for the first event matching `pred`, skipping the others.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    pred: impl Fn(&NetworkEvent) -> bool,
) -> NetworkEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn lists(event: &NetworkEvent, name: &str) -> bool {
    matches!(event, NetworkEvent::AvailableDevices { devices } if devices.iter().any(|d| d.name == name))
}

async fn read_message(lines: &mut BufReader<OwnedReadHalf>) -> Message {
    let mut line = String::new();
    tokio::time::timeout(WAIT, lines.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    Message::from_slice(line.trim_end_matches("\r\n").as_bytes()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_engines_discover_and_exchange_messages() {
    let alice_port = free_udp_port();
    let bob_port = free_udp_port();
    let (alice, mut alice_events) = node(alice_port, loopback(bob_port));
    let (bob, mut bob_events) = node(bob_port, loopback(alice_port));

    assert!(alice.set_identity("chat", "alice", None).await);
    assert_eq!(
        wait_for(&mut alice_events, |e| matches!(e, NetworkEvent::ServiceStarted { .. })).await,
        NetworkEvent::ServiceStarted {
            namespace: "chat".into(),
            name: "alice".into()
        }
    );
    assert!(bob.set_identity("chat", "bob", Some("{\"avatar\":1}".into())).await);

    alice.start_discovery().await.unwrap();
    bob.start_discovery().await.unwrap();

    wait_for(&mut alice_events, |e| lists(e, "bob")).await;
    wait_for(&mut bob_events, |e| lists(e, "alice")).await;
    assert_eq!(
        alice
            .available_devices()
            .iter()
            .filter(|d| d.name == "bob")
            .count(),
        1
    );

    // m1 reaches bob.
    let sent = alice
        .send_message(Some("hi".into()), None, &[Device::named("bob")], "m1")
        .unwrap();
    assert_eq!(sent, 1);
    let NetworkEvent::MessageReceived { message } = wait_for(&mut bob_events, |e| {
        matches!(e, NetworkEvent::MessageReceived { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(message.message.as_deref(), Some("hi"));
    assert_eq!(message.message_id, "m1");
    assert_eq!(message.sending_device.name, "alice");
    assert_eq!(message.receiving_device.name, "bob");

    // m2 to an unknown device is reported, nothing is sent.
    let sent = alice
        .send_message(Some("hi".into()), None, &[Device::named("carol")], "m2")
        .unwrap();
    assert_eq!(sent, 0);
    let NetworkEvent::MessageCannotBeSentToDevices { messages, error } =
        wait_for(&mut alice_events, |e| {
            matches!(e, NetworkEvent::MessageCannotBeSentToDevices { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(error, ErrorKind::DeviceNotFound);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_id, "m2");

    // Bob leaving shows up as a snapshot without him.
    bob.stop().await;
    wait_for(&mut alice_events, |e| {
        matches!(e, NetworkEvent::AvailableDevices { .. }) && !lists(e, "bob")
    })
    .await;

    alice.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mixed_targets_count_every_device_once() {
    let alice_port = free_udp_port();
    let bob_port = free_udp_port();
    let (alice, mut alice_events) = node(alice_port, loopback(bob_port));
    let (bob, _bob_events) = node(bob_port, loopback(alice_port));

    alice.set_identity("chat", "alice", None).await;
    bob.set_identity("chat", "bob", None).await;
    alice.start_discovery().await.unwrap();
    bob.start_discovery().await.unwrap();
    wait_for(&mut alice_events, |e| lists(e, "bob")).await;

    let targets = [
        Device::named("bob"),
        Device::named("carol"),
        Device::named("dave"),
    ];
    let sent = alice
        .send_message(Some("hello".into()), None, &targets, "m3")
        .unwrap();
    let NetworkEvent::MessageCannotBeSentToDevices { messages, .. } =
        wait_for(&mut alice_events, |e| {
            matches!(e, NetworkEvent::MessageCannotBeSentToDevices { .. })
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(sent, 1);
    assert_eq!(sent + messages.len(), targets.len());

    alice.stop().await;
    bob.stop().await;
}

/// Alice runs a real engine; bob is a bare socket speaking the protocol.
#[tokio::test]
async fn test_engine_against_raw_peer() {
    let records = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alice_port = free_udp_port();
    let (alice, mut events) = node(alice_port, records.local_addr().unwrap());
    alice.set_identity("chat", "alice", None).await;
    alice.start_discovery().await.unwrap();

    let bob = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let record = Announcement::new(
        &ServiceNamespace::new("chat"),
        "bob",
        bob.local_addr().unwrap().port(),
        None,
    );
    let announcer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    announcer
        .send_to(&record.to_bytes().unwrap(), loopback(alice_port))
        .await
        .unwrap();

    let (stream, _) = tokio::time::timeout(WAIT, bob.accept()).await.unwrap().unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half);

    // Alice introduces herself first.
    let intro = read_message(&mut lines).await;
    assert!(intro.is_ping_check());
    assert_eq!(intro.sending_device.name, "alice");

    wait_for(&mut events, |e| lists(e, "bob")).await;
    assert_eq!(
        alice
            .send_message(Some("hi".into()), None, &[Device::named("bob")], "m1")
            .unwrap(),
        1
    );
    let frame = read_message(&mut lines).await;
    assert_eq!(frame.message_id, "m1");
    assert_eq!(frame.message.as_deref(), Some("hi"));

    // Garbage is skipped; the next frame is acknowledged then delivered.
    write_half.write_all(b"not json\r\n").await.unwrap();
    let from_bob = Message::new(
        Some("yo".into()),
        None,
        "b1",
        Device::named("bob"),
        Device::named("alice"),
    );
    let mut bytes = serde_json::to_vec(&from_bob).unwrap();
    bytes.extend_from_slice(b"\r\n");
    write_half.write_all(&bytes).await.unwrap();

    let ack = read_message(&mut lines).await;
    assert!(ack.is_ping());
    assert_eq!(ack.message_id, "b1");
    assert_eq!(ack.sending_device.name, "alice");
    assert_eq!(ack.receiving_device.name, "bob");

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, NetworkEvent::MessageReceived { .. })).await,
        NetworkEvent::MessageReceived { message: from_bob }
    );

    alice.stop().await;
}
