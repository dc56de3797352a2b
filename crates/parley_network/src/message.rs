//! Message protocol: the JSON object carried in every frame.

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Body of the liveness acknowledgment.
pub const PING: &str = "PING";

/// Body of the introduction a connecting side sends; acknowledged like any
/// other frame but never delivered to subscribers.
pub const PING_CHECK: &str = "PING CHECK";

/// A message between two devices.
///
/// Field names match the wire format exactly; absent optionals are written
/// as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: Option<String>,
    #[serde(rename = "jsonData")]
    pub json_data: Option<String>,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "receivingDevice")]
    pub receiving_device: Device,
    #[serde(rename = "sendingDevice")]
    pub sending_device: Device,
}

impl Message {
    pub fn new(
        message: Option<String>,
        json_data: Option<String>,
        message_id: impl Into<String>,
        sending_device: Device,
        receiving_device: Device,
    ) -> Self {
        Self {
            message,
            json_data,
            message_id: message_id.into(),
            receiving_device,
            sending_device,
        }
    }

    /// The introduction frame sent right after an outbound connect.
    pub fn ping_check(from: Device, to: Device) -> Self {
        let id = from.name.clone();
        Self::new(Some(PING_CHECK.to_string()), None, id, from, to)
    }

    /// The acknowledgment for this message: same id, devices swapped.
    pub fn ping_reply(&self) -> Self {
        Self::new(
            Some(PING.to_string()),
            None,
            self.message_id.clone(),
            self.receiving_device.clone(),
            self.sending_device.clone(),
        )
    }

    pub fn is_ping(&self) -> bool {
        self.message.as_deref() == Some(PING)
    }

    pub fn is_ping_check(&self) -> bool {
        self.message.as_deref() == Some(PING_CHECK)
    }

    /// Control frames are handled by the transport and never surfaced.
    pub fn is_control(&self) -> bool {
        self.is_ping() || self.is_ping_check()
    }

    /// Serialize the message to a JSON string for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize a message from raw frame bytes (delimiter excluded).
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            Some("hi".into()),
            Some("{\"n\":1}".into()),
            "m1",
            Device::named("alice"),
            Device::named("bob"),
        )
    }

    #[test]
    fn test_wire_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["message"], "hi");
        assert_eq!(value["messageID"], "m1");
        assert_eq!(value["sendingDevice"]["name"], "alice");
        assert_eq!(value["receivingDevice"]["name"], "bob");
        assert_eq!(value["jsonData"], "{\"n\":1}");
    }

    #[test]
    fn test_roundtrip_preserves_all_fields() {
        let original = sample();
        let json = original.to_json().unwrap();
        let decoded = Message::from_slice(json.as_bytes()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_null_body_roundtrip() {
        let original = Message::new(None, None, "x", Device::named("a"), Device::named("b"));
        let json = original.to_json().unwrap();
        assert!(json.contains("\"message\":null"));
        assert_eq!(Message::from_slice(json.as_bytes()).unwrap(), original);
    }

    #[test]
    fn test_ping_reply_swaps_devices() {
        let original = sample();
        let reply = original.ping_reply();
        assert!(reply.is_ping());
        assert_eq!(reply.message_id, "m1");
        assert_eq!(reply.sending_device.name, "bob");
        assert_eq!(reply.receiving_device.name, "alice");
        assert!(reply.json_data.is_none());
    }

    #[test]
    fn test_control_detection() {
        assert!(!sample().is_control());
        let check = Message::ping_check(Device::named("alice"), Device::named("bob"));
        assert!(check.is_ping_check());
        assert!(check.is_control());
        assert_eq!(check.message_id, "alice");
    }

    #[test]
    fn test_embedded_newlines_are_escaped() {
        let msg = Message::new(
            Some("line one\r\nline two".into()),
            None,
            "m",
            Device::named("a"),
            Device::named("b"),
        );
        let json = msg.to_json().unwrap();
        assert!(!json.contains("\r\n"));
    }

    #[test]
    fn test_from_slice_rejects_garbage() {
        assert!(Message::from_slice(b"{\"message\":").is_err());
        assert!(Message::from_slice(b"{\"message\":\"hi\"}").is_err());
    }
}
