//! Device identity and service namespaces.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named endpoint on the network.
///
/// `name` is the deduplication key across the whole engine. `json_data` is
/// an opaque application payload carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "jsonData")]
    pub json_data: Option<String>,
}

impl Device {
    pub fn new(name: impl Into<String>, json_data: Option<String>) -> Self {
        Self {
            name: name.into(),
            json_data,
        }
    }

    /// A device known only by name, as learned from a discovery record.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The application-chosen service name all cooperating peers agree on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceNamespace(String);

impl ServiceNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The application service name, e.g. `chat`.
    pub fn name(&self) -> &str {
        &self.0
    }

    /// The namespace string carried in discovery records, e.g. `_chat._tcp`.
    pub fn service_type(&self) -> String {
        format!("_{}._tcp", self.0)
    }
}

impl fmt::Display for ServiceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_wire_field_names() {
        let device = Device::new("alice", Some("{\"color\":\"red\"}".into()));
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["name"], "alice");
        assert_eq!(value["jsonData"], "{\"color\":\"red\"}");
    }

    #[test]
    fn test_device_without_data_serializes_null() {
        let json = serde_json::to_string(&Device::named("bob")).unwrap();
        assert_eq!(json, r#"{"name":"bob","jsonData":null}"#);
    }

    #[test]
    fn test_device_missing_json_data_parses() {
        let device: Device = serde_json::from_str(r#"{"name":"carol"}"#).unwrap();
        assert_eq!(device, Device::named("carol"));
    }

    #[test]
    fn test_service_type_wrapping() {
        let ns = ServiceNamespace::new("chat");
        assert_eq!(ns.name(), "chat");
        assert_eq!(ns.service_type(), "_chat._tcp");
        assert_eq!(ns.to_string(), "chat");
    }
}
