//! Mapping between meter ids and broker topics, plus best-effort payload typing.
//!
//! Topic shapes used by the meter firmware:
//!
//! ```text
//! cmnd/<prefix><hex>/Power      commands we publish (ON / OFF)
//! stat/<prefix><hex>/Power      power echo published by the device
//! <domain>/<prefix><hex>/status device status
//! <domain>/<prefix><hex>/data   device data
//! ```

use crate::models::MeterId;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

pub const COMMAND_ROOT: &str = "cmnd";
pub const STATUS_ROOT: &str = "stat";
pub const POWER_LEAF: &str = "Power";

pub const DEFAULT_DOMAIN: &str = "maaler";
pub const DEFAULT_DEVICE_PREFIX: &str = "obk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicVariant {
    /// `stat/<prefix><hex>/Power`
    PowerEcho,
    /// `<domain>/<prefix><hex>/status`
    DeviceStatus,
    /// `<domain>/<prefix><hex>/data`
    DeviceData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTopic {
    pub id: MeterId,
    pub variant: TopicVariant,
}

/// Message body as received from the broker: JSON when it parses, the raw
/// text otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Structured(Value),
    Opaque(String),
}

impl Payload {
    pub fn is_structured(&self) -> bool {
        matches!(self, Payload::Structured(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicCodec {
    domain: String,
    prefix: String,
}

impl Default for TopicCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN, DEFAULT_DEVICE_PREFIX)
    }
}

impl TopicCodec {
    pub fn new(domain: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            prefix: prefix.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Topic-side name of a device: `obk0884dd9f`.
    pub fn device_segment(&self, id: &MeterId) -> String {
        format!("{}{}", self.prefix, id.hex())
    }

    pub fn command_topic(&self, id: &MeterId) -> String {
        format!("{COMMAND_ROOT}/{}/{POWER_LEAF}", self.device_segment(id))
    }

    pub fn power_echo_topic(&self, id: &MeterId) -> String {
        format!("{STATUS_ROOT}/{}/{POWER_LEAF}", self.device_segment(id))
    }

    pub fn data_topic(&self, id: &MeterId) -> String {
        format!("{}/{}/data", self.domain, self.device_segment(id))
    }

    /// Where the connection self-test writes.
    pub fn test_topic(&self) -> String {
        format!("{}/test/connection", self.domain)
    }

    /// Wildcard patterns the bridge subscribes to after every connect.
    pub fn subscription_patterns(&self) -> BTreeSet<String> {
        [
            format!("{}/+/status", self.domain),
            format!("{}/+/data", self.domain),
            format!("{STATUS_ROOT}/+/{POWER_LEAF}"),
        ]
        .into_iter()
        .collect()
    }

    /// Recognizes device topics and recovers the canonical id. `None` means
    /// the topic is opaque to us and should be relayed as-is.
    pub fn decode_status_topic(&self, topic: &str) -> Option<StatusTopic> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [root, device, leaf] = parts.as_slice() else {
            return None;
        };

        let variant = if *root == STATUS_ROOT && *leaf == POWER_LEAF {
            TopicVariant::PowerEcho
        } else if *root == self.domain && *leaf == "status" {
            TopicVariant::DeviceStatus
        } else if *root == self.domain && *leaf == "data" {
            TopicVariant::DeviceData
        } else {
            return None;
        };

        let hex = device.strip_prefix(self.prefix.as_str())?;
        let id = MeterId::from_hex(hex).ok()?;
        Some(StatusTopic { id, variant })
    }

    /// Extracts the device id from a command topic; used by the simulator.
    pub fn decode_command_topic(&self, topic: &str) -> Option<MeterId> {
        let rest = topic.strip_prefix(COMMAND_ROOT)?.strip_prefix('/')?;
        let device = rest.strip_suffix(POWER_LEAF)?.strip_suffix('/')?;
        let hex = device.strip_prefix(self.prefix.as_str())?;
        MeterId::from_hex(hex).ok()
    }
}

/// Never fails: bytes that are not JSON come back as text.
pub fn decode_payload(raw: &[u8]) -> Payload {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value) => Payload::Structured(value),
        Err(_) => Payload::Opaque(String::from_utf8_lossy(raw).into_owned()),
    }
}
