//! Wire message types
//!
//! Telemetry records published on the data topic, inbound commands and their
//! acknowledgments, and the transport-neutral outbound message.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Delivery quality level of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QosLevel {
    /// Best effort
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<QosLevel> for rumqttc::QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosLevel::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message ready for transmission; consumed once by the rate regulator
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    topic: String,
    payload: Bytes,
    qos: QosLevel,
    created_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QosLevel) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            created_at: Utc::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Telemetry record published on the data topic
///
/// # Examples
/// ```
/// use lo_device_client::protocol::{SampleMeasurement, TelemetryRecord};
///
/// let record = TelemetryRecord {
///     s: "device1stream".to_string(),
///     m: "devtype1".to_string(),
///     ts: "2024-01-01T12:00:00Z".to_string(),
///     loc: [48.125, 2.185],
///     v: serde_json::to_value(SampleMeasurement {
///         log: "hello".to_string(),
///         temperature: 4,
///         hygrometry: 25,
///     }).unwrap(),
///     t: vec!["SampleTag".to_string()],
/// };
/// let json = serde_json::to_string(&record).unwrap();
/// assert!(json.contains("\"s\":\"device1stream\""));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    /// Stream id
    pub s: String,
    /// Model id
    pub m: String,
    /// UTC timestamp, `YYYY-MM-DDTHH:mm:ssZ`
    pub ts: String,
    /// Latitude, longitude
    pub loc: [f64; 2],
    /// Measurement payload
    pub v: Value,
    /// Tags
    pub t: Vec<String>,
}

/// Measurement object carried in `TelemetryRecord::v`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleMeasurement {
    pub log: String,
    pub temperature: i64,
    pub hygrometry: i64,
}

/// Correlation id linking a command to its acknowledgment
///
/// Brokers send it either as a JSON string or an integer; it is echoed back
/// in the same JSON type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum CorrelationId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Numeric(id) => write!(f, "{id}"),
            CorrelationId::Text(id) => f.write_str(id),
        }
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        CorrelationId::Text(id.to_string())
    }
}

impl From<i64> for CorrelationId {
    fn from(id: i64) -> Self {
        CorrelationId::Numeric(id)
    }
}

/// Remote command received on the command topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundCommand {
    pub cid: CorrelationId,
    pub req: String,
    #[serde(default)]
    pub arg: HashMap<String, Value>,
}

/// Acknowledgment published once per command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandAcknowledgment {
    pub cid: CorrelationId,
    pub res: HashMap<String, Value>,
}

impl CommandAcknowledgment {
    /// Start an empty acknowledgment echoing the command's correlation id
    pub fn for_command(command: &InboundCommand) -> Self {
        Self {
            cid: command.cid.clone(),
            res: HashMap::new(),
        }
    }
}
