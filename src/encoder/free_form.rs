//! Open key-value telemetry encoder

use super::structured::sample_measurement;
use super::{iso8601_utc, synthetic_location, Encoder, EncoderKind, SAMPLE_TAGS};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Encodes the telemetry fields as a free-form JSON map
///
/// Shares key names with [`super::StructuredEncoder`], so the bytes decode
/// into a [`crate::protocol::TelemetryRecord`] as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreeFormEncoder;

impl FreeFormEncoder {
    pub fn fields(&self, stream: &str, model: &str, now: DateTime<Utc>) -> Map<String, Value> {
        let measurement = sample_measurement(now);
        let mut value = Map::new();
        value.insert("log".to_string(), json!(measurement.log));
        value.insert("temperature".to_string(), json!(measurement.temperature));
        value.insert("hygrometry".to_string(), json!(measurement.hygrometry));

        let mut fields = Map::new();
        fields.insert("s".to_string(), json!(stream));
        fields.insert("m".to_string(), json!(model));
        fields.insert("ts".to_string(), json!(iso8601_utc(now)));
        fields.insert("loc".to_string(), json!(synthetic_location(now)));
        fields.insert("v".to_string(), Value::Object(value));
        fields.insert("t".to_string(), json!(SAMPLE_TAGS));
        fields
    }
}

impl Encoder for FreeFormEncoder {
    fn encode(&self, stream: &str, model: &str, now: DateTime<Utc>) -> Vec<u8> {
        Value::Object(self.fields(stream, model, now))
            .to_string()
            .into_bytes()
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::FreeForm
    }
}
