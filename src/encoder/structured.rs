//! Fixed-shape telemetry record encoder

use super::{iso8601_utc, sub_second_millis, synthetic_location, Encoder, EncoderKind, SAMPLE_TAGS};
use crate::protocol::{SampleMeasurement, TelemetryRecord};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Encodes a [`TelemetryRecord`] with a [`SampleMeasurement`] as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredEncoder;

impl StructuredEncoder {
    /// Build the record for `now` without serializing it
    pub fn record(&self, stream: &str, model: &str, now: DateTime<Utc>) -> TelemetryRecord {
        TelemetryRecord {
            s: stream.to_string(),
            m: model.to_string(),
            ts: iso8601_utc(now),
            loc: synthetic_location(now),
            v: json!(sample_measurement(now)),
            t: SAMPLE_TAGS.iter().map(|tag| tag.to_string()).collect(),
        }
    }
}

impl Encoder for StructuredEncoder {
    fn encode(&self, stream: &str, model: &str, now: DateTime<Utc>) -> Vec<u8> {
        json!(self.record(stream, model, now)).to_string().into_bytes()
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::Structured
    }
}

/// Measurement values derived from the sub-second part of `now`
pub fn sample_measurement(now: DateTime<Utc>) -> SampleMeasurement {
    let millis = sub_second_millis(now);
    SampleMeasurement {
        log: format!("Message from deviceMode on dev/data on {}", now.to_rfc2822()),
        temperature: (millis / 100).pow(2),
        hygrometry: millis / 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_record_fields() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_437).unwrap();
        let record = StructuredEncoder.record("device1stream", "devtype1", now);

        assert_eq!(record.s, "device1stream");
        assert_eq!(record.m, "devtype1");
        assert_eq!(record.ts, "2023-11-14T22:13:20Z");
        assert_eq!(record.t, vec!["SampleTag".to_string()]);
        assert_eq!(record.v["temperature"], 16);
        assert_eq!(record.v["hygrometry"], 43);
    }

    #[test]
    fn test_encode_decodes_back() {
        let now = Utc::now();
        let bytes = StructuredEncoder.encode("s", "m", now);
        let decoded: TelemetryRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, StructuredEncoder.record("s", "m", now));
    }

    #[test]
    fn test_sample_measurement_bounds() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_999).unwrap();
        let measurement = sample_measurement(now);
        assert_eq!(measurement.temperature, 81);
        assert_eq!(measurement.hygrometry, 99);
        assert!(measurement.log.starts_with("Message from deviceMode"));
    }
}
