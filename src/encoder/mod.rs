//! Telemetry payload encoders
//!
//! Every encoder turns `(stream, model, now)` into payload bytes and never
//! fails. The publish loop holds one `Box<dyn Encoder>` and routes the bytes
//! to the topic matching its [`EncoderKind`], so swapping payload shape never
//! touches rate control or connection handling.

use crate::config::{ConfigError, PublishSection};
use crate::protocol::Topics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod free_form;
pub mod raw;
pub mod structured;

pub use free_form::FreeFormEncoder;
pub use raw::{DecodableRawEncoder, OpaqueRawEncoder};
pub use structured::StructuredEncoder;

/// Payload encoder contract
pub trait Encoder: Send + Sync {
    /// Produce payload bytes for one publish cycle
    fn encode(&self, stream: &str, model: &str, now: DateTime<Utc>) -> Vec<u8>;

    /// Which variant this encoder implements
    fn kind(&self) -> EncoderKind;
}

/// The closed set of payload variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    /// Fixed-shape telemetry record
    #[default]
    Structured,
    /// Same fields as an open key-value map
    FreeForm,
    /// Fixed-size binary number the broker decodes
    DecodableRaw,
    /// Uninterpreted blob
    OpaqueRaw,
}

impl EncoderKind {
    /// Topic the payloads of this variant are published on
    pub fn topic(&self, topics: &Topics) -> String {
        match self {
            EncoderKind::Structured | EncoderKind::FreeForm => topics.data.clone(),
            EncoderKind::DecodableRaw => topics.decodable_raw_data(),
            EncoderKind::OpaqueRaw => topics.opaque_raw_data(),
        }
    }

    /// Build the encoder selected by the publish configuration
    pub fn from_config(publish: &PublishSection) -> Result<Box<dyn Encoder>, ConfigError> {
        let encoder: Box<dyn Encoder> = match publish.encoder {
            EncoderKind::Structured => Box::new(StructuredEncoder),
            EncoderKind::FreeForm => Box::new(FreeFormEncoder),
            EncoderKind::DecodableRaw => Box::new(DecodableRawEncoder),
            EncoderKind::OpaqueRaw => match &publish.image_path {
                Some(path) => Box::new(OpaqueRawEncoder::from_file(path)?),
                None => Box::new(OpaqueRawEncoder::placeholder()),
            },
        };
        Ok(encoder)
    }
}

/// Second-precision ISO-8601 UTC timestamp with trailing `Z`
pub fn iso8601_utc(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Synthetic location moving with the sub-second part of `now`
pub fn synthetic_location(now: DateTime<Utc>) -> [f64; 2] {
    let fraction = sub_second_millis(now) as f64 / 1000.0;
    [48.125 + fraction, 2.185 + fraction]
}

pub(crate) fn sub_second_millis(now: DateTime<Utc>) -> i64 {
    // leap-second representation can exceed 999
    i64::from(now.timestamp_subsec_millis() % 1000)
}

pub(crate) const SAMPLE_TAGS: [&str; 1] = ["SampleTag"];
