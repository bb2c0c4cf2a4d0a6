//! Raw binary encoders published without a JSON envelope

use super::{sub_second_millis, Encoder, EncoderKind};
use crate::config::ConfigError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

/// PNG signature followed by a marker; stands in when no image is configured
const PLACEHOLDER_IMAGE: &[u8] = b"\x89PNG\r\n\x1a\nlo-device placeholder image";

/// Single big-endian `f32`, decoded server-side as a number
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodableRawEncoder;

impl DecodableRawEncoder {
    pub fn value(&self, now: DateTime<Utc>) -> f32 {
        20.0 + sub_second_millis(now) as f32 / 100.0
    }
}

impl Encoder for DecodableRawEncoder {
    fn encode(&self, _stream: &str, _model: &str, now: DateTime<Utc>) -> Vec<u8> {
        self.value(now).to_be_bytes().to_vec()
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::DecodableRaw
    }
}

/// Arbitrary blob (typically an image) with no interpretation contract
#[derive(Debug, Clone)]
pub struct OpaqueRawEncoder {
    blob: Bytes,
}

impl OpaqueRawEncoder {
    pub fn new(blob: impl Into<Bytes>) -> Self {
        Self { blob: blob.into() }
    }

    pub fn placeholder() -> Self {
        Self::new(Bytes::from_static(PLACEHOLDER_IMAGE))
    }

    /// Load the blob once; an empty file falls back to the placeholder
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let blob = std::fs::read(path)?;
        if blob.is_empty() {
            return Ok(Self::placeholder());
        }
        Ok(Self::new(blob))
    }
}

impl Encoder for OpaqueRawEncoder {
    fn encode(&self, _stream: &str, _model: &str, _now: DateTime<Utc>) -> Vec<u8> {
        self.blob.to_vec()
    }

    fn kind(&self) -> EncoderKind {
        EncoderKind::OpaqueRaw
    }
}
