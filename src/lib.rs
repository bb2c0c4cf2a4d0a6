//! LO Device Client - Rust Implementation
//!
//! A rate-regulated MQTT device client: it keeps one connection to the
//! broker, publishes telemetry on a cadence, and answers remote commands on
//! the same connection without ever exceeding the broker's publish rate.
//!
//! # Overview
//!
//! - [`encoder`] - Interchangeable payload encoders (structured, free-form, raw)
//! - [`regulator`] - Minimum-interval publish regulation shared by all producers
//! - [`commands`] - Command decoding and bounded acknowledgment dispatch
//! - [`publisher`] - Single-shot or periodic publish loop with cancellation
//! - [`transport`] - Transport seam and its MQTT implementation
//! - [`device`] - Per-device lifecycle and race-free device id allocation
//!
//! # Quick Start
//!
//! ```rust
//! use lo_device_client::encoder::{Encoder, StructuredEncoder};
//! use lo_device_client::protocol::TelemetryRecord;
//!
//! let payload = StructuredEncoder.encode("device1stream", "devtype1", chrono::Utc::now());
//! let record: TelemetryRecord = serde_json::from_slice(&payload).unwrap();
//! assert_eq!(record.s, "device1stream");
//! ```

pub mod appmode;
pub mod commands;
pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod publisher;
pub mod regulator;
pub mod testing;
pub mod transport;

pub use commands::CommandResponder;
pub use config::*;
pub use device::{DeviceIdAllocator, DeviceRunner, DeviceSession};
pub use encoder::{Encoder, EncoderKind};
pub use error::{ClientError, ClientResult};
pub use protocol::*;
pub use publisher::{LoopExit, LoopReport, PublishLoop, RunMode};
pub use regulator::{RateRegulator, RateSlot, RateState};
pub use transport::mqtt::{ConnectionManager, MqttConnection};
