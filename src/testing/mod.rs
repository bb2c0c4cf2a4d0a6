//! Testing utilities and mock implementations
//!
//! Lets the regulator, command responder and publish loop be exercised without
//! an MQTT broker.

pub mod mocks;

pub use mocks::*;
