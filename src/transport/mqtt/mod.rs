//! MQTT transport for the device client
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Identity, transport policy and option building
//! - [`message_handler`] - Pure routing of event-loop events
//! - [`client`] - Impure I/O: ConnAck wait, event-loop task, publish/subscribe
//! - [`manager`] - Connect/disconnect contract with error classification
//!
//! # Usage
//!
//! ```rust,no_run
//! use lo_device_client::transport::mqtt::{BrokerEndpoint, ConnectionManager, Credential, Identity};
//!
//! # tokio_test::block_on(async {
//! let endpoint = BrokerEndpoint::parse("mqtt://localhost:1883")?;
//! let manager = ConnectionManager::new(endpoint, Credential::new("api-key"));
//!
//! let connection = manager
//!     .connect(Identity::device("urn:lo:nsid:samples:device", 1))
//!     .await?;
//! manager.disconnect(&connection).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod manager;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttConnection;
pub use connection::{
    BrokerEndpoint, ConnectionState, Credential, Identity, MqttError, Role, TransportMode,
    KEEP_ALIVE,
};
pub use manager::ConnectionManager;
pub use message_handler::{EventRoute, MessageHandler};
