//! Transport layer for the device connection
//!
//! This module provides the transport abstraction the rate regulator, command
//! responder and publish loop are written against, plus its MQTT
//! implementation.

use crate::protocol::{OutboundMessage, QosLevel};
use crate::transport::mqtt::ConnectionState;
use std::sync::Arc;
use tokio::sync::watch;

pub mod mqtt;

/// Callback contract invoked on the transport's delivery task
///
/// Implementations must return quickly: the delivery task processes inbound
/// messages one at a time.
pub trait DeliveryHandler: Send + Sync {
    /// A message arrived on a subscribed topic
    fn on_delivery(&self, topic: &str, payload: &[u8]);

    /// The connection was lost; no further deliveries will follow
    fn on_connection_lost(&self, cause: &str);
}

/// Transport trait for the device connection
///
/// Abstracts the broker connection to enable dependency injection and
/// testing without a broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transmit one message
    async fn publish(&self, message: &OutboundMessage) -> Result<(), Self::Error>;

    /// Subscribe to a topic; deliveries go to the registered handler
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), Self::Error>;

    /// Disconnect from the broker
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Receiver notified on every connection state change
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Register the handler receiving inbound deliveries
    fn set_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>);

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttConnection;
