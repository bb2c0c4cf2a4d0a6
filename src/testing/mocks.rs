//! Mock implementations for testing
//!
//! `MockTransport` records every publish attempt with the instant it reached
//! the transport, supports failure injection, and can simulate inbound
//! deliveries and connection loss.

use crate::protocol::{OutboundMessage, QosLevel};
use crate::transport::mqtt::ConnectionState;
use crate::transport::{DeliveryHandler, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// One publish attempt as seen by the transport
#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Debug, Error)]
#[error("Mock transport failure: {0}")]
pub struct MockTransportError(pub String);

/// Mock transport for testing
pub struct MockTransport {
    attempts: Mutex<Vec<RecordedPublish>>,
    subscriptions: Mutex<Vec<(String, QosLevel)>>,
    fail_all: AtomicBool,
    fail_next: AtomicUsize,
    fail_subscribe: AtomicBool,
    publish_delay: Duration,
    disconnects: AtomicUsize,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    handler: RwLock<Option<Arc<dyn DeliveryHandler>>>,
}

impl MockTransport {
    /// A connected transport that accepts every publish
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        Self {
            attempts: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_all: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            publish_delay: Duration::ZERO,
            disconnects: AtomicUsize::new(0),
            state_tx,
            state_rx,
            handler: RwLock::new(None),
        }
    }

    pub fn with_failure() -> Self {
        let transport = Self::new();
        transport.fail_all.store(true, Ordering::SeqCst);
        transport
    }

    /// Every publish takes `delay` after it reaches the transport
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    /// Fail the next `count` publish attempts
    pub fn fail_next_publishes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Every attempt, successful or not
    pub async fn attempts(&self) -> Vec<RecordedPublish> {
        self.attempts.lock().await.clone()
    }

    /// Successful publishes only
    pub async fn published(&self) -> Vec<RecordedPublish> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|p| p.succeeded)
            .cloned()
            .collect()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<RecordedPublish> {
        self.published()
            .await
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub async fn subscriptions(&self) -> Vec<(String, QosLevel)> {
        self.subscriptions.lock().await.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn current_handler(&self) -> Option<Arc<dyn DeliveryHandler>> {
        self.handler.read().ok().and_then(|h| h.as_ref().cloned())
    }

    /// Simulate an inbound message; returns false when no handler is registered
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        match self.current_handler() {
            Some(handler) => {
                handler.on_delivery(topic, payload);
                true
            }
            None => false,
        }
    }

    /// Simulate the broker dropping the connection
    pub fn lose_connection(&self, reason: &str) {
        self.state_tx
            .send_replace(ConnectionState::Lost(reason.to_string()));
        if let Some(handler) = self.current_handler() {
            handler.on_connection_lost(reason);
        }
    }

    fn should_fail_publish(&self) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn publish(&self, message: &OutboundMessage) -> Result<(), Self::Error> {
        let at = Instant::now();
        let connected = matches!(*self.state_rx.borrow(), ConnectionState::Connected);
        let succeeded = connected && !self.should_fail_publish();

        self.attempts.lock().await.push(RecordedPublish {
            topic: message.topic().to_string(),
            payload: message.payload().clone(),
            qos: message.qos(),
            at,
            succeeded,
        });

        if !self.publish_delay.is_zero() {
            tokio::time::sleep(self.publish_delay).await;
        }

        if !connected {
            return Err(MockTransportError("not connected".to_string()));
        }
        if !succeeded {
            return Err(MockTransportError("publish failure".to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), Self::Error> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MockTransportError(format!("subscription to {topic} refused")));
        }
        self.subscriptions.lock().await.push((topic.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if !matches!(*self.state_rx.borrow(), ConnectionState::Lost(_)) {
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
        if let Ok(mut slot) = self.handler.write() {
            *slot = None;
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> OutboundMessage {
        OutboundMessage::new("dev/data", b"{}".to_vec(), QosLevel::AtLeastOnce)
    }

    #[tokio::test]
    async fn test_records_publishes() {
        let transport = MockTransport::new();
        transport.publish(&message()).await.unwrap();

        let published = transport.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "dev/data");
        assert_eq!(published[0].qos, QosLevel::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_fail_next_publishes() {
        let transport = MockTransport::new();
        transport.fail_next_publishes(1);

        assert!(transport.publish(&message()).await.is_err());
        assert!(transport.publish(&message()).await.is_ok());
        assert_eq!(transport.attempts().await.len(), 2);
        assert_eq!(transport.published().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_connection_rejects_publish() {
        let transport = MockTransport::new();
        transport.lose_connection("eof");

        assert!(!transport.is_connected());
        assert!(transport.publish(&message()).await.is_err());

        transport.disconnect().await.unwrap();
        assert!(matches!(transport.connection_state(), ConnectionState::Lost(_)));
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[test]
    fn test_deliver_without_handler() {
        assert!(!MockTransport::new().deliver("dev/cmd", b"{}"));
    }
}
