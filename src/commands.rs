//! Remote command handling
//!
//! The responder is registered as the connection's delivery handler. Each
//! delivery on the command topic is decoded on the delivery task, and the
//! acknowledgment is published from a separate worker so the delivery task
//! never waits on the rate regulator. Workers are bounded by a semaphore and
//! can be drained at shutdown.

use crate::config::{CommandsSection, MAX_IN_FLIGHT_LIMIT};
use crate::error::{ClientError, ClientResult};
use crate::observability::ClientMetrics;
use crate::protocol::{CommandAcknowledgment, InboundCommand, OutboundMessage, QosLevel, Topics};
use crate::regulator::RateRegulator;
use crate::transport::mqtt::MessageHandler;
use crate::transport::{DeliveryHandler, Transport};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn, Instrument};

/// Result key carried by every acknowledgment
pub const ACK_KEY: &str = "my-ack";

/// Decode one delivery into a command
pub fn decode_command(payload: &[u8]) -> ClientResult<InboundCommand> {
    Ok(serde_json::from_slice(payload)?)
}

/// Acknowledgment echoing the command's correlation id
pub fn build_acknowledgment(command: &InboundCommand) -> CommandAcknowledgment {
    let mut ack = CommandAcknowledgment::for_command(command);
    ack.res.insert(
        ACK_KEY.to_string(),
        Value::String(format!(
            "this is my command acknowledge to {}",
            command.req
        )),
    );
    ack
}

pub struct CommandResponder<T: Transport + 'static> {
    regulator: Arc<RateRegulator<T>>,
    command_topic: String,
    response_topic: String,
    workers: Arc<Semaphore>,
    max_in_flight: usize,
    connection_lost: AtomicBool,
}

impl<T: Transport + 'static> CommandResponder<T> {
    pub fn new(regulator: Arc<RateRegulator<T>>, topics: &Topics, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.clamp(1, MAX_IN_FLIGHT_LIMIT);
        Self {
            regulator,
            command_topic: topics.command.clone(),
            response_topic: topics.command_response.clone(),
            workers: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            connection_lost: AtomicBool::new(false),
        }
    }

    pub fn from_config(regulator: Arc<RateRegulator<T>>, commands: &CommandsSection) -> Self {
        let topics = Topics {
            command: commands.topic.clone(),
            command_response: commands.response_topic.clone(),
            ..Topics::default()
        };
        Self::new(regulator, &topics, commands.max_in_flight)
    }

    fn metrics(&self) -> &ClientMetrics {
        self.regulator.metrics()
    }

    /// Register as delivery handler, then subscribe to the command topic
    ///
    /// Failure disables command handling only; the caller keeps publishing.
    pub async fn subscribe(self: &Arc<Self>) -> ClientResult<()> {
        let transport = self.regulator.transport();
        transport.set_delivery_handler(self.clone());

        transport
            .subscribe(&self.command_topic, QosLevel::AtLeastOnce)
            .await
            .map_err(|e| ClientError::subscribe(&self.command_topic, e.to_string()))?;

        info!(topic = %self.command_topic, "Subscribed to command topic");
        Ok(())
    }

    /// Acknowledgment workers currently running
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.workers.available_permits())
    }

    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost.load(Ordering::SeqCst)
    }

    /// Wait for in-flight acknowledgments, then refuse new ones
    ///
    /// Returns false if workers were still running when `timeout` expired.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        let acquired = tokio::time::timeout(timeout, self.workers.acquire_many(all)).await;
        self.workers.close();
        let drained = acquired.is_ok();

        if drained {
            debug!("Acknowledgment workers drained");
        } else {
            warn!(
                in_flight = self.in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "Acknowledgment workers still running after drain timeout"
            );
        }
        drained
    }

    /// Decode, build the acknowledgment and hand it to a worker
    fn handle_delivery(&self, payload: &[u8]) {
        self.metrics().command_received();

        let command = match decode_command(payload) {
            Ok(command) => command,
            Err(e) => {
                self.metrics().decode_error();
                warn!(error = %e.sanitized(), "Discarding malformed command");
                return;
            }
        };

        let span = crate::command_span!(cid = %command.cid, req = %command.req);
        let _guard = span.enter();
        info!("Command received");

        let ack = build_acknowledgment(&command);
        let body = match serde_json::to_vec(&ack) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode acknowledgment");
                return;
            }
        };

        let permit = match self.workers.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.metrics().ack_dropped();
                warn!(
                    max_in_flight = self.max_in_flight,
                    "Acknowledgment workers saturated, dropping acknowledgment"
                );
                return;
            }
            Err(TryAcquireError::Closed) => {
                self.metrics().ack_dropped();
                debug!("Responder drained, dropping acknowledgment");
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.metrics().ack_dropped();
                error!(error = %e, "No runtime available for acknowledgment dispatch");
                return;
            }
        };

        let regulator = self.regulator.clone();
        let message = OutboundMessage::new(&self.response_topic, body, QosLevel::AtLeastOnce);

        runtime.spawn(
            async move {
                let _permit = permit;
                match regulator.publish(&message).await {
                    Ok(()) => {
                        regulator.metrics().ack_dispatched();
                        debug!("Acknowledgment published");
                    }
                    Err(e) => {
                        regulator.metrics().ack_failed();
                        warn!(error = %e.sanitized(), "Acknowledgment publish failed");
                    }
                }
            }
            .instrument(span.clone()),
        );
    }
}

impl<T: Transport + 'static> DeliveryHandler for CommandResponder<T> {
    fn on_delivery(&self, topic: &str, payload: &[u8]) {
        if self.is_connection_lost() {
            warn!(topic = %topic, "Delivery after connection loss refused");
            return;
        }

        if !MessageHandler::topic_matches(&self.command_topic, topic) {
            debug!(topic = %topic, "Ignoring delivery outside the command topic");
            return;
        }

        self.handle_delivery(payload);
    }

    fn on_connection_lost(&self, cause: &str) {
        if !self.connection_lost.swap(true, Ordering::SeqCst) {
            self.metrics().connection_lost();
            warn!(
                cause = %crate::error::sanitize_error_message(cause),
                "Connection lost, command processing stopped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CorrelationId;
    use crate::testing::MockTransport;

    fn responder(
        transport: &Arc<MockTransport>,
        max_in_flight: usize,
    ) -> Arc<CommandResponder<MockTransport>> {
        let regulator = Arc::new(RateRegulator::new(
            transport.clone(),
            Duration::from_millis(500),
        ));
        Arc::new(CommandResponder::new(
            regulator,
            &Topics::default(),
            max_in_flight,
        ))
    }

    #[test]
    fn test_acknowledgment_echoes_cid() {
        let command = decode_command(br#"{"cid":"abc123","req":"reboot"}"#).unwrap();
        let ack = build_acknowledgment(&command);

        assert_eq!(ack.cid, CorrelationId::from("abc123"));
        let text = ack.res.get(ACK_KEY).and_then(Value::as_str).unwrap();
        assert!(text.contains("reboot"));
    }

    #[test]
    fn test_numeric_cid_stays_numeric() {
        let command = decode_command(br#"{"cid":7,"req":"ping"}"#).unwrap();
        let json = serde_json::to_value(build_acknowledgment(&command)).unwrap();
        assert_eq!(json["cid"], 7);
    }

    #[test]
    fn test_decode_error() {
        assert!(matches!(
            decode_command(b"not json"),
            Err(ClientError::Decode(_))
        ));
        assert!(matches!(
            decode_command(br#"{"req":"reboot"}"#),
            Err(ClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_registers_handler() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, 4);

        responder.subscribe().await.unwrap();

        let subscriptions = transport.subscriptions().await;
        assert_eq!(subscriptions, vec![("dev/cmd".to_string(), QosLevel::AtLeastOnce)]);
        assert!(transport.deliver("dev/cmd", b"garbage"));
    }

    #[tokio::test]
    async fn test_subscribe_failure() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_subscriptions();
        let responder = responder(&transport, 4);

        let result = responder.subscribe().await;
        assert!(matches!(result, Err(ClientError::Subscribe { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_workers_drop_acknowledgments() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, 1);
        responder.subscribe().await.unwrap();

        transport.deliver("dev/cmd", br#"{"cid":"1","req":"a"}"#);
        transport.deliver("dev/cmd", br#"{"cid":"2","req":"b"}"#);

        assert!(responder.drain(Duration::from_secs(5)).await);
        let snapshot = responder.metrics().snapshot();
        assert_eq!(snapshot.commands.received, 2);
        assert_eq!(snapshot.commands.acks_dropped, 1);
        assert_eq!(snapshot.commands.acks_dispatched, 1);
    }

    #[tokio::test]
    async fn test_deliveries_after_loss_are_refused() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, 4);
        responder.subscribe().await.unwrap();

        transport.lose_connection("broker gone");
        transport.deliver("dev/cmd", br#"{"cid":"1","req":"a"}"#);

        assert!(responder.is_connection_lost());
        let snapshot = responder.metrics().snapshot();
        assert_eq!(snapshot.commands.received, 0);
        assert_eq!(snapshot.connection.losses, 1);
    }

    #[tokio::test]
    async fn test_other_topics_ignored() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, 4);
        responder.subscribe().await.unwrap();

        transport.deliver("dev/other", br#"{"cid":"1","req":"a"}"#);
        assert_eq!(responder.metrics().snapshot().commands.received, 0);
    }

    #[tokio::test]
    async fn test_disconnect_releases_responder() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, 4);
        responder.subscribe().await.unwrap();
        assert_eq!(Arc::strong_count(&responder), 2);

        transport.disconnect().await.unwrap();

        assert_eq!(Arc::strong_count(&responder), 1);
        assert!(!transport.deliver("dev/cmd", br#"{"cid":"1","req":"a"}"#));
    }

    #[test]
    fn test_oversized_worker_pool_is_clamped() {
        let transport = Arc::new(MockTransport::new());
        let responder = responder(&transport, usize::MAX);
        assert_eq!(responder.in_flight(), 0);
        assert_eq!(responder.workers.available_permits(), MAX_IN_FLIGHT_LIMIT);
    }
}
