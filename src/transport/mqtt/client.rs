//! Impure I/O operations for the MQTT connection
//!
//! This module owns the `rumqttc` client and event loop: it waits for the
//! broker's ConnAck, drives the event loop on a background task, hands inbound
//! publishes to the registered delivery handler and reports connection loss on
//! the state channel. `subscribe` returns only once the broker's SubAck for
//! that request has arrived.

use super::connection::{
    configure_mqtt_options, BrokerEndpoint, ConnectionState, Credential, Identity, MqttError,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::protocol::{OutboundMessage, QosLevel};
use crate::transport::{DeliveryHandler, Transport};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, EventLoop};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request queue between client handles and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `disconnect` waits for the event loop to flush and stop
const EVENT_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `subscribe` waits for the broker's SubAck
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

type SharedHandler = Arc<RwLock<Option<Arc<dyn DeliveryHandler>>>>;
type SharedSubAcks = Arc<StdMutex<SubAckTracker>>;

/// Pairs SUBSCRIBE requests with the SubAck that answers them
///
/// Requests leave the client in the order they were queued, so the waiter at
/// the front of `queued` owns the next outgoing SUBSCRIBE packet id.
#[derive(Default)]
struct SubAckTracker {
    queued: VecDeque<oneshot::Sender<bool>>,
    sent: HashMap<u16, oneshot::Sender<bool>>,
}

impl SubAckTracker {
    fn enqueue(&mut self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    /// Forget the newest waiter; its request never reached the event loop
    fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, packet_id: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                self.sent.insert(packet_id, waiter);
            }
            None => debug!(packet_id, "SUBSCRIBE sent without a waiter"),
        }
    }

    /// Resolve the waiter for `packet_id`; false if nobody was waiting
    fn acknowledged(&mut self, packet_id: u16, granted: bool) -> bool {
        match self.sent.remove(&packet_id) {
            Some(waiter) => waiter.send(granted).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter so pending subscribes fail instead of hanging
    fn fail_all(&mut self) {
        self.queued.clear();
        self.sent.clear();
    }
}

/// One live broker connection
pub struct MqttConnection {
    identity: Identity,
    client: AsyncClient,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    delivery_handler: SharedHandler,
    subacks: SharedSubAcks,
    subscribe_order: Mutex<()>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Connect and return once the broker has acknowledged the session
    pub async fn connect(
        identity: Identity,
        credential: &Credential,
        endpoint: &BrokerEndpoint,
        connect_timeout: Duration,
    ) -> Result<Self, MqttError> {
        let mqtt_options = configure_mqtt_options(&identity, credential, endpoint)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self::wait_for_connack(&mut event_loop, connect_timeout).await?;
        state_tx.send_replace(ConnectionState::Connected);

        let state_tx = Arc::new(state_tx);
        let closing = Arc::new(AtomicBool::new(false));
        let delivery_handler: SharedHandler = Arc::new(RwLock::new(None));
        let subacks = SharedSubAcks::default();

        let handle = Self::spawn_event_loop(
            identity.client_id().to_string(),
            event_loop,
            state_tx.clone(),
            shutdown_rx,
            closing.clone(),
            delivery_handler.clone(),
            subacks.clone(),
        );

        Ok(Self {
            identity,
            client,
            state_tx,
            state_rx,
            shutdown_tx,
            closing,
            delivery_handler,
            subacks,
            subscribe_order: Mutex::new(()),
            event_loop_handle: Mutex::new(Some(handle)),
        })
    }

    /// Poll until ConnAck; a refusal or transport error fails the connect
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        connect_timeout: Duration,
    ) -> Result<(), MqttError> {
        let result = tokio::time::timeout(connect_timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::ConnectionAcknowledged(ConnectReturnCode::Success) => {
                            return Ok(())
                        }
                        EventRoute::ConnectionAcknowledged(code) => {
                            return Err(MqttError::Refused(code))
                        }
                        _ => continue,
                    },
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(MqttError::Refused(code))
                    }
                    Err(e) => return Err(MqttError::ConnectionFailed(Box::new(e))),
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(MqttError::ConnectTimeout(connect_timeout)),
        }
    }

    fn spawn_event_loop(
        client_id: String,
        mut event_loop: EventLoop,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        mut shutdown_rx: watch::Receiver<bool>,
        closing: Arc<AtomicBool>,
        delivery_handler: SharedHandler,
        subacks: SharedSubAcks,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(client_id = %client_id, "MQTT event loop started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(client_id = %client_id, "Shutdown signal received, stopping event loop");
                            break;
                        }
                    }
                    polled = event_loop.poll() => {
                        let keep_running = match polled {
                            Ok(event) => Self::process_event_route(
                                MessageHandler::route_mqtt_event(&event),
                                &state_tx,
                                &delivery_handler,
                                &subacks,
                            ),
                            Err(e) => {
                                Self::handle_event_loop_error(&e, &state_tx, &closing, &delivery_handler);
                                false
                            }
                        };
                        if !keep_running {
                            break;
                        }
                    }
                }
            }

            Self::subacks(&subacks).fail_all();
            debug!(client_id = %client_id, "MQTT event loop stopped");
        })
    }

    /// Act on one routed event; returns false when the loop must stop
    fn process_event_route(
        route: EventRoute,
        state_tx: &watch::Sender<ConnectionState>,
        delivery_handler: &SharedHandler,
        subacks: &SharedSubAcks,
    ) -> bool {
        match route {
            EventRoute::MessageReceived { topic, payload } => {
                debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);
                match Self::current_handler(delivery_handler) {
                    Some(handler) => handler.on_delivery(&topic, &payload),
                    None => warn!(topic = %topic, "Message received but no delivery handler registered - dropped"),
                }
                true
            }
            EventRoute::Disconnected => {
                let reason = "broker closed the session".to_string();
                Self::report_loss(state_tx, delivery_handler, reason);
                false
            }
            EventRoute::DisconnectSent => {
                state_tx.send_replace(ConnectionState::Disconnected);
                false
            }
            EventRoute::SubscribeSent { packet_id } => {
                Self::subacks(subacks).sent(packet_id);
                true
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                let all_granted = !granted.is_empty() && granted.iter().all(|ok| *ok);
                if all_granted {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                } else {
                    error!(packet_id, granted = ?granted, "Broker rejected subscription");
                }
                if !Self::subacks(subacks).acknowledged(packet_id, all_granted) {
                    debug!(packet_id, "SubAck with no pending subscribe");
                }
                true
            }
            EventRoute::ConnectionAcknowledged(code) => {
                debug!(target: "mqtt_transport", "Unexpected ConnAck: {:?}", code);
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    fn handle_event_loop_error(
        error: &ConnectionError,
        state_tx: &watch::Sender<ConnectionState>,
        closing: &AtomicBool,
        delivery_handler: &SharedHandler,
    ) {
        if closing.load(Ordering::SeqCst) {
            debug!("Event loop ended during disconnect: {}", error);
            state_tx.send_replace(ConnectionState::Disconnected);
            return;
        }

        error!("MQTT event loop error: {}", error);
        Self::report_loss(state_tx, delivery_handler, error.to_string());
    }

    fn report_loss(
        state_tx: &watch::Sender<ConnectionState>,
        delivery_handler: &SharedHandler,
        reason: String,
    ) {
        warn!("MQTT connection lost: {}", reason);
        state_tx.send_replace(ConnectionState::Lost(reason.clone()));
        if let Some(handler) = Self::current_handler(delivery_handler) {
            handler.on_connection_lost(&reason);
        }
    }

    fn subacks(subacks: &SharedSubAcks) -> StdMutexGuard<'_, SubAckTracker> {
        subacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the SubAck answering one SUBSCRIBE
    async fn await_suback(
        topic: &str,
        acked: oneshot::Receiver<bool>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        match tokio::time::timeout(timeout, acked).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(MqttError::SubscriptionRejected {
                topic: topic.to_string(),
            }),
            Ok(Err(closed)) => Err(MqttError::SubscriptionFailed {
                topic: topic.to_string(),
                source: Box::new(closed),
            }),
            Err(_) => Err(MqttError::SubAckTimeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }

    fn current_handler(delivery_handler: &SharedHandler) -> Option<Arc<dyn DeliveryHandler>> {
        delivery_handler
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().cloned())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Send DISCONNECT and wait (bounded) for the event loop to stop
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        self.closing.store(true, Ordering::SeqCst);

        let result = if state == ConnectionState::Connected {
            self.client
                .disconnect()
                .await
                .map_err(|e| MqttError::DisconnectFailed(Box::new(e)))
        } else {
            debug!(state = ?state, "Disconnect requested on inactive connection");
            Ok(())
        };

        if let Some(mut handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(EVENT_LOOP_STOP_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    let _ = self.shutdown_tx.send(true);
                    handle.abort();
                }
            }
        }

        if !matches!(state, ConnectionState::Lost(_)) {
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }

        // the handler usually holds an Arc back to this connection
        match self.delivery_handler.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }

        info!(client_id = %self.identity.client_id(), "MQTT client disconnected");
        result
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let current_state = self.state_rx.borrow().clone();
        if current_state != ConnectionState::Connected {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MqttConnection {
    type Error = MqttError;

    async fn publish(&self, message: &OutboundMessage) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        self.client
            .publish_bytes(
                message.topic(),
                message.qos().into(),
                false,
                message.payload().clone(),
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic = %message.topic(), bytes = message.payload().len(), "Published message");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), Self::Error> {
        self.check_connection_state()?;

        let acked = {
            let _order = self.subscribe_order.lock().await;
            let acked = Self::subacks(&self.subacks).enqueue();
            if let Err(e) = self.client.subscribe(topic, qos.into()).await {
                Self::subacks(&self.subacks).cancel_last();
                return Err(MqttError::SubscriptionFailed {
                    topic: topic.to_string(),
                    source: Box::new(e),
                });
            }
            acked
        };
        Self::await_suback(topic, acked, SUBACK_TIMEOUT).await?;

        info!("Successfully subscribed to: {}", topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttConnection::disconnect(self).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn set_delivery_handler(&self, handler: Arc<dyn DeliveryHandler>) {
        match self.delivery_handler.write() {
            Ok(mut guard) => *guard = Some(handler),
            Err(_) => error!("Delivery handler lock poisoned; handler not registered"),
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);

        if let Ok(mut guard) = self.event_loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
