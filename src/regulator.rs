//! Outbound publish rate regulation
//!
//! One `RateRegulator` wraps one connection. Every publish on that connection,
//! from the publish loop or from an acknowledgment worker, goes through the
//! same lock, so the minimum gap holds between any two transmissions and not
//! just between calls from one producer.
//!
//! A publish is two steps: [`RateRegulator::acquire`] waits for the slot and
//! may be cancelled; [`RateSlot::transmit`] sends and records the slot.

use crate::error::{ClientError, ClientResult};
use crate::observability::ClientMetrics;
use crate::protocol::OutboundMessage;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn, Instrument};

/// Last transmission instant and the minimum gap to the next one
#[derive(Debug, Clone)]
pub struct RateState {
    last_publish: Option<Instant>,
    min_interval: Duration,
}

impl RateState {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_publish: None,
            min_interval,
        }
    }

    /// `max(0, min_interval - (now - last_publish))`
    pub fn wait_time(&self, now: Instant) -> Duration {
        match self.last_publish {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Mark an attempt; failed attempts occupy a slot too
    pub fn record(&mut self, at: Instant) {
        self.last_publish = Some(at);
    }

    pub fn last_publish(&self) -> Option<Instant> {
        self.last_publish
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

/// Serializes and throttles every publish on one connection
pub struct RateRegulator<T: Transport> {
    transport: Arc<T>,
    state: Mutex<RateState>,
    metrics: Arc<ClientMetrics>,
}

impl<T: Transport> RateRegulator<T> {
    pub fn new(transport: Arc<T>, min_interval: Duration) -> Self {
        Self::with_metrics(transport, min_interval, Arc::new(ClientMetrics::new()))
    }

    pub fn with_metrics(
        transport: Arc<T>,
        min_interval: Duration,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            transport,
            state: Mutex::new(RateState::new(min_interval)),
            metrics,
        }
    }

    /// Publish one message, suspending first if the previous one was too recent
    pub async fn publish(&self, message: &OutboundMessage) -> ClientResult<()> {
        self.acquire().await.transmit(message).await
    }

    /// Take the publish slot, waiting out the remainder of the minimum gap
    ///
    /// Dropping this future releases the lock without touching the slot, so
    /// it is the only part of a publish that is safe to cancel.
    pub async fn acquire(&self) -> RateSlot<'_, T> {
        let state = self.state.lock().await;

        let wait = state.wait_time(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Throttling publish");
            self.metrics.throttle_waited(wait);
            tokio::time::sleep(wait).await;
        }

        RateSlot {
            regulator: self,
            state,
            in_flight: false,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub async fn min_interval(&self) -> Duration {
        self.state.lock().await.min_interval()
    }
}

/// Exclusive right to transmit once on the regulated connection
///
/// A transmission that started always occupies the slot, even if the
/// `transmit` future is dropped before the transport returns.
pub struct RateSlot<'a, T: Transport> {
    regulator: &'a RateRegulator<T>,
    state: MutexGuard<'a, RateState>,
    in_flight: bool,
}

impl<T: Transport> RateSlot<'_, T> {
    pub async fn transmit(mut self, message: &OutboundMessage) -> ClientResult<()> {
        let span = crate::publish_span!(
            topic = %message.topic(),
            bytes = message.payload().len(),
            qos = message.qos().as_u8()
        );
        let regulator = self.regulator;

        async move {
            regulator.metrics.publish_attempted();
            self.in_flight = true;
            let result = regulator.transport.publish(message).await;
            self.in_flight = false;
            self.state.record(Instant::now());
            drop(self);

            match result {
                Ok(()) => {
                    regulator.metrics.publish_succeeded();
                    debug!("Publish succeeded");
                    Ok(())
                }
                Err(e) => {
                    regulator.metrics.publish_failed();
                    let error = ClientError::Transport(Box::new(e));
                    warn!(error = %error.sanitized(), "Publish failed");
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl<T: Transport> Drop for RateSlot<'_, T> {
    fn drop(&mut self) {
        if self.in_flight {
            self.state.record(Instant::now());
            warn!("Publish abandoned mid-transmission; slot still counted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QosLevel;
    use crate::testing::MockTransport;

    fn message(topic: &str) -> OutboundMessage {
        OutboundMessage::new(topic, b"payload".to_vec(), QosLevel::AtLeastOnce)
    }

    #[test]
    fn test_wait_time_without_history() {
        let state = RateState::new(Duration::from_millis(500));
        assert_eq!(state.wait_time(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_after_publish() {
        let mut state = RateState::new(Duration::from_millis(500));
        let start = Instant::now();
        state.record(start);

        assert_eq!(state.wait_time(start), Duration::from_millis(500));
        assert_eq!(
            state.wait_time(start + Duration::from_millis(100)),
            Duration::from_millis(400)
        );
        assert_eq!(
            state.wait_time(start + Duration::from_millis(900)),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_publish_is_delayed() {
        let transport = Arc::new(MockTransport::new());
        let regulator = RateRegulator::new(transport.clone(), Duration::from_millis(500));

        regulator.publish(&message("dev/data")).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        regulator.publish(&message("dev/data")).await.unwrap();

        let published = transport.published().await;
        assert_eq!(published.len(), 2);
        assert!(published[1].at - published[0].at >= Duration::from_millis(500));

        let snapshot = regulator.metrics().snapshot();
        assert_eq!(snapshot.publish.succeeded, 2);
        assert_eq!(snapshot.publish.throttled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_occupies_slot() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_publishes(1);
        let regulator = RateRegulator::new(transport.clone(), Duration::from_millis(500));

        let first = regulator.publish(&message("dev/data")).await;
        assert!(matches!(first, Err(ClientError::Transport(_))));
        regulator.publish(&message("dev/data")).await.unwrap();

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].succeeded);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(500));
        assert_eq!(regulator.metrics().snapshot().publish.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_interval_elapsed() {
        let transport = Arc::new(MockTransport::new());
        let regulator = RateRegulator::new(transport.clone(), Duration::from_millis(500));

        regulator.publish(&message("dev/data")).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let before = Instant::now();
        regulator.publish(&message("dev/data")).await.unwrap();

        assert_eq!(Instant::now(), before);
        assert_eq!(regulator.metrics().snapshot().publish.throttled, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_transmission_occupies_slot() {
        let transport =
            Arc::new(MockTransport::new().with_publish_delay(Duration::from_millis(300)));
        let regulator = Arc::new(RateRegulator::new(transport.clone(), Duration::from_millis(500)));

        let first = {
            let regulator = regulator.clone();
            tokio::spawn(async move { regulator.publish(&message("dev/data")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        regulator.publish(&message("dev/cmd/res")).await.unwrap();

        let attempts = transport.attempts().await;
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].at - attempts[0].at >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_leaves_slot_untouched() {
        let transport = Arc::new(MockTransport::new());
        let regulator = RateRegulator::new(transport.clone(), Duration::from_millis(500));

        regulator.publish(&message("dev/data")).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(100), regulator.acquire()).await;
        assert!(waited.is_err());

        // the gap is still measured from the first transmission
        tokio::time::advance(Duration::from_millis(400)).await;
        let before = Instant::now();
        regulator.publish(&message("dev/data")).await.unwrap();
        assert_eq!(Instant::now(), before);
        assert_eq!(transport.attempts().await.len(), 2);
    }
}
