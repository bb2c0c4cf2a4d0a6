//! Telemetry publish loop
//!
//! Each cycle asks the encoder for a payload and sends it through the rate
//! regulator. Between cycles the loop waits on the cadence timer, the
//! shutdown channel and the connection-state channel, whichever fires first.

use crate::config::{DeviceConfig, PublishMode};
use crate::encoder::Encoder;
use crate::protocol::{OutboundMessage, QosLevel, Topics};
use crate::regulator::RateRegulator;
use crate::transport::mqtt::ConnectionState;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Publish a single message and stop
    Once,
    /// Publish, wait for the cadence, repeat
    Periodic(Duration),
}

impl RunMode {
    pub fn from_config(config: &DeviceConfig) -> Self {
        match config.publish.mode {
            PublishMode::Once => RunMode::Once,
            PublishMode::Periodic => RunMode::Periodic(config.cadence()),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Single-shot mode finished
    Completed,
    /// Shutdown was requested
    Cancelled,
    /// The connection dropped; there is no reconnect
    ConnectionLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    /// Transmissions handed to the transport, successful or not
    pub attempts: u64,
    pub failures: u64,
    pub exit: LoopExit,
}

pub struct PublishLoop<T: Transport> {
    regulator: Arc<RateRegulator<T>>,
    encoder: Box<dyn Encoder>,
    topic: String,
    stream: String,
    model: String,
    mode: RunMode,
}

impl<T: Transport> PublishLoop<T> {
    pub fn new(
        regulator: Arc<RateRegulator<T>>,
        encoder: Box<dyn Encoder>,
        topic: impl Into<String>,
        stream: impl Into<String>,
        model: impl Into<String>,
        mode: RunMode,
    ) -> Self {
        Self {
            regulator,
            encoder,
            topic: topic.into(),
            stream: stream.into(),
            model: model.into(),
            mode,
        }
    }

    /// Topic follows the encoder variant: data topic or a raw-data topic
    pub fn from_config(
        regulator: Arc<RateRegulator<T>>,
        encoder: Box<dyn Encoder>,
        config: &DeviceConfig,
    ) -> Self {
        let topics = Topics::from_config(&config.publish, &config.commands);
        let topic = encoder.kind().topic(&topics);
        Self::new(
            regulator,
            encoder,
            topic,
            &config.device.stream,
            &config.device.model,
            RunMode::from_config(config),
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn build_message(&self, now: DateTime<Utc>) -> OutboundMessage {
        let payload = self.encoder.encode(&self.stream, &self.model, now);
        OutboundMessage::new(&self.topic, payload, QosLevel::AtLeastOnce)
    }

    /// Run until single-shot completion, shutdown or connection loss
    ///
    /// A failed publish is counted and logged; the loop carries on with the
    /// next cycle.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut connection: watch::Receiver<ConnectionState>,
    ) -> LoopReport {
        let mut attempts = 0u64;
        let mut failures = 0u64;
        let report = |attempts, failures, exit| LoopReport {
            attempts,
            failures,
            exit,
        };

        loop {
            if *shutdown.borrow() {
                return report(attempts, failures, LoopExit::Cancelled);
            }
            if let ConnectionState::Lost(reason) = connection.borrow().clone() {
                return report(attempts, failures, LoopExit::ConnectionLost(reason));
            }

            let message = self.build_message(Utc::now());
            info!(
                topic = %self.topic,
                encoder = ?self.encoder.kind(),
                bytes = message.payload().len(),
                "Publishing message"
            );

            // only the wait for the slot is cancellable; a started transmission completes
            let slot = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("Shutdown requested while waiting for the publish slot");
                    return report(attempts, failures, LoopExit::Cancelled);
                }
                slot = self.regulator.acquire() => slot,
            };
            let result = slot.transmit(&message).await;

            attempts += 1;
            if let Err(e) = result {
                failures += 1;
                warn!(error = %e.sanitized(), "Publish failed, continuing with next cycle");
            }

            let cadence = match self.mode {
                RunMode::Once => return report(attempts, failures, LoopExit::Completed),
                RunMode::Periodic(cadence) => cadence,
            };

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested, stopping publish loop");
                    return report(attempts, failures, LoopExit::Cancelled);
                }
                reason = wait_for_loss(&mut connection) => {
                    warn!(reason = %reason, "Connection lost, stopping publish loop");
                    return report(attempts, failures, LoopExit::ConnectionLost(reason));
                }
                _ = tokio::time::sleep(cadence) => {}
            }
        }
    }
}

/// Resolve once the flag is set; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve with the reason once the connection is reported lost
async fn wait_for_loss(connection: &mut watch::Receiver<ConnectionState>) -> String {
    loop {
        if let ConnectionState::Lost(reason) = connection.borrow_and_update().clone() {
            return reason;
        }
        if connection.changed().await.is_err() {
            return std::future::pending::<String>().await;
        }
    }
}
