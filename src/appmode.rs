//! Application mode: consume a shared FIFO on a second connection
//!
//! The application identity has rights beyond the device's own topics, so the
//! connection manager refuses it over plain transport. Received messages are
//! only logged.

use crate::error::{ClientError, ClientResult};
use crate::protocol::{QosLevel, Topics};
use crate::transport::mqtt::{ConnectionManager, Identity, MqttConnection};
use crate::transport::{DeliveryHandler, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Logs every message arriving on the FIFO
#[derive(Debug, Default)]
pub struct FifoLogger {
    received: AtomicU64,
}

impl FifoLogger {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl DeliveryHandler for FifoLogger {
    fn on_delivery(&self, topic: &str, payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            "Received message from FIFO"
        );
    }

    fn on_connection_lost(&self, cause: &str) {
        warn!(
            cause = %crate::error::sanitize_error_message(cause),
            "Application-mode connection lost"
        );
    }
}

pub struct FifoConsumer<T: Transport> {
    transport: Arc<T>,
    logger: Arc<FifoLogger>,
    topic: String,
}

impl<T: Transport> FifoConsumer<T> {
    /// Subscribe an already-open connection to `fifo/<name>`
    pub async fn attach(transport: Arc<T>, fifo: &str) -> ClientResult<Self> {
        let topic = Topics::fifo(fifo);
        let logger = Arc::new(FifoLogger::default());

        transport.set_delivery_handler(logger.clone());
        transport
            .subscribe(&topic, QosLevel::AtLeastOnce)
            .await
            .map_err(|e| ClientError::subscribe(&topic, e.to_string()))?;

        info!(topic = %topic, "Consuming FIFO in application mode");
        Ok(Self {
            transport,
            logger,
            topic,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn received(&self) -> u64 {
        self.logger.received()
    }

    /// Close the application connection; failures are logged only
    pub async fn stop(&self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %crate::error::sanitize_error_message(&e.to_string()), "Application-mode disconnect failed");
        }
        info!(topic = %self.topic, messages = self.received(), "Application mode stopped");
    }
}

impl FifoConsumer<MqttConnection> {
    /// Open the application connection and start consuming
    pub async fn start(manager: &ConnectionManager, fifo: &str) -> ClientResult<Self> {
        let connection = manager.connect(Identity::application()).await?;
        match Self::attach(connection.clone(), fifo).await {
            Ok(consumer) => Ok(consumer),
            Err(e) => {
                let _ = manager.disconnect(&connection).await;
                Err(e)
            }
        }
    }
}
