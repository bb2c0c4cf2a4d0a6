//! Connection establishment and teardown
//!
//! The manager holds the broker endpoint and the shared secret; identities are
//! chosen per call so the same manager opens both the device connection and the
//! optional application-mode connection.

use super::client::MqttConnection;
use super::connection::{BrokerEndpoint, Credential, Identity, MqttError};
use crate::config::DeviceConfig;
use crate::error::{ClientError, ClientResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Instrument};

/// Upper bound on the wait for the broker's ConnAck
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    endpoint: BrokerEndpoint,
    credential: Credential,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(endpoint: BrokerEndpoint, credential: Credential) -> Self {
        Self {
            endpoint,
            credential,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Resolve endpoint and API key from configuration
    pub fn from_config(config: &DeviceConfig) -> ClientResult<Self> {
        let endpoint = BrokerEndpoint::parse(&config.mqtt.broker_url)?;
        let secret = config
            .api_key()
            .map_err(|_| MqttError::MissingCredential(config.mqtt.api_key_env.clone()))?;
        Ok(Self::new(endpoint, Credential::new(secret)))
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Open one connection; fails with `Auth` or `Network`
    pub async fn connect(&self, identity: Identity) -> ClientResult<Arc<MqttConnection>> {
        let span = crate::connection_span!(identity.client_id(), identity.role());

        async move {
            info!(
                host = %self.endpoint.host,
                port = self.endpoint.port,
                mode = ?self.endpoint.mode,
                "Connecting to MQTT broker"
            );

            let role = identity.role();
            let connection = MqttConnection::connect(
                identity,
                &self.credential,
                &self.endpoint,
                self.connect_timeout,
            )
            .await
            .map_err(ClientError::from)?;

            info!(role = %role, mode = ?self.endpoint.mode, "Connected to MQTT broker");
            Ok(Arc::new(connection))
        }
        .instrument(span)
        .await
    }

    /// Close a connection; failures come back as `Network` for the caller to log
    pub async fn disconnect(&self, connection: &MqttConnection) -> ClientResult<()> {
        connection.disconnect().await.map_err(|e| {
            let error = ClientError::network(e.to_string());
            warn!(error = %error.sanitized(), "Disconnect failed");
            error
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::TransportMode;

    #[test]
    fn test_from_config_missing_api_key_is_auth_error() {
        let mut config = DeviceConfig::test_config();
        config.mqtt.api_key_env = "LO_DEVICE_MANAGER_TEST_UNSET".to_string();

        let result = ConnectionManager::from_config(&config);
        assert!(matches!(result, Err(ClientError::Auth { .. })));
    }

    #[test]
    fn test_from_config_resolves_endpoint() {
        let mut config = DeviceConfig::test_config();
        config.mqtt.api_key_env = "PATH".to_string();

        let manager = ConnectionManager::from_config(&config).unwrap();
        assert_eq!(manager.endpoint().host, "localhost");
        assert_eq!(manager.endpoint().port, 1883);
        assert_eq!(manager.endpoint().mode, TransportMode::Plain);
    }

    #[tokio::test]
    async fn test_application_over_plain_fails_fast_with_auth_error() {
        let endpoint = BrokerEndpoint::parse("mqtt://127.0.0.1:1").unwrap();
        let manager = ConnectionManager::new(endpoint, Credential::new("key"));

        let result = manager.connect(Identity::application()).await;
        assert!(matches!(result, Err(ClientError::Auth { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_network_error() {
        let endpoint = BrokerEndpoint::parse("mqtt://127.0.0.1:1").unwrap();
        let manager = ConnectionManager::new(endpoint, Credential::new("key"))
            .with_connect_timeout(Duration::from_secs(5));

        let result = manager
            .connect(Identity::device("urn:lo:nsid:test:device", 1))
            .await;
        assert!(matches!(result, Err(ClientError::Network { .. })));
    }
}
