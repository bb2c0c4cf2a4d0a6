//! Pure connection configuration for the MQTT transport
//!
//! Identity selection, transport security policy, broker endpoint parsing and
//! `MqttOptions` construction. Nothing in here performs I/O.

use rumqttc::{ConnectReturnCode, MqttOptions, Transport as RumqttcTransport};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Keep-alive negotiated once at connect time
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Default plaintext broker port
pub const PLAIN_PORT: u16 = 1883;

/// Default TLS broker port
pub const TLS_PORT: u16 = 8883;

/// Connection state for one broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected, or closed by the client
    Disconnected,
    /// Waiting for the broker's ConnAck
    Connecting,
    /// Ready for publish and subscribe
    Connected,
    /// Dropped by the network or the broker, with reason
    Lost(String),
}

/// Client role; the username tag tells the broker which rights to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes its own telemetry and receives its own commands
    Device,
    /// Broader rights such as consuming shared FIFOs
    Application,
}

impl Role {
    pub fn username(&self) -> &'static str {
        match self {
            Role::Device => "json+device",
            Role::Application => "application",
        }
    }

    /// Whether this role may connect over an unsecured transport
    pub fn allows_plain_transport(&self) -> bool {
        matches!(self, Role::Device)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Device => f.write_str("device"),
            Role::Application => f.write_str("application"),
        }
    }
}

/// Client id plus role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    client_id: String,
    role: Role,
}

impl Identity {
    /// Device identity: `{urn_prefix}{index}`, e.g. `urn:lo:nsid:samples:device1`
    pub fn device(urn_prefix: &str, index: u32) -> Self {
        Self {
            client_id: format!("{urn_prefix}{index}"),
            role: Role::Device,
        }
    }

    /// Application identity with a client id randomized per connection
    pub fn application() -> Self {
        Self {
            client_id: format!("app-{}", Uuid::new_v4().simple()),
            role: Role::Application,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Shared secret sent in the password field
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Plain,
    Tls,
}

impl TransportMode {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportMode::Plain => PLAIN_PORT,
            TransportMode::Tls => TLS_PORT,
        }
    }
}

/// Broker host, port and transport security
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
}

impl BrokerEndpoint {
    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    pub fn parse(broker_url: &str) -> Result<Self, MqttError> {
        let url =
            Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

        let mode = match url.scheme() {
            "mqtts" | "ssl" => TransportMode::Tls,
            "mqtt" | "tcp" => TransportMode::Plain,
            _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(mode.default_port());

        Ok(Self {
            host: host.to_string(),
            port,
            mode,
        })
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("ConnAck timeout after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Role '{role}' requires a TLS-secured transport")]
    InsecureTransport { role: String },
    #[error("Credential environment variable not set: {0}")]
    MissingCredential(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Broker rejected subscription to {topic}")]
    SubscriptionRejected { topic: String },
    #[error("No SubAck for {topic} within {timeout:?}")]
    SubAckTimeout { topic: String, timeout: Duration },
    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Reject roles that need more than device rights over plain transport
pub fn check_transport_policy(identity: &Identity, mode: TransportMode) -> Result<(), MqttError> {
    if mode == TransportMode::Plain && !identity.role().allows_plain_transport() {
        return Err(MqttError::InsecureTransport {
            role: identity.role().to_string(),
        });
    }
    Ok(())
}

/// Build `MqttOptions` for one identity
pub fn configure_mqtt_options(
    identity: &Identity,
    credential: &Credential,
    endpoint: &BrokerEndpoint,
) -> Result<MqttOptions, MqttError> {
    check_transport_policy(identity, endpoint.mode)?;

    let mut mqtt_options = MqttOptions::new(identity.client_id(), &endpoint.host, endpoint.port);

    if endpoint.mode == TransportMode::Tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_credentials(identity.role().username(), credential.expose());
    mqtt_options.set_clean_session(true);
    mqtt_options.set_keep_alive(KEEP_ALIVE);

    Ok(mqtt_options)
}
