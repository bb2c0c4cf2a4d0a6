//! Error taxonomy for the device client
//!
//! Connect-time failures (`Auth`, `Network`) abort startup, per-cycle failures
//! (`Transport`, `Decode`) are contained and logged, and `Subscribe` only
//! disables the command feature.

use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Main error type for device client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Command decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Subscription to {topic} failed: {message}")]
    Subscribe { topic: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl ClientError {
    /// Create authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create subscribe error
    pub fn subscribe<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Errors that must abort startup of the affected device
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth { .. } | ClientError::Network { .. } | ClientError::Config(_)
        )
    }

    /// Error text safe to write to logs
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

impl From<MqttError> for ClientError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::Refused(code) => {
                use rumqttc::ConnectReturnCode;
                match code {
                    ConnectReturnCode::BadUserNamePassword
                    | ConnectReturnCode::NotAuthorized
                    | ConnectReturnCode::BadClientId => {
                        ClientError::auth(format!("broker refused connection: {code:?}"))
                    }
                    other => ClientError::network(format!("broker refused connection: {other:?}")),
                }
            }
            MqttError::InsecureTransport { role } => ClientError::auth(format!(
                "role '{role}' requires a TLS-secured transport"
            )),
            MqttError::MissingCredential(name) => {
                ClientError::auth(format!("credential variable {name} is not set"))
            }
            MqttError::PublishFailed(e) => ClientError::Transport(e),
            MqttError::NotConnected { state } => {
                ClientError::Transport(format!("not connected: {state:?}").into())
            }
            MqttError::SubscriptionFailed { topic, source } => {
                ClientError::subscribe(topic, source.to_string())
            }
            MqttError::SubscriptionRejected { topic } => {
                ClientError::subscribe(topic, "rejected by broker")
            }
            MqttError::SubAckTimeout { topic, timeout } => {
                ClientError::subscribe(topic, format!("no SubAck within {timeout:?}"))
            }
            other => ClientError::network(other.to_string()),
        }
    }
}

/// Redact secrets and cap length of error text before it reaches the logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for device client operations
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::ConnectionState;
    use rumqttc::ConnectReturnCode;

    #[test]
    fn test_refused_bad_credentials_is_auth_error() {
        let error: ClientError = MqttError::Refused(ConnectReturnCode::BadUserNamePassword).into();
        assert!(matches!(error, ClientError::Auth { .. }));
        assert!(error.is_fatal());
    }

    #[test]
    fn test_refused_unavailable_is_network_error() {
        let error: ClientError = MqttError::Refused(ConnectReturnCode::ServiceUnavailable).into();
        assert!(matches!(error, ClientError::Network { .. }));
    }

    #[test]
    fn test_insecure_transport_is_auth_error() {
        let error: ClientError = MqttError::InsecureTransport {
            role: "application".to_string(),
        }
        .into();
        assert!(matches!(error, ClientError::Auth { .. }));
        assert!(error.to_string().contains("TLS"));
    }

    #[test]
    fn test_publish_failure_is_transport_error() {
        let error: ClientError = MqttError::PublishFailed("queue closed".into()).into();
        assert!(matches!(error, ClientError::Transport(_)));
        assert!(!error.is_fatal());

        let error: ClientError = MqttError::NotConnected {
            state: ConnectionState::Lost("eof".to_string()),
        }
        .into();
        assert!(matches!(error, ClientError::Transport(_)));
    }

    #[test]
    fn test_subscribe_failure_is_not_fatal() {
        let error = ClientError::subscribe("dev/cmd", "refused");
        assert!(!error.is_fatal());
        assert!(error.to_string().contains("dev/cmd"));
    }

    #[test]
    fn test_decode_error_from_serde() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let error: ClientError = parse.unwrap_err().into();
        assert!(matches!(error, ClientError::Decode(_)));
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let sanitized = sanitize_error_message("connect failed: password=abc123 key: xyz");
        assert!(!sanitized.contains("abc123"));
        assert!(!sanitized.contains("xyz"));
        assert!(sanitized.contains("password=***"));
    }

    #[test]
    fn test_sanitize_redacts_paths() {
        let sanitized = sanitize_error_message("cannot read /home/dev/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
    }

    #[test]
    fn test_sanitize_truncates_long_messages() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = "y".repeat(500);
        assert_eq!(sanitize_error_message(&exact), exact);
    }

    #[test]
    fn test_sanitized_client_error() {
        let error = ClientError::network("handshake failed token=deadbeef");
        assert!(!error.sanitized().contains("deadbeef"));
    }
}
