use thiserror::Error;

/// Result type alias for meshbus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Error taxonomy for the bus: connectivity, lifecycle misuse, protocol and timing
#[derive(Error, Debug)]
pub enum BusError {
    /// AMQP protocol errors raised by lapin
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Envelope serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The session is not connected while a listener is being initialized
    #[error("Broker connection unavailable")]
    Connection,

    #[error("Already connected to broker")]
    AlreadyConnected,

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Not initialized")]
    NotInitialized,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Already initialized: {0}")]
    AlreadyInitialized(String),

    /// A listener was built without an exchange name
    #[error("No exchange configured")]
    MissingExchange,

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Invalid service method {method}")]
    InvalidMethod { method: String },

    /// A service method produced no awaitable result
    #[error("Service method {method} returned an invalid result")]
    InvalidResult { method: String },

    #[error("Invalid service name {0}")]
    InvalidServiceName(String),

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Failed dispatching request to {method}: {reason}")]
    PublishMessage { method: String, reason: String },

    #[error("Message {correlation_id} timed out after {timeout_ms}ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    /// Error envelope returned by a remote service method
    #[error("{message}")]
    Remote {
        method: String,
        message: String,
        code: Option<String>,
    },

    /// Service handler errors
    #[error("{0}")]
    Handler(String),

    /// Failure caused outside the handler; late-ack consumers requeue these
    #[error("{0}")]
    External(String),

    /// Broker-side protocol failures (unknown queue, bad delivery tag, ...)
    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BusError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create an error marked as external, so that late-ack consumers requeue the message
    pub fn external<T: ToString>(message: T) -> Self {
        Self::External(message.to_string())
    }

    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    pub fn invalid_message<T: ToString>(reason: T) -> Self {
        Self::InvalidMessage {
            reason: reason.to_string(),
        }
    }

    /// Whether a failed delivery should go back on the queue
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External(_))
    }

    /// Check if error is transient and the operation may be retried
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Amqp(_) | Self::Connection | Self::NotConnected | Self::Timeout { .. } | Self::External(_)
        )
    }

    /// Stable code carried in error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            Self::Amqp(_) | Self::Broker(_) => "BROKER_ERROR",
            Self::Serialization(_) | Self::InvalidMessage { .. } | Self::UnknownType(_) => "INVALID_MESSAGE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Connection | Self::NotConnected | Self::AlreadyConnected => "CONNECTION_ERROR",
            Self::NotInitialized | Self::AlreadyStarted | Self::AlreadyInitialized(_) | Self::MissingExchange => {
                "LIFECYCLE_ERROR"
            }
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::InvalidResponse { .. } => "INVALID_RESPONSE",
            Self::InvalidMethod { .. } => "INVALID_METHOD",
            Self::InvalidResult { .. } => "INVALID_RESULT",
            Self::InvalidServiceName(_) => "INVALID_SERVICE",
            Self::PublishMessage { .. } => "PUBLISH_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Handler(_) => "HANDLER_ERROR",
            Self::External(_) => "EXTERNAL_ERROR",
            Self::Internal(_) | Self::Other(_) | Self::Join(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_external_errors_requeue() {
        assert!(BusError::external("upstream down").is_external());
        assert!(!BusError::handler_error("bug").is_external());
        assert!(!BusError::Timeout {
            correlation_id: "abc".into(),
            timeout_ms: 10
        }
        .is_external());
    }

    #[test]
    fn test_transient_errors_are_recoverable() {
        assert!(BusError::NotConnected.is_recoverable());
        assert!(BusError::external("upstream down").is_recoverable());
        assert!(BusError::Timeout {
            correlation_id: "abc".into(),
            timeout_ms: 10
        }
        .is_recoverable());
        assert!(!BusError::handler_error("bug").is_recoverable());
        assert!(!BusError::AlreadyInitialized("shop.users".into()).is_recoverable());
    }

    #[test]
    fn test_handler_message_is_verbatim() {
        let err = BusError::handler_error("invalid_params");
        assert_eq!(err.to_string(), "invalid_params");
        assert_eq!(err.code(), "HANDLER_ERROR");
    }
}
