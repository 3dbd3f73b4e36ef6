use rdkafka::error::KafkaError;
use thiserror::Error;

/// Configuration faults. These surface when a subscription is requested, never at runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown policy property or function: {0}")]
    UnknownName(String),

    #[error("invalid argument for {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("policy {0} configured more than once")]
    DuplicatePolicy(&'static str),

    #[error("offset bias and as-of date are mutually exclusive")]
    AmbiguousOffset,

    #[error("handler shape does not match the pipeline: {0}")]
    HandlerMismatch(String),

    #[error("no field selector registered for group-by field {0}")]
    UnknownField(String),

    #[error("no handler registered under {0}")]
    UnknownHandler(String),

    #[error("missing required property: {0}")]
    MissingProperty(&'static str),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),
}

/// Faults raised by a transport (consume, commit, offset queries).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("timeout during {operation} for partition {partition}")]
    Timeout {
        operation: &'static str,
        partition: i32,
    },

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// Returns the error type tag for metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            TransportError::Kafka(_) => "kafka_error",
            TransportError::Timeout { .. } => "timeout",
            TransportError::Closed => "closed",
            TransportError::Other(_) => "other",
        }
    }
}

/// Errors returned to the caller of `subscribe`.
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("invalid subscription configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transport failure while subscribing: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_type_tags() {
        assert_eq!(TransportError::Closed.error_type(), "closed");
        assert_eq!(
            TransportError::Timeout {
                operation: "fetch_watermarks",
                partition: 2
            }
            .error_type(),
            "timeout"
        );
        assert_eq!(
            TransportError::Other(anyhow::anyhow!("boom")).error_type(),
            "other"
        );
    }

    #[test]
    fn test_subscribe_error_wraps_config_error() {
        let err: SubscribeError = ConfigError::AmbiguousOffset.into();
        assert!(matches!(
            err,
            SubscribeError::Config(ConfigError::AmbiguousOffset)
        ));
        assert_eq!(
            err.to_string(),
            "invalid subscription configuration: offset bias and as-of date are mutually exclusive"
        );
    }
}
