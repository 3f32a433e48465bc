use thiserror::Error;

/// Pipeline result type, wrapping the crate's [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline error types, categorized for clarity and handling.
///
/// None of these ever reach the host's business logic through the inline
/// facade calls; they surface only from administrative and query APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Errors related to pipeline configuration problems (invalid values, unreadable files).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lookup by identifier found nothing (unknown alert, error, channel or rule id).
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        kind: &'static str,
        /// Identifier that was not found
        id: String,
    },

    /// An alert, suppression, grouping or escalation rule failed validation.
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// A notification template could not be parsed.
    #[error("Template error: {0}")]
    Template(String),

    /// A channel failed to deliver a notification payload.
    #[error("Delivery to channel '{channel}' failed: {reason}")]
    Delivery {
        /// Channel id the delivery targeted
        channel: String,
        /// Transport-level failure description
        reason: String,
    },

    /// Errors from the internal event queue (closed or full).
    #[error("Event queue error: {0}")]
    Channel(String),

    /// Indicates that an operation failed after exhausting all configured retry attempts.
    /// The `source` field contains the last error that occurred.
    #[error("Operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts that were made before giving up
        attempts: u32,
        #[source]
        /// The underlying error that caused the final failure
        source: Box<Error>,
    },

    /// Errors related to standard I/O operations (config files, listener sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or TOML (de)serialization failures.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Outbound HTTP failures from webhook, chat hook or mail relay channels.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A placeholder for any other types of errors not fitting into the specific categories above.
    #[error("An unexpected or other error occurred: {0}")]
    Other(String),
}

impl Error {
    /// Creates a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a NotFound error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Creates an InvalidRule error.
    pub fn invalid_rule(msg: impl Into<String>) -> Self {
        Self::InvalidRule(msg.into())
    }

    /// Creates a Template error.
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Creates a Delivery error.
    pub fn delivery(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Delivery {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Creates a Channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Creates an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Creates a RetryExhausted error.
    pub fn retry_exhausted(attempts: u32, source: Error) -> Self {
        Self::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }
}

// Automatically convert various error types as needed.

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML parse error: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Other(format!("Task join error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("alert", "a-1");
        assert_eq!(err.to_string(), "alert not found: a-1");
    }

    #[test]
    fn test_retry_exhausted_keeps_source() {
        let err = Error::retry_exhausted(3, Error::delivery("ops-webhook", "connection refused"));
        assert!(err.to_string().contains("3 attempts"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Delivery to channel 'ops-webhook' failed: connection refused")
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
