//! Error types for the Tether transport.
//!
//! Errors fall into three groups: framing errors that make a connection
//! untrustworthy and close it, startup errors raised while registering
//! services, and per-call errors delivered only to the originating caller.

use thiserror::Error;

/// Main error type for the Tether transport.
#[derive(Debug, Error)]
pub enum TetherError {
    // Framing errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Registration errors
    #[error("Service registration failed for {service}: {message}")]
    ServiceRegistration { service: String, message: String },

    #[error("Duplicate service binding: {service}.{method}")]
    DuplicateService { service: String, method: String },

    // Per-call errors
    #[error("Service not found: {service}.{method}")]
    ServiceNotFound { service: String, method: String },

    #[error("Bad request for {service}.{method}: {message}")]
    BadRequest {
        service: String,
        method: String,
        message: String,
    },

    #[error("Remote invocation of {service}.{method} failed (transaction {transaction_id}): {message}")]
    ServiceInvocation {
        service: String,
        method: String,
        transaction_id: u64,
        message: String,
    },

    #[error("Call to {service}.{method} on {address} timed out after {timeout_millis}ms")]
    Timeout {
        address: String,
        service: String,
        method: String,
        timeout_millis: u64,
    },

    #[error("Connection to {address} is closed")]
    ConnectionClosed { address: String },

    #[error("Too many pending calls (limit {limit})")]
    TooManyPending { limit: usize },

    // Value encoding errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for Tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for TetherError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        TetherError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for TetherError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        TetherError::Serialization {
            message: err.to_string(),
        }
    }
}

impl TetherError {
    /// Create a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        TetherError::Protocol {
            message: message.into(),
        }
    }

    /// Create a serialization error from any message.
    pub fn serialization(message: impl Into<String>) -> Self {
        TetherError::Serialization {
            message: message.into(),
        }
    }

    /// Stable kind name.
    ///
    /// Dispatcher-generated failures travel as `"<kind>: <detail>"` in the
    /// response's exception message so the caller can rebuild the typed error.
    pub fn kind(&self) -> &'static str {
        match self {
            TetherError::Protocol { .. } => "ProtocolError",
            TetherError::Io { .. } => "IoError",
            TetherError::ServiceRegistration { .. } => "ServiceRegistrationError",
            TetherError::DuplicateService { .. } => "DuplicateServiceError",
            TetherError::ServiceNotFound { .. } => "ServiceNotFoundError",
            TetherError::BadRequest { .. } => "BadRequestError",
            TetherError::ServiceInvocation { .. } => "ServiceInvocationError",
            TetherError::Timeout { .. } => "TimeoutError",
            TetherError::ConnectionClosed { .. } => "ConnectionClosedError",
            TetherError::TooManyPending { .. } => "TooManyPendingError",
            TetherError::Serialization { .. } => "SerializationError",
            TetherError::Config { .. } => "ConfigError",
        }
    }

    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            TetherError::Protocol { .. }
                | TetherError::Io { .. }
                | TetherError::ConnectionClosed { .. }
        )
    }

    /// Check if a call failing with this error may succeed if issued again
    /// (possibly on a fresh connection).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TetherError::Timeout { .. }
                | TetherError::ConnectionClosed { .. }
                | TetherError::TooManyPending { .. }
        )
    }
}
