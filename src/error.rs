use thiserror::Error;

/// Errors that can occur while syncing a LifeSpan treadmill
#[derive(Error, Debug)]
pub enum SyncError {
    /// Bluetooth Low Energy related errors
    #[cfg(feature = "ble")]
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Response frame was too short or carried an unexpected tag
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Handshake or reset response did not match the expected literal
    #[error("Unexpected acknowledgement for {command}: got {received}, expected {expected}")]
    UnexpectedAcknowledgement {
        /// Command that was acknowledged
        command: String,
        /// Hex encoding of the received frame
        received: String,
        /// Hex encoding of the expected frame
        expected: String,
    },

    /// Belt is moving, counters cannot be reset safely
    #[error("Treadmill is in motion at {speed_mph:.2} mph")]
    InMotion {
        /// Reported belt speed in miles per hour
        speed_mph: f64,
    },

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Catalog hex literal could not be encoded into a frame
    #[error("Encoding failure: {0}")]
    Encoding(String),

    /// Device not found during scanning
    #[error("LifeSpan device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Downstream workout record was missing or had mistyped fields
    #[error("Invalid workout record: {0}")]
    InvalidRecord(String),

    /// Result sink cannot accept a record right now
    #[error("Result sink unavailable: {0}")]
    SinkUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        match self {
            #[cfg(feature = "ble")]
            Self::Ble(_) => true,
            Self::ConnectionFailed(_) | Self::Disconnected | Self::DeviceNotFound => true,
            _ => false,
        }
    }

    /// Check if this error is a protocol-level error handled inside a session
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedResponse(_) | Self::UnexpectedAcknowledgement { .. }
        )
    }

    /// Check if the failed request should be resent in place
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::MalformedResponse(_)
                | Self::UnexpectedAcknowledgement { .. }
                | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = SyncError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_retryable());
        assert!(!connection_error.is_protocol_error());

        let malformed = SyncError::MalformedResponse("short frame".to_string());
        assert!(!malformed.is_connection_error());
        assert!(malformed.is_retryable());
        assert!(malformed.is_protocol_error());

        let in_motion = SyncError::InMotion { speed_mph: 1.2 };
        assert!(!in_motion.is_retryable());
        assert!(!in_motion.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let error = SyncError::UnexpectedAcknowledgement {
            command: "reset".to_string(),
            received: "a1ff00000000".to_string(),
            expected: "e2aa00000000".to_string(),
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("reset"));
        assert!(error_string.contains("e2aa00000000"));

        let error = SyncError::InMotion { speed_mph: 2.5 };
        assert_eq!(error.to_string(), "Treadmill is in motion at 2.50 mph");
    }
}
