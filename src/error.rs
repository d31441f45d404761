use thiserror::Error;

/// Errors that can occur when working with WalkingPad treadmills and their logs
#[derive(Error, Debug)]
pub enum PadError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("WalkingPad device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// A transport-level operation failed on an established link
    #[error("Transport error during {operation}: {reason}")]
    Transport {
        /// Operation that was attempted, e.g. `set_speed`
        operation: String,
        /// Underlying failure
        reason: String,
    },

    /// No live link to the device
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Operation is not allowed in the current session state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: String,
        /// Current session state description
        state: String,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Inbound frame could not be decoded
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for WalkingPad operations
pub type Result<T> = std::result::Result<T, PadError>;

impl PadError {
    /// Wrap a transport failure, naming the operation that triggered it
    pub fn transport(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Transport { .. }
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is recoverable without a new session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::InvalidParameters(_)
                | Self::InvalidState { .. }
                | Self::ParseError(_)
        )
    }

    /// Check if this error is a malformed inbound frame
    #[must_use]
    pub const fn is_framing_error(&self) -> bool {
        matches!(self, Self::ParseError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = PadError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_framing_error());

        let timeout_error = PadError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let parse_error = PadError::ParseError("short frame".to_string());
        assert!(parse_error.is_framing_error());
        assert!(parse_error.is_recoverable());
        assert!(!parse_error.is_connection_error());
    }

    #[test]
    fn test_transport_error_names_operation() {
        let error = PadError::transport("set_speed", "gatt write rejected");
        assert!(error.is_connection_error());

        let error_string = format!("{error}");
        assert!(error_string.contains("set_speed"));
        assert!(error_string.contains("gatt write rejected"));
    }

    #[test]
    fn test_error_display() {
        let error = PadError::InvalidParameters("sensitivity 7 out of range".to_string());
        let error_string = format!("{error}");
        assert!(error_string.contains("Invalid command parameters"));
        assert!(error_string.contains("sensitivity 7"));

        let error = PadError::InvalidState {
            operation: "set_speed".to_string(),
            state: "Disconnected".to_string(),
        };
        assert_eq!(format!("{error}"), "Cannot set_speed while session is Disconnected");
    }
}
