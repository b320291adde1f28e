use thiserror::Error;

/// Errors that can occur while driving a fitness device
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Protocol error (missing service, missing characteristic, bad identity)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device family has no wire encoding for the command
    #[error("Command {command} is not supported by {family}")]
    UnsupportedCommand {
        /// Human readable command name
        command: String,
        /// Device family that rejected it
        family: String,
    },

    /// Device is not ready for commands
    #[error("Device not ready: {reason}")]
    NotReady {
        /// Reason why device is not ready
        reason: String,
    },

    /// The session task is gone and no longer accepts requests
    #[error("Session channel closed")]
    ChannelClosed,

    /// Settings file could not be parsed or written
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial device node could not be opened or configured
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound(_)
                | Self::Serial(_)
        )
    }

    /// Check if this error is recoverable without tearing the session down
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::NotReady { .. }
                | Self::UnsupportedCommand { .. }
                | Self::Ble(_)
                | Self::Io(_)
        )
    }
}
