//! Unified error types for the keyless core library.
//!
//! This module provides a unified error type [`KeylessError`] that covers all failure
//! modes across the access-control agent. Each module also has its own specific error
//! types (`ConfigError`, `CloudError`, `RadioError`, `ActuatorError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide operators toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **Classified**: Every error belongs to one [`ErrorCategory`] so the session
//!   loop can decide between retrying, auditing, and resetting the radio stack
//!
//! # Example
//!
//! ```rust
//! use keyless_core::error::{KeylessError, Result};
//!
//! fn check_key(expected: u64, actual: u64) -> Result<()> {
//!     if expected != actual {
//!         return Err(KeylessError::KeyMismatch { expected, actual });
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Failure class of an error, used by the session loop to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No advertisement could be observed or matched.
    Discovery,
    /// Connection, service or characteristic resolution failed.
    Connection,
    /// Challenge write failed, or the response was missing or malformed.
    Protocol,
    /// A response arrived but did not verify.
    Authentication,
    /// Registry, secret, or notification call failed.
    Cloud,
    /// The server-push subscription could not be sustained.
    PushChannel,
    /// The radio stack is considered inconsistent; requires a hard reset.
    RadioFault,
    /// Configuration problem.
    Config,
    /// The lock output could not be driven.
    Actuator,
}

/// The unified error type for all keyless operations.
///
/// This enum covers all failure modes that can occur in the control loop.
/// Each variant is designed to be:
///
/// 1. **Self-descriptive**: The variant name indicates the failure mode
/// 2. **Contextual**: Variants include relevant data for debugging
/// 3. **Actionable**: Error messages suggest how to resolve the issue
#[derive(Debug, Error)]
pub enum KeylessError {
    // =========================================================================
    // RADIO ERRORS
    // =========================================================================
    /// No Bluetooth adapter was found on this system.
    #[error(
        "No Bluetooth adapter found. Ensure Bluetooth hardware is present and bluetoothd is running."
    )]
    BluetoothAdapterNotFound,

    /// Advertisement observation could not be started or was interrupted.
    #[error("Bluetooth discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A connection could not be established or its GATT layout resolved.
    #[error("Connection to '{address}' failed: {message}")]
    ConnectionFailed {
        /// Address of the peer.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// The challenge-response exchange itself failed.
    #[error("Challenge-response protocol error: {0}")]
    ProtocolError(String),

    /// Repeated low-level failures; the radio stack needs a reset.
    #[error("Radio stack fault: {0}. The adapter will be reset.")]
    RadioFault(String),

    // =========================================================================
    // AUTHENTICATION ERRORS
    // =========================================================================
    /// The device answered the challenge with an invalid response.
    #[error("Access denied for device '{0}': response did not verify")]
    AccessDenied(String),

    /// The fetched secret belongs to a different device than the one matched.
    #[error("Secret key mismatch: matched device {expected}, key belongs to device {actual}")]
    KeyMismatch {
        /// Numeric id of the matched device.
        expected: u64,
        /// Numeric id the key was issued for.
        actual: u64,
    },

    // =========================================================================
    // CLOUD ERRORS
    // =========================================================================
    /// A request to the cloud service failed.
    #[error("Cloud request failed: {0}")]
    CloudRequestFailed(String),

    /// The cloud answered with data that could not be interpreted.
    #[error("Cloud returned an invalid response: {0}")]
    CloudInvalidResponse(String),

    /// The push channel was lost for longer than the failsafe timeout.
    #[error("Override channel lost for more than {timeout_secs}s; machine locked")]
    PushChannelFailsafe {
        /// Failsafe timeout that elapsed.
        timeout_secs: u64,
    },

    // =========================================================================
    // CONFIGURATION & ACTUATOR ERRORS
    // =========================================================================
    /// The configuration could not be loaded or parsed.
    #[error("Failed to load configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    /// The lock output could not be set.
    #[error("Actuator failure: {0}")]
    ActuatorFailed(String),
}

/// A specialized [`Result`] type for keyless operations.
pub type Result<T> = std::result::Result<T, KeylessError>;

impl KeylessError {
    /// Failure class of this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::DiscoveryFailed(_) => ErrorCategory::Discovery,
            Self::ConnectionFailed { .. } => ErrorCategory::Connection,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::AccessDenied(_) | Self::KeyMismatch { .. } => ErrorCategory::Authentication,
            Self::CloudRequestFailed(_) | Self::CloudInvalidResponse(_) => ErrorCategory::Cloud,
            Self::PushChannelFailsafe { .. } => ErrorCategory::PushChannel,
            Self::BluetoothAdapterNotFound | Self::RadioFault(_) => ErrorCategory::RadioFault,
            Self::ConfigParseError(_) | Self::ConfigValidationError(_) => ErrorCategory::Config,
            Self::ActuatorFailed(_) => ErrorCategory::Actuator,
        }
    }

    /// Returns `true` if the error is transient and the session loop should
    /// simply back off and try again.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Discovery
                | ErrorCategory::Connection
                | ErrorCategory::Protocol
                | ErrorCategory::Authentication
                | ErrorCategory::Cloud
                | ErrorCategory::PushChannel
                | ErrorCategory::Actuator
        )
    }

    /// Returns `true` if recovery needs a full reset of the radio stack.
    #[inline]
    #[must_use]
    pub const fn is_radio_fault(&self) -> bool {
        matches!(self.category(), ErrorCategory::RadioFault)
    }

    /// Returns `true` if the error is a configuration problem.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Config)
    }

    /// Returns a machine-readable error code for status reporting.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterNotFound => "BLUETOOTH_ADAPTER_NOT_FOUND",
            Self::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::ProtocolError(_) => "PROTOCOL_ERROR",
            Self::RadioFault(_) => "RADIO_FAULT",
            Self::AccessDenied(_) => "ACCESS_DENIED",
            Self::KeyMismatch { .. } => "KEY_MISMATCH",
            Self::CloudRequestFailed(_) => "CLOUD_REQUEST_FAILED",
            Self::CloudInvalidResponse(_) => "CLOUD_INVALID_RESPONSE",
            Self::PushChannelFailsafe { .. } => "PUSH_CHANNEL_FAILSAFE",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::ActuatorFailed(_) => "ACTUATOR_FAILED",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for KeylessError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::Load(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::Serialize(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::cloud::CloudError> for KeylessError {
    fn from(err: crate::cloud::CloudError) -> Self {
        use crate::cloud::CloudError;
        match err {
            CloudError::Transport(e) => Self::CloudRequestFailed(e.to_string()),
            CloudError::Status { url, status } => {
                Self::CloudRequestFailed(format!("{url} answered HTTP {status}"))
            }
            CloudError::InvalidUrl(e) => Self::ConfigValidationError(e.to_string()),
            CloudError::InvalidToken { numeric_id } => {
                Self::CloudInvalidResponse(format!("secret for device {numeric_id} is not valid hex"))
            }
            CloudError::Deserialization { message, .. } => Self::CloudInvalidResponse(message),
        }
    }
}

impl From<crate::radio::RadioError> for KeylessError {
    fn from(err: crate::radio::RadioError) -> Self {
        use crate::radio::RadioError;
        match err {
            RadioError::AdapterNotFound => Self::BluetoothAdapterNotFound,
            RadioError::DiscoveryFailed { message } => Self::DiscoveryFailed(message),
            RadioError::InvalidAddress { address } => Self::ConnectionFailed {
                address: address.clone(),
                message: format!("invalid Bluetooth address '{address}'"),
            },
            RadioError::ConnectFailed { address, message } => {
                Self::ConnectionFailed { address, message }
            }
            RadioError::ServiceNotFound { address, uuid } => Self::ConnectionFailed {
                address,
                message: format!("service {uuid} not found"),
            },
            RadioError::CharacteristicNotFound { address, uuid } => Self::ConnectionFailed {
                address,
                message: format!("characteristic {uuid} not found"),
            },
            RadioError::WriteFailed { message } | RadioError::ReadFailed { message } => {
                Self::ProtocolError(message)
            }
            RadioError::Internal { message } => Self::RadioFault(message),
        }
    }
}

impl From<crate::actuator::ActuatorError> for KeylessError {
    fn from(err: crate::actuator::ActuatorError) -> Self {
        Self::ActuatorFailed(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
