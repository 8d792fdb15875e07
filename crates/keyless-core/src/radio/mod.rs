//! Short-range radio seam.
//!
//! The control logic never talks to a Bluetooth stack directly. It consumes
//! the [`RadioLink`] capability:
//! - advertisement observation ([`RadioLink::observe`])
//! - GATT connections for the challenge-response exchange ([`AuthLink`])
//! - signal-strength sampling for proximity checks
//! - driver cleanup between retries and a full adapter reset
//!
//! Implementations: [`bluez::BluezRadio`] (feature `bluetooth`, Linux/BlueZ
//! via `bluer`) and [`mock::MockRadio`] (feature `mock-bluetooth` and tests).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::config::RadioConfig;
use crate::types::Advertisement;

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;

/// Result alias for radio operations.
pub type RadioResult<T> = std::result::Result<T, RadioError>;

/// Errors reported by a radio implementation.
#[derive(Debug, Clone, Error)]
pub enum RadioError {
    /// No adapter is available.
    #[error("no Bluetooth adapter available")]
    AdapterNotFound,

    /// Observation could not be started or broke down.
    #[error("discovery failed: {message}")]
    DiscoveryFailed {
        /// Underlying failure.
        message: String,
    },

    /// The address is not a valid Bluetooth address.
    #[error("invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// Offending value.
        address: String,
    },

    /// The connection could not be established.
    #[error("connect to {address} failed: {message}")]
    ConnectFailed {
        /// Peer address.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// The peer does not expose the authentication service.
    #[error("{address} has no service {uuid}")]
    ServiceNotFound {
        /// Peer address.
        address: String,
        /// Missing service.
        uuid: String,
    },

    /// The authentication service lacks a characteristic.
    #[error("{address} has no characteristic {uuid}")]
    CharacteristicNotFound {
        /// Peer address.
        address: String,
        /// Missing characteristic.
        uuid: String,
    },

    /// Writing the challenge failed.
    #[error("write failed: {message}")]
    WriteFailed {
        /// Underlying failure.
        message: String,
    },

    /// Reading or subscribing to the response failed.
    #[error("read failed: {message}")]
    ReadFailed {
        /// Underlying failure.
        message: String,
    },

    /// Any other stack failure.
    #[error("radio stack error: {message}")]
    Internal {
        /// Underlying failure.
        message: String,
    },
}

impl RadioError {
    /// Returns `true` for failures of the connection itself, which are worth
    /// a retry on a fresh connection.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::ServiceNotFound { .. }
                | Self::CharacteristicNotFound { .. }
                | Self::WriteFailed { .. }
                | Self::Internal { .. }
        )
    }
}

/// GATT identifiers of the authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    /// Authentication service.
    pub service: Uuid,
    /// Challenge characteristic (write).
    pub challenge: Uuid,
    /// Response characteristic (read and/or notify).
    pub response: Uuid,
}

impl GattProfile {
    /// Build the profile from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::Internal`] if a UUID does not parse.
    pub fn from_config(config: &RadioConfig) -> RadioResult<Self> {
        let parse = |value: &str| {
            Uuid::parse_str(value).map_err(|e| RadioError::Internal {
                message: format!("invalid UUID '{value}': {e}"),
            })
        };
        Ok(Self {
            service: parse(&config.service_uuid)?,
            challenge: parse(&config.challenge_char_uuid)?,
            response: parse(&config.response_char_uuid)?,
        })
    }
}

/// Result of one signal-strength sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSample {
    /// The device was seen with this RSSI (dBm).
    Rssi(i16),
    /// The device was seen but its signal could not be read.
    Unreadable,
    /// The device was not seen during the sample window.
    NotObserved,
}

/// An open advertisement observation.
///
/// Advertisements arrive until the radio ends the observation or the value
/// is dropped; dropping it stops discovery.
pub struct Observation {
    rx: mpsc::Receiver<Advertisement>,
    _guard: DropGuard,
}

impl Observation {
    /// Wrap a receiver fed by the radio; `cancel` is triggered on drop so the
    /// feeding task can stop discovery.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Advertisement>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next advertisement, or `None` once the radio ended the observation.
    pub async fn next(&mut self) -> Option<Advertisement> {
        self.rx.recv().await
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation").finish_non_exhaustive()
    }
}

/// A live connection with the authentication service resolved.
#[async_trait]
pub trait AuthLink: Send {
    /// Arm notifications on the response characteristic.
    async fn subscribe_response(&mut self) -> RadioResult<mpsc::Receiver<Vec<u8>>>;

    /// Write the challenge payload.
    async fn write_challenge(&mut self, payload: &[u8]) -> RadioResult<()>;

    /// Read the response characteristic once.
    async fn read_response(&mut self) -> RadioResult<Vec<u8>>;

    /// Close the connection.
    async fn disconnect(&mut self) -> RadioResult<()>;
}

/// The radio capability consumed by the control logic.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Start observing advertisements.
    async fn observe(&self) -> RadioResult<Observation>;

    /// Connect to `address` and resolve `profile`.
    async fn connect(&self, address: &str, profile: &GattProfile)
        -> RadioResult<Box<dyn AuthLink>>;

    /// Sample the signal strength of `address` for at most `window`.
    async fn sample_signal(&self, address: &str, window: Duration) -> RadioResult<SignalSample>;

    /// Driver-specific cleanup after a failed connection attempt.
    async fn recover(&self, address: &str) -> RadioResult<()>;

    /// Bring the adapter back to a clean state after a radio-stack fault.
    async fn reset(&self) -> RadioResult<()>;
}
