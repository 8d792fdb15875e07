//! # keyless-core
//!
//! Core control logic for the keyless proximity access-control agent.
//!
//! This crate provides:
//! - Discovery and matching of authorized phones by their BLE advertisements
//! - Challenge-response authentication (HMAC-SHA256) over GATT
//! - Proximity re-verification by signal strength while unlocked
//! - A cloud override channel (server-sent events) with a failsafe lock
//! - The session state machine tying these together
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`radio`] - The radio seam ([`RadioLink`]) and its BlueZ and mock implementations
//! - [`scanner`] - Advertisement matching against the authorized-device list
//! - [`auth`] - Challenge-response exchange and verification
//! - [`proximity`] - RSSI-based proximity monitor
//! - [`remote`] - Cloud override channel
//! - [`cloud`] - HTTP client for the device registry
//! - [`actuator`] - Lock output seam and idempotent wrapper
//! - [`session`] - Session orchestrator
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod actuator;
pub mod auth;
pub mod cloud;
pub mod config;
pub mod error;
pub mod proximity;
pub mod radio;
pub mod remote;
pub mod scanner;
pub mod session;
pub mod types;

// Re-export primary types for convenience
pub use actuator::{ActuatorError, LockActuator, TrackedActuator};
pub use auth::{AuthOutcome, AuthReport, Authenticator, ChallengeSession, NONCE_LEN};
pub use cloud::{ChannelKind, CloudClient, CloudError, CloudResult};
pub use config::{
    is_valid_controller_id, ActuatorConfig, ActuatorKind, Config, ConfigError, ConfigResult,
};
pub use error::{ErrorCategory, KeylessError, Result};
pub use proximity::{MonitorMode, MonitorOutcome, ProximityMonitor, UnlockAcknowledger};
#[cfg(feature = "bluetooth")]
pub use radio::bluez::BluezRadio;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub use radio::mock::MockRadio;
pub use radio::{GattProfile, RadioError, RadioLink, RadioResult, SignalSample};
pub use remote::{OverrideChannel, OverrideOutcome};
pub use scanner::{find_authorized_device, ScanConfig, ScanMatch};
pub use session::{CycleOutcome, Orchestrator, RelockReason};
pub use types::{
    AccessResult, AuthorizedDevice, DeviceSecret, HealthResponse, SessionState, StatusSnapshot,
};
