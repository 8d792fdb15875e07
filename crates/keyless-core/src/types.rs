//! Shared domain types and OpenAPI schemas.
//!
//! Most component-specific types live in their modules (scanner, auth,
//! proximity, remote). This module holds the values that cross component
//! boundaries: registry records, advertisements, session state, and the
//! status snapshot exposed by the agent.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Registry status of an authorized device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// The device may unlock the machine.
    Active,
    /// The device is registered but currently revoked.
    Inactive,
}

/// A mobile device registered with the cloud for this controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedDevice {
    /// Registry id, used to fetch the device secret.
    pub numeric_id: u64,
    /// Identifier bytes the device embeds in its advertisement payload.
    pub device_id: Vec<u8>,
    /// Registry status.
    pub status: DeviceStatus,
}

impl AuthorizedDevice {
    /// Lower-case hex rendering of the identifier, as used by the cloud.
    #[must_use]
    pub fn device_id_hex(&self) -> String {
        hex::encode(&self.device_id)
    }

    /// Returns `true` if the device may take part in matching.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }
}

/// Shared secret of one device. The key bytes are zeroized on drop and
/// never printed.
pub struct DeviceSecret {
    numeric_id: u64,
    key: SecretSlice<u8>,
}

impl DeviceSecret {
    /// Wrap key bytes issued for `numeric_id`.
    #[must_use]
    pub fn new(numeric_id: u64, key: Vec<u8>) -> Self {
        Self {
            numeric_id,
            key: SecretSlice::from(key),
        }
    }

    /// Registry id the key was issued for.
    #[must_use]
    pub const fn numeric_id(&self) -> u64 {
        self.numeric_id
    }

    /// Key bytes, for the keyed hash only.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.key.expose_secret()
    }
}

impl fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSecret")
            .field("numeric_id", &self.numeric_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// One observed advertisement frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Bluetooth address (`AA:BB:CC:DD:EE:FF`).
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Manufacturer id of the vendor-specific data.
    pub vendor_id: u16,
    /// Vendor-specific payload bytes.
    pub payload: Vec<u8>,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

impl Advertisement {
    /// Name for logs and cloud events.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("N/A")
    }
}

/// State of the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Between iterations.
    Idle,
    /// Driven by cloud commands only.
    RemoteMode,
    /// Looking for an authorized advertisement.
    Scanning,
    /// Running the challenge-response exchange.
    Authenticating,
    /// Machine released; proximity and override channel active.
    Unlocked,
    /// Stopping the session and locking.
    ReLocking,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::RemoteMode => "remote_mode",
            Self::Scanning => "scanning",
            Self::Authenticating => "authenticating",
            Self::Unlocked => "unlocked",
            Self::ReLocking => "re_locking",
        };
        f.write_str(name)
    }
}

/// Command received over a cloud push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Lock the machine.
    Lock,
    /// Unlock the machine.
    Unlock,
    /// Lock and leave remote mode.
    Exit,
}

impl RemoteEvent {
    /// Parse an event token, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "LOCK" => Some(Self::Lock),
            "UNLOCK" => Some(Self::Unlock),
            "EXIT" => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Outcome vocabulary of the cloud event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum AccessResult {
    /// Challenge-response verified.
    #[serde(rename = "Authenticated")]
    Authenticated,
    /// Authentication attempt failed.
    #[serde(rename = "Failed")]
    Failed,
    /// Session ended because of a fault.
    #[serde(rename = "Error")]
    Error,
    /// Machine locked.
    #[serde(rename = "Verriegelt")]
    Locked,
    /// Machine unlocked.
    #[serde(rename = "Entriegelt")]
    Unlocked,
    /// A response was received and rejected.
    #[serde(rename = "Zugang verweigert")]
    AccessDenied,
    /// Locked by a remote-mode command.
    #[serde(rename = "Remote Verriegelt")]
    RemoteLocked,
    /// Unlocked by a remote-mode command.
    #[serde(rename = "Remote Entriegelt")]
    RemoteUnlocked,
    /// Remote mode ended.
    #[serde(rename = "Fernsteuerung deaktiviert")]
    RemoteDisabled,
}

/// Point-in-time view of the controller, served by the status API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "state": "unlocked",
    "locked": false,
    "device_name": "Pixel 8",
    "device_address": "A4:FC:77:5C:B3:90",
    "last_outcome": "Authenticated",
    "last_error_code": null,
    "consecutive_radio_faults": 0,
    "hard_resets": 0,
    "since_utc": "2025-01-15T03:30:00Z"
}))]
pub struct StatusSnapshot {
    /// Current session state.
    pub state: SessionState,

    /// Last commanded lock state; `None` before the first command.
    pub locked: Option<bool>,

    /// Name of the device in the current session.
    #[schema(example = "Pixel 8")]
    pub device_name: Option<String>,

    /// Address of the device in the current session.
    #[schema(example = "A4:FC:77:5C:B3:90")]
    pub device_address: Option<String>,

    /// Last outcome reported to the cloud.
    pub last_outcome: Option<AccessResult>,

    /// Code of the last error surfaced by the session loop.
    #[schema(example = "PUSH_CHANNEL_FAILSAFE")]
    pub last_error_code: Option<String>,

    /// Authentication attempts in a row that got no answer.
    pub consecutive_radio_faults: u32,

    /// Radio stack resets since start.
    pub hard_resets: u32,

    /// When `state` was entered.
    pub since_utc: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            locked: None,
            device_name: None,
            device_address: None,
            last_outcome: None,
            last_error_code: None,
            consecutive_radio_faults: 0,
            hard_resets: 0,
            since_utc: Utc::now(),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status.
    #[schema(example = "ok")]
    pub status: String,

    /// Service version.
    #[schema(example = "0.1.0")]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_event_parsing_is_case_insensitive() {
        assert_eq!(RemoteEvent::parse("LOCK"), Some(RemoteEvent::Lock));
        assert_eq!(RemoteEvent::parse(" unlock "), Some(RemoteEvent::Unlock));
        assert_eq!(RemoteEvent::parse("Exit"), Some(RemoteEvent::Exit));
        assert_eq!(RemoteEvent::parse("HEARTBEAT_OK"), None);
        assert_eq!(RemoteEvent::parse(""), None);
    }

    #[test]
    fn test_access_result_wire_names() {
        assert_eq!(
            serde_json::to_string(&AccessResult::Locked).unwrap(),
            "\"Verriegelt\""
        );
        assert_eq!(
            serde_json::to_string(&AccessResult::AccessDenied).unwrap(),
            "\"Zugang verweigert\""
        );
        assert_eq!(
            serde_json::to_string(&AccessResult::RemoteDisabled).unwrap(),
            "\"Fernsteuerung deaktiviert\""
        );
    }

    #[test]
    fn test_device_secret_debug_is_redacted() {
        let secret = DeviceSecret::new(2, vec![0x29, 0x66, 0x95, 0xf0]);
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("41"));
        assert_eq!(secret.key(), &[0x29, 0x66, 0x95, 0xf0]);
    }

    #[test]
    fn test_device_id_hex() {
        let device = AuthorizedDevice {
            numeric_id: 2,
            device_id: vec![0x6f, 0x0e, 0x2d, 0x2f],
            status: DeviceStatus::Active,
        };
        assert_eq!(device.device_id_hex(), "6f0e2d2f");
        assert!(device.is_active());
    }

    #[test]
    fn test_status_snapshot_serialization() {
        let snapshot = StatusSnapshot {
            state: SessionState::Unlocked,
            locked: Some(false),
            ..StatusSnapshot::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"state\":\"unlocked\""));
        assert!(json.contains("\"locked\":false"));
    }
}
