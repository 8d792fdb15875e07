//! HTTP client for the cloud device registry.
//!
//! Covers every cloud call the controller makes:
//! - the authorized-device list of this controller
//! - the shared secret of one device
//! - outcome notifications for the event log
//! - the remote-mode status poll
//! - server-sent event streams for the override channels
//!
//! Request/response calls use a client with a total timeout; push streams
//! use a second client with only a connect timeout so long-lived responses
//! are not cut off.

use std::fmt;

use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::CloudConfig;
use crate::types::{AccessResult, AuthorizedDevice, DeviceSecret, DeviceStatus};

/// Status text that requests remote mode.
pub const REMOTE_MODE_REQUESTED: &str = "remote mode requested";

const USER_AGENT: &str = concat!("keyless/", env!("CARGO_PKG_VERSION"));

/// Longest response excerpt kept in errors.
const BODY_PREVIEW_LEN: usize = 200;

/// Result alias for cloud calls.
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Errors raised by cloud calls.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Connection, timeout or body transfer failure.
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("{url} answered HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// An endpoint URL could not be built.
    #[error("invalid cloud URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The device secret is missing or not even-length hex.
    #[error("secret for device {numeric_id} is not valid hex")]
    InvalidToken {
        /// Device the secret was requested for.
        numeric_id: u64,
    },

    /// The response body could not be interpreted.
    #[error("unexpected response: {message}")]
    Deserialization {
        /// What went wrong.
        message: String,
        /// Start of the offending body.
        body: String,
    },
}

/// Which push stream to subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Override stream while a device session is unlocked.
    Session,
    /// Command stream of remote mode.
    Remote,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Session => "session",
            Self::Remote => "remote",
        })
    }
}

/// Registry answer: a list, or a single object for single-device setups.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryPayload {
    Many(Vec<RegistryEntry>),
    One(RegistryEntry),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryEntry {
    id: u64,
    device_id: String,
    #[serde(default)]
    status: Option<String>,
}

impl RegistryEntry {
    fn into_device(self) -> Option<AuthorizedDevice> {
        let hex_id = self.device_id.trim().to_lowercase();
        let device_id = match hex::decode(&hex_id) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                warn!(id = self.id, device_id = %self.device_id, "Skipping device with invalid id");
                return None;
            }
        };
        let status = match self.status.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("inactive") => DeviceStatus::Inactive,
            _ => DeviceStatus::Active,
        };
        Some(AuthorizedDevice {
            numeric_id: self.id,
            device_id,
            status,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    rcu_id: &'a str,
    device_name: &'a str,
    device_id: &'a str,
    result: AccessResult,
}

fn body_preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_LEN).collect()
}

fn check_status(resp: Response) -> CloudResult<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(CloudError::Status {
            url: resp.url().to_string(),
            status: status.as_u16(),
        })
    }
}

/// Pick `key` out of a JSON object body, or use the whole body as text.
fn field_or_text(body: &str, keys: &[&str]) -> String {
    let value = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => keys
            .iter()
            .find_map(|k| map.get(*k))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        Ok(serde_json::Value::String(s)) => s,
        _ => body.to_string(),
    };
    value.trim().to_string()
}

/// Client for the controller's cloud API.
#[derive(Debug, Clone)]
pub struct CloudClient {
    base: Url,
    rcu_id: String,
    http: Client,
    stream_http: Client,
}

impl CloudClient {
    /// Create a client for controller `rcu_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: &CloudConfig, rcu_id: &str) -> CloudResult<Self> {
        let base = Url::parse(&config.base_url)?;
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;
        let stream_http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            base,
            rcu_id: rcu_id.to_string(),
            http,
            stream_http,
        })
    }

    /// Id of the controller this client speaks for.
    #[must_use]
    pub fn rcu_id(&self) -> &str {
        &self.rcu_id
    }

    /// `{base}/api/{segments...}`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> CloudResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    async fn get_text(&self, url: Url, accept: &str) -> CloudResult<String> {
        debug!(%url, "GET");
        let resp = self.http.get(url).header(ACCEPT, accept).send().await?;
        Ok(check_status(resp)?.text().await?)
    }

    /// Fetch the devices registered for this controller.
    ///
    /// Entries with an invalid identifier are skipped; an empty or `null`
    /// body means no devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails or the body is not a device list.
    pub async fn fetch_authorized_devices(&self) -> CloudResult<Vec<AuthorizedDevice>> {
        let url = self.endpoint(&["rcu", &self.rcu_id, "smartphones"])?;
        let body = self.get_text(url, "application/json").await?;
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }

        let payload: RegistryPayload =
            serde_json::from_str(trimmed).map_err(|e| CloudError::Deserialization {
                message: format!("device list: {e}"),
                body: body_preview(trimmed),
            })?;
        let entries = match payload {
            RegistryPayload::Many(entries) => entries,
            RegistryPayload::One(entry) => vec![entry],
        };

        Ok(entries
            .into_iter()
            .filter_map(RegistryEntry::into_device)
            .collect())
    }

    /// Fetch the shared secret of device `numeric_id`.
    ///
    /// Accepts `{"token": "<hex>"}`, `{"auth_token": "<hex>"}` or the hex
    /// string as plain text.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::InvalidToken`] if the secret is empty or not
    /// even-length hex.
    pub async fn fetch_device_secret(&self, numeric_id: u64) -> CloudResult<DeviceSecret> {
        let url = self.endpoint(&["devices", "token", &numeric_id.to_string()])?;
        let body = self.get_text(url, "application/json").await?;

        let token = field_or_text(&body, &["token", "auth_token"]).to_lowercase();
        match hex::decode(&token) {
            Ok(key) if !key.is_empty() => Ok(DeviceSecret::new(numeric_id, key)),
            _ => Err(CloudError::InvalidToken { numeric_id }),
        }
    }

    /// Record an access outcome in the cloud event log.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn notify_event(
        &self,
        device_name: &str,
        device_id: &str,
        result: AccessResult,
    ) -> CloudResult<()> {
        let url = self.endpoint(&["rcu", "events", "add"])?;
        let body = EventBody {
            rcu_id: &self.rcu_id,
            device_name,
            device_id,
            result,
        };
        debug!(%url, ?result, device_name, "POST event");
        let resp = self.http.post(url).json(&body).send().await?;
        check_status(resp)?;
        Ok(())
    }

    /// Ask whether remote mode is requested for this controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    pub async fn check_remote_mode(&self) -> CloudResult<bool> {
        let url = self.endpoint(&["rcu", "status", &self.rcu_id])?;
        let body = self.get_text(url, "application/json").await?;
        let status = field_or_text(&body, &["status"]);
        debug!(status, "Remote status");
        Ok(status == REMOTE_MODE_REQUESTED)
    }

    /// Open the server-sent event stream of `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the server does not
    /// answer with a success status.
    pub async fn open_event_stream(&self, kind: ChannelKind) -> CloudResult<Response> {
        let url = match kind {
            ChannelKind::Session => self.endpoint(&["rcu", "sse", &self.rcu_id])?,
            ChannelKind::Remote => self.endpoint(&["rcu", "remote", "sse", &self.rcu_id])?,
        };
        debug!(%url, %kind, "Opening event stream");
        let resp = self
            .stream_http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(resp)
    }
}
