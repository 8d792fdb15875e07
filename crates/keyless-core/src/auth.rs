//! Challenge-response authentication of a matched device.
//!
//! The controller writes a fresh random nonce to the device's challenge
//! characteristic and expects `HMAC-SHA256(secret, nonce)` back on the
//! response characteristic, either on an immediate read or as a
//! notification. Verification is constant-time.

use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::{KeylessError, Result};
use crate::radio::{AuthLink, GattProfile, RadioError, RadioLink, RadioResult};
use crate::scanner::ScanMatch;
use crate::types::DeviceSecret;

type HmacSha256 = Hmac<Sha256>;

/// Length of a challenge nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Interval between response reads while waiting for an answer.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Generate a nonce from the operating system's CSPRNG.
#[must_use]
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// How a single challenge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The keyed hash verified.
    Verified,
    /// The response carried the configured fallback token.
    FallbackAccepted,
    /// A response arrived but did not verify.
    Failed,
    /// Nothing arrived within the response timeout.
    NoResponse,
}

impl AuthOutcome {
    /// Returns `true` if the device may unlock.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Verified | Self::FallbackAccepted)
    }
}

/// One outstanding challenge. Consumed by [`ChallengeSession::verify`], so a
/// nonce is checked at most once.
#[derive(Debug)]
pub struct ChallengeSession {
    nonce: [u8; NONCE_LEN],
    payload: Vec<u8>,
}

impl ChallengeSession {
    /// Create a challenge with a fresh nonce, optionally followed by the
    /// controller id in the written payload.
    #[must_use]
    pub fn new(controller_id: Option<&str>) -> Self {
        let nonce = generate_nonce();
        let mut payload = nonce.to_vec();
        if let Some(id) = controller_id {
            payload.extend_from_slice(id.as_bytes());
        }
        Self { nonce, payload }
    }

    /// The nonce the response must be computed over.
    #[must_use]
    pub const fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    /// Bytes written to the challenge characteristic.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check `response` against `HMAC-SHA256(key, nonce)`, then against the
    /// fallback token suffix if one is enabled.
    #[must_use]
    pub fn verify(self, key: &[u8], response: &[u8], fallback: Option<&[u8]>) -> AuthOutcome {
        if response.is_empty() {
            return AuthOutcome::NoResponse;
        }

        if let Ok(mut mac) = HmacSha256::new_from_slice(key) {
            mac.update(&self.nonce);
            if mac.verify_slice(response).is_ok() {
                return AuthOutcome::Verified;
            }
        }

        match fallback {
            Some(token) if !token.is_empty() && response.ends_with(token) => {
                AuthOutcome::FallbackAccepted
            }
            _ => AuthOutcome::Failed,
        }
    }
}

/// Result of authenticating one matched device.
#[derive(Debug, Clone)]
pub struct AuthReport {
    /// The device may unlock.
    pub success: bool,
    /// Some response bytes arrived, valid or not.
    pub response_received: bool,
    /// Outcome of the last attempt.
    pub outcome: AuthOutcome,
    /// Connection attempts made.
    pub attempts: u32,
    /// Transport error that ended the last attempt, if any.
    pub error: Option<RadioError>,
}

impl AuthReport {
    fn from_outcome(outcome: AuthOutcome, attempts: u32) -> Self {
        Self {
            success: outcome.is_success(),
            response_received: matches!(
                outcome,
                AuthOutcome::Verified | AuthOutcome::FallbackAccepted | AuthOutcome::Failed
            ),
            outcome,
            attempts,
            error: None,
        }
    }

    fn transport_failure(error: RadioError, attempts: u32) -> Self {
        Self {
            error: Some(error),
            ..Self::from_outcome(AuthOutcome::NoResponse, attempts)
        }
    }
}

/// Runs the challenge-response exchange.
#[derive(Debug, Clone)]
pub struct Authenticator {
    profile: GattProfile,
    response_timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    controller_id: Option<String>,
    fallback: Option<Vec<u8>>,
}

impl Authenticator {
    /// Create an authenticator for `profile` with the given settings.
    #[must_use]
    pub fn new(profile: GattProfile, config: &AuthConfig, controller_id: &str) -> Self {
        Self {
            profile,
            response_timeout: config.response_timeout(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            controller_id: config
                .append_controller_id
                .then(|| controller_id.to_string()),
            fallback: config.fallback_token_bytes(),
        }
    }

    /// Authenticate the device behind `found` using `secret`.
    ///
    /// Transport failures are retried on a fresh connection; a rejected or
    /// missing response is final. The connection is closed after every
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns [`KeylessError::KeyMismatch`] if `secret` was issued for a
    /// different device than the one matched.
    pub async fn perform<R>(
        &self,
        radio: &R,
        found: &ScanMatch,
        secret: &DeviceSecret,
    ) -> Result<AuthReport>
    where
        R: RadioLink + ?Sized,
    {
        if secret.numeric_id() != found.device.numeric_id {
            return Err(KeylessError::KeyMismatch {
                expected: found.device.numeric_id,
                actual: secret.numeric_id(),
            });
        }

        let address = found.address();
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(address, attempt, "Starting challenge-response");

            match self.attempt(radio, address, secret).await {
                Ok(outcome) => {
                    info!(address, attempt, ?outcome, "Challenge-response finished");
                    return Ok(AuthReport::from_outcome(outcome, attempt));
                }
                Err(e) if e.is_transport() && attempt < self.max_attempts => {
                    warn!(address, attempt, error = %e, "Authentication attempt failed, retrying");
                    if let Err(e) = radio.recover(address).await {
                        debug!(address, error = %e, "Radio recovery failed");
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    warn!(address, attempt, error = %e, "Authentication gave up");
                    return Ok(AuthReport::transport_failure(e, attempt));
                }
            }
        }
    }

    async fn attempt<R>(
        &self,
        radio: &R,
        address: &str,
        secret: &DeviceSecret,
    ) -> RadioResult<AuthOutcome>
    where
        R: RadioLink + ?Sized,
    {
        let mut link = radio.connect(address, &self.profile).await?;
        let result = self.exchange(link.as_mut(), secret).await;
        if let Err(e) = link.disconnect().await {
            debug!(address, error = %e, "Disconnect after challenge failed");
        }
        result
    }

    async fn exchange(
        &self,
        link: &mut dyn AuthLink,
        secret: &DeviceSecret,
    ) -> RadioResult<AuthOutcome> {
        // Armed before the write so an early notification is not lost.
        let mut notifications = match link.subscribe_response().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                debug!(error = %e, "Response notifications unavailable, polling reads");
                None
            }
        };

        let challenge = ChallengeSession::new(self.controller_id.as_deref());
        link.write_challenge(challenge.payload()).await?;

        let response = self.await_response(link, notifications.as_mut()).await;
        Ok(challenge.verify(secret.key(), &response, self.fallback.as_deref()))
    }

    /// First non-empty response from an immediate read, a notification or a
    /// polled read, or empty once the response timeout elapses.
    async fn await_response(
        &self,
        link: &mut dyn AuthLink,
        mut notifications: Option<&mut mpsc::Receiver<Vec<u8>>>,
    ) -> Vec<u8> {
        let deadline = Instant::now() + self.response_timeout;

        match tokio::time::timeout_at(deadline, link.read_response()).await {
            Ok(Ok(value)) if !value.is_empty() => return value,
            Ok(Err(e)) => debug!(error = %e, "Immediate read failed"),
            _ => {}
        }

        let mut subscribed = notifications.is_some();
        let mut poll = tokio::time::interval_at(Instant::now() + READ_POLL_INTERVAL, READ_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Vec::new(),
                value = next_notification(notifications.as_deref_mut()), if subscribed => match value {
                    Some(value) if !value.is_empty() => return value,
                    Some(_) => {}
                    None => {
                        debug!("Notification stream closed, polling reads only");
                        subscribed = false;
                    }
                },
                _ = poll.tick() => {
                    match tokio::time::timeout_at(deadline, link.read_response()).await {
                        Ok(Ok(value)) if !value.is_empty() => return value,
                        Ok(Err(e)) => debug!(error = %e, "Polled read failed"),
                        _ => {}
                    }
                }
            }
        }
    }
}

async fn next_notification(rx: Option<&mut mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::RadioConfig;
    use crate::radio::mock::{MockRadio, PeerBehavior, ResponsePath};
    use crate::scanner::{find_authorized_device, ScanConfig};
    use crate::types::{Advertisement, AuthorizedDevice, DeviceStatus};

    const ADDRESS: &str = "A4:FC:77:5C:B3:90";
    const DEVICE_ID: [u8; 8] = [0x6f, 0x0e, 0x2d, 0x2f, 0x34, 0xa1, 0xf4, 0xf8];
    const KEY: &[u8] = b"shared-secret-of-device-2";

    fn advertising_radio() -> MockRadio {
        MockRadio::new().with_advertisement(Advertisement {
            address: ADDRESS.to_string(),
            name: Some("Pixel 8".to_string()),
            vendor_id: 0xFFFF,
            payload: DEVICE_ID.to_vec(),
            rssi: -50,
        })
    }

    async fn matched(radio: &MockRadio) -> ScanMatch {
        let config = ScanConfig::new(
            vec![AuthorizedDevice {
                numeric_id: 2,
                device_id: DEVICE_ID.to_vec(),
                status: DeviceStatus::Active,
            }],
            0xFFFF,
            Duration::from_secs(5),
        );
        find_authorized_device(radio, &config)
            .await
            .unwrap()
            .expect("mock advertisement matches")
    }

    fn authenticator(config: &AuthConfig) -> Authenticator {
        let profile = GattProfile::from_config(&RadioConfig::default()).unwrap();
        Authenticator::new(profile, config, "A116G61")
    }

    fn hmac_peer(key: &[u8], via: ResponsePath) -> PeerBehavior {
        PeerBehavior::Hmac {
            key: key.to_vec(),
            via,
        }
    }

    #[test]
    fn test_nonces_are_unique() {
        let nonces: HashSet<[u8; NONCE_LEN]> = (0..1000).map(|_| generate_nonce()).collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[test]
    fn test_verify_outcomes() {
        let challenge = ChallengeSession::new(None);
        let mut mac = HmacSha256::new_from_slice(KEY).unwrap();
        mac.update(challenge.nonce());
        let good = mac.finalize().into_bytes().to_vec();
        assert_eq!(challenge.verify(KEY, &good, None), AuthOutcome::Verified);

        let challenge = ChallengeSession::new(None);
        assert_eq!(challenge.verify(KEY, &good, None), AuthOutcome::Failed);

        let challenge = ChallengeSession::new(None);
        assert_eq!(challenge.verify(KEY, &[], None), AuthOutcome::NoResponse);

        let challenge = ChallengeSession::new(None);
        let token = [0xDE, 0xAD, 0xBE, 0xEF];
        assert_eq!(
            challenge.verify(KEY, &[0x01, 0xDE, 0xAD, 0xBE, 0xEF], Some(&token[..])),
            AuthOutcome::FallbackAccepted
        );
    }

    #[test]
    fn test_payload_carries_controller_id() {
        let challenge = ChallengeSession::new(Some("A116G61"));
        assert_eq!(challenge.payload().len(), NONCE_LEN + 7);
        assert_eq!(&challenge.payload()[..NONCE_LEN], challenge.nonce());
        assert_eq!(&challenge.payload()[NONCE_LEN..], b"A116G61");
    }

    #[tokio::test(start_paused = true)]
    async fn test_correct_key_over_read() {
        let radio = advertising_radio().with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Read));
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.response_received);
        assert_eq!(report.outcome, AuthOutcome::Verified);
        assert_eq!(report.attempts, 1);
        assert_eq!(radio.written_challenges()[0].len(), NONCE_LEN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_read_while_subscribed() {
        let radio = advertising_radio().with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::LateRead));
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.response_received);
        assert_eq!(report.outcome, AuthOutcome::Verified);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_correct_key_over_notification() {
        let radio = advertising_radio().with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Notify));
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.outcome, AuthOutcome::Verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_key_is_rejected_with_response() {
        let radio =
            advertising_radio().with_peer(ADDRESS, hmac_peer(b"another-key", ResponsePath::Read));
        let found = matched(&radio).await;
        let config = AuthConfig {
            fallback_token: None,
            ..AuthConfig::default()
        };

        let report = authenticator(&config)
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(report.response_received);
        assert_eq!(report.outcome, AuthOutcome::Failed);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_is_no_response() {
        let radio = advertising_radio().with_peer(ADDRESS, PeerBehavior::Silent);
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(!report.response_received);
        assert_eq!(report.outcome, AuthOutcome::NoResponse);
        assert!(report.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_token_can_be_disabled() {
        let answer = vec![0x00, 0x11, 0xDE, 0xAD, 0xBE, 0xEF];
        let radio = advertising_radio().with_peer(ADDRESS, PeerBehavior::Fixed(answer));
        let found = matched(&radio).await;
        let secret = DeviceSecret::new(2, KEY.to_vec());

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &secret)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.outcome, AuthOutcome::FallbackAccepted);

        let strict = AuthConfig {
            fallback_token: None,
            ..AuthConfig::default()
        };
        let report = authenticator(&strict)
            .perform(&radio, &found, &secret)
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.outcome, AuthOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_are_retried() {
        let radio = advertising_radio()
            .with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Read))
            .failing_connects(ADDRESS, 2);
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.attempts, 3);
        assert_eq!(radio.connect_count(), 3);
        assert_eq!(radio.recover_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let radio = advertising_radio()
            .with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Read))
            .failing_connects(ADDRESS, 10);
        let found = matched(&radio).await;

        let report = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(2, KEY.to_vec()))
            .await
            .unwrap();

        assert!(!report.success);
        assert!(!report.response_received);
        assert_eq!(report.attempts, 3);
        assert!(matches!(report.error, Some(RadioError::ConnectFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_mismatch_precedes_radio_traffic() {
        let radio = advertising_radio().with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Read));
        let found = matched(&radio).await;

        let err = authenticator(&AuthConfig::default())
            .perform(&radio, &found, &DeviceSecret::new(3, KEY.to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            KeylessError::KeyMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(radio.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_uses_a_fresh_nonce() {
        let radio = advertising_radio().with_peer(ADDRESS, hmac_peer(KEY, ResponsePath::Read));
        let found = matched(&radio).await;
        let auth = authenticator(&AuthConfig {
            append_controller_id: true,
            ..AuthConfig::default()
        });
        let secret = DeviceSecret::new(2, KEY.to_vec());

        auth.perform(&radio, &found, &secret).await.unwrap();
        auth.perform(&radio, &found, &secret).await.unwrap();

        let written = radio.written_challenges();
        assert_eq!(written.len(), 2);
        assert_ne!(written[0][..NONCE_LEN], written[1][..NONCE_LEN]);
        assert!(written[0].ends_with(b"A116G61"));
    }
}
