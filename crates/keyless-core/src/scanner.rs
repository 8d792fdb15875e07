//! Advertisement matching against the authorized-device list.
//!
//! A scan opens one observation of bounded length and looks for
//! advertisements that carry the configured vendor id and contain one of the
//! authorized identifiers anywhere in their payload.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::Result;
use crate::radio::{Observation, RadioLink};
use crate::types::{Advertisement, AuthorizedDevice};

/// Immutable input of one scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Active authorized devices.
    pub authorized: Vec<AuthorizedDevice>,
    /// Vendor id advertisements must carry.
    pub vendor_id: u16,
    /// Observation window.
    pub window: Duration,
}

impl ScanConfig {
    /// Build a scan configuration, keeping only active devices with a
    /// non-empty identifier.
    #[must_use]
    pub fn new(devices: Vec<AuthorizedDevice>, vendor_id: u16, window: Duration) -> Self {
        let authorized = devices
            .into_iter()
            .filter(|d| d.is_active() && !d.device_id.is_empty())
            .collect();
        Self {
            authorized,
            vendor_id,
            window,
        }
    }
}

/// An authorized device found during a scan.
#[derive(Debug)]
pub struct ScanMatch {
    /// Advertisement that matched (most recent one for its address).
    pub advertisement: Advertisement,
    /// Identifier bytes found in the payload.
    pub device_id: Vec<u8>,
    /// Registry entry of the matched device.
    pub device: AuthorizedDevice,
    observation: Option<Observation>,
}

impl ScanMatch {
    /// Address of the matched advertiser.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.advertisement.address
    }

    /// Name of the matched advertiser for logs and cloud events.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.advertisement.display_name()
    }

    /// Returns `true` while the scan's observation is still running.
    #[must_use]
    pub const fn is_observing(&self) -> bool {
        self.observation.is_some()
    }

    /// Stop the observation the match was found in.
    pub fn end_observation(&mut self) {
        self.observation = None;
    }
}

/// Returns `true` if `needle` occurs as a contiguous run of bytes in
/// `haystack`. An empty needle never matches.
#[must_use]
pub fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Observe advertisements for up to `config.window` and return the best
/// authorized match.
///
/// With exactly one authorized device the first match is returned at once.
/// Otherwise the strongest signal seen during the window wins, ties going to
/// the device seen first.
///
/// # Errors
///
/// Returns an error if the observation cannot be started.
pub async fn find_authorized_device<R>(radio: &R, config: &ScanConfig) -> Result<Option<ScanMatch>>
where
    R: RadioLink + ?Sized,
{
    if config.authorized.is_empty() {
        return Ok(None);
    }

    let mut observation = radio.observe().await?;
    let deadline = Instant::now() + config.window;
    let fast_path = config.authorized.len() == 1;

    let mut logged: HashSet<String> = HashSet::new();
    // (latest advertisement, index into `authorized`), in first-seen order.
    let mut candidates: Vec<(Advertisement, usize)> = Vec::new();

    loop {
        let adv = match tokio::time::timeout_at(deadline, observation.next()).await {
            Ok(Some(adv)) => adv,
            Ok(None) => {
                debug!("Observation ended before the scan window");
                break;
            }
            Err(_) => break,
        };

        if adv.vendor_id != config.vendor_id {
            continue;
        }
        let Some(index) = config
            .authorized
            .iter()
            .position(|d| contains_subsequence(&adv.payload, &d.device_id))
        else {
            continue;
        };

        if logged.insert(adv.address.clone()) {
            info!(
                address = %adv.address,
                name = adv.display_name(),
                rssi = adv.rssi,
                device_id = %config.authorized[index].device_id_hex(),
                "Authorized device advertising"
            );
        }

        if fast_path {
            return Ok(Some(build_match(adv, &config.authorized[index], observation)));
        }

        match candidates
            .iter_mut()
            .find(|(seen, _)| seen.address == adv.address)
        {
            Some(entry) => *entry = (adv, index),
            None => candidates.push((adv, index)),
        }
    }

    let best = candidates.into_iter().reduce(|kept, candidate| {
        if candidate.0.rssi > kept.0.rssi {
            candidate
        } else {
            kept
        }
    });

    Ok(best.map(|(adv, index)| build_match(adv, &config.authorized[index], observation)))
}

fn build_match(adv: Advertisement, device: &AuthorizedDevice, observation: Observation) -> ScanMatch {
    ScanMatch {
        advertisement: adv,
        device_id: device.device_id.clone(),
        device: device.clone(),
        observation: Some(observation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::mock::MockRadio;
    use crate::types::DeviceStatus;

    const VENDOR: u16 = 0xFFFF;

    fn device(numeric_id: u64, device_id: &[u8]) -> AuthorizedDevice {
        AuthorizedDevice {
            numeric_id,
            device_id: device_id.to_vec(),
            status: DeviceStatus::Active,
        }
    }

    fn adv(address: &str, vendor_id: u16, payload: &[u8], rssi: i16) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            name: Some(format!("phone-{}", &address[..2])),
            vendor_id,
            payload: payload.to_vec(),
            rssi,
        }
    }

    fn config(devices: Vec<AuthorizedDevice>) -> ScanConfig {
        ScanConfig::new(devices, VENDOR, Duration::from_secs(10))
    }

    #[test]
    fn test_contains_subsequence() {
        assert!(contains_subsequence(&[0, 1, 2, 3, 4], &[2, 3]));
        assert!(contains_subsequence(&[2, 3], &[2, 3]));
        assert!(!contains_subsequence(&[0, 2, 1, 3], &[2, 3]));
        assert!(!contains_subsequence(&[2], &[2, 3]));
        assert!(!contains_subsequence(&[1, 2, 3], &[]));
    }

    #[test]
    fn test_scan_config_keeps_only_active_devices() {
        let mut revoked = device(3, &[0xAA]);
        revoked.status = DeviceStatus::Inactive;
        let cfg = config(vec![device(2, &[0xBB]), revoked, device(4, &[])]);
        assert_eq!(cfg.authorized.len(), 1);
        assert_eq!(cfg.authorized[0].numeric_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_device_returns_first_match() {
        let id = [0x6f, 0x0e, 0x2d, 0x2f];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &[0x01, 0x6f, 0x0e, 0x2d, 0x2f, 0x99], -70))
            .with_advertisement_after(
                Duration::from_secs(1),
                adv("BB:00:00:00:00:02", VENDOR, &id, -40),
            );

        let started = Instant::now();
        let found = find_authorized_device(&radio, &config(vec![device(2, &id)]))
            .await
            .unwrap()
            .expect("match");

        assert_eq!(found.address(), "AA:00:00:00:00:01");
        assert_eq!(found.device.numeric_id, 2);
        assert!(found.is_observing());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_strongest_signal_wins() {
        let a = [0x01, 0x02, 0x03];
        let b = [0x0a, 0x0b, 0x0c];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &a, -75))
            .with_advertisement(adv("BB:00:00:00:00:02", VENDOR, &b, -60));

        let found = find_authorized_device(&radio, &config(vec![device(1, &a), device(2, &b)]))
            .await
            .unwrap()
            .expect("match");

        assert_eq!(found.address(), "BB:00:00:00:00:02");
        assert_eq!(found.device_id, b.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_go_to_first_seen() {
        let a = [0x01, 0x02, 0x03];
        let b = [0x0a, 0x0b, 0x0c];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &a, -65))
            .with_advertisement(adv("BB:00:00:00:00:02", VENDOR, &b, -65));

        let found = find_authorized_device(&radio, &config(vec![device(1, &a), device(2, &b)]))
            .await
            .unwrap()
            .expect("match");

        assert_eq!(found.address(), "AA:00:00:00:00:01");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_rssi_per_address_is_used() {
        let a = [0x01, 0x02, 0x03];
        let b = [0x0a, 0x0b, 0x0c];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &a, -50))
            .with_advertisement(adv("BB:00:00:00:00:02", VENDOR, &b, -60))
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &a, -90));

        let found = find_authorized_device(&radio, &config(vec![device(1, &a), device(2, &b)]))
            .await
            .unwrap()
            .expect("match");

        assert_eq!(found.address(), "BB:00:00:00:00:02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_vendor_and_unknown_ids_are_ignored() {
        let id = [0x6f, 0x0e, 0x2d, 0x2f];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", 0x004C, &id, -40))
            .with_advertisement(adv("BB:00:00:00:00:02", VENDOR, &[0x6f, 0x0e, 0x2d], -40));

        let found = find_authorized_device(&radio, &config(vec![device(2, &id)]))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_observation_returns_best_so_far() {
        let a = [0x01, 0x02, 0x03];
        let b = [0x0a, 0x0b, 0x0c];
        let radio = MockRadio::new()
            .with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &a, -70))
            .closing_after_script();

        let found = find_authorized_device(&radio, &config(vec![device(1, &a), device(2, &b)]))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(found.device.numeric_id, 1);
    }

    #[tokio::test]
    async fn test_empty_list_skips_observation() {
        let radio = MockRadio::new();
        let found = find_authorized_device(&radio, &config(Vec::new())).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_observation() {
        let id = [0x42, 0x43];
        let radio = MockRadio::new().with_advertisement(adv("AA:00:00:00:00:01", VENDOR, &id, -40));
        let mut found = find_authorized_device(&radio, &config(vec![device(7, &id)]))
            .await
            .unwrap()
            .expect("match");
        found.end_observation();
        assert!(!found.is_observing());
    }
}
