//! Session orchestrator.
//!
//! The top-level state machine of the controller. Each cycle:
//!
//! 1. polls the cloud for remote mode and, if requested, follows the remote
//!    command stream until it ends;
//! 2. fetches the authorized-device list and scans for a match;
//! 3. fetches the matched device's secret and runs the challenge-response;
//! 4. unlocks and runs the proximity monitor and the session override
//!    channel side by side until one of them ends the session;
//! 5. re-locks.
//!
//! Every path out of the unlocked state commands the lock first. Radio
//! faults end in a hard reset of the adapter instead of a process restart.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actuator::{LockActuator, TrackedActuator};
use crate::auth::Authenticator;
use crate::cloud::{ChannelKind, CloudClient};
use crate::config::Config;
use crate::error::{KeylessError, Result};
use crate::proximity::{
    MonitorMode, MonitorOutcome, ProximityMonitor, Unconditional, UnlockAcknowledger,
};
use crate::radio::{GattProfile, RadioLink};
use crate::remote::{failsafe_secs, OverrideChannel, OverrideOutcome};
use crate::scanner::{find_authorized_device, ScanConfig, ScanMatch};
use crate::types::{AccessResult, SessionState, StatusSnapshot};

/// Device name reported when no device is involved.
const NO_DEVICE_NAME: &str = "N/A";
const NO_DEVICE_ID: &str = "None";

/// Why an unlocked session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelockReason {
    /// The proximity monitor lost the device.
    DeviceLeft,
    /// The cloud sent LOCK.
    CloudLocked,
    /// The cloud sent EXIT.
    CloudExit,
    /// The override channel was down past the failsafe timeout.
    Failsafe,
}

/// How one orchestrator cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The registry was empty or unreachable.
    NoDevices,
    /// No authorized device advertised during the scan window.
    NoMatch,
    /// The session could not start: secret unavailable or issued for
    /// another device.
    SessionAborted,
    /// Challenge-response failed.
    AuthFailed {
        /// The device answered, but wrongly.
        response_received: bool,
    },
    /// An unlocked session ended and the machine was locked.
    Relocked(RelockReason),
    /// Remote mode ended.
    RemoteSessionEnded,
    /// The radio stack was reset after repeated faults.
    HardReset,
    /// The stop token fired.
    Stopped,
}

/// Identity of the device in the current session, for cloud events.
#[derive(Debug, Clone)]
struct SessionDevice {
    name: String,
    address: String,
    device_id_hex: String,
}

impl SessionDevice {
    fn from_match(found: &ScanMatch) -> Self {
        Self {
            name: found.display_name().to_string(),
            address: found.address().to_string(),
            device_id_hex: found.device.device_id_hex(),
        }
    }
}

/// Drives the controller's session loop.
pub struct Orchestrator<R, A> {
    radio: R,
    actuator: TrackedActuator<A>,
    cloud: CloudClient,
    authenticator: Authenticator,
    acknowledger: Box<dyn UnlockAcknowledger>,
    config: Config,
    status: watch::Sender<StatusSnapshot>,
    radio_faults: u32,
    hard_resets: u32,
}

impl<R, A> Orchestrator<R, A>
where
    R: RadioLink,
    A: LockActuator,
{
    /// Build an orchestrator from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the cloud client or the GATT profile cannot be
    /// built from `config`.
    pub fn new(radio: R, actuator: A, config: Config) -> Result<Self> {
        let cloud = CloudClient::new(&config.cloud, &config.controller.rcu_id)?;
        let profile = GattProfile::from_config(&config.radio)?;
        let authenticator = Authenticator::new(profile, &config.auth, &config.controller.rcu_id);
        let (status, _) = watch::channel(StatusSnapshot::default());

        Ok(Self {
            radio,
            actuator: TrackedActuator::new(actuator),
            cloud,
            authenticator,
            acknowledger: Box::new(Unconditional),
            config,
            status,
            radio_faults: 0,
            hard_resets: 0,
        })
    }

    /// Use `acknowledger` to confirm unlocks in gate mode.
    #[must_use]
    pub fn with_acknowledger(mut self, acknowledger: impl UnlockAcknowledger + 'static) -> Self {
        self.acknowledger = Box::new(acknowledger);
        self
    }

    /// Receiver for status snapshots.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// The tracked lock output.
    pub const fn actuator(&self) -> &TrackedActuator<A> {
        &self.actuator
    }

    /// The radio.
    pub const fn radio(&self) -> &R {
        &self.radio
    }

    /// Run cycles until `shutdown` fires, then lock and return.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(rcu_id = %self.config.controller.rcu_id, "Session loop started");
        self.actuator.lock().await;

        while !shutdown.is_cancelled() {
            let outcome = self.run_cycle(&shutdown).await;
            debug!(?outcome, "Cycle finished");
            if outcome == CycleOutcome::Stopped {
                break;
            }

            let pause = self.backoff(outcome);
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        self.actuator.lock().await;
        self.set_state(SessionState::Idle).await;
        info!("Session loop stopped, machine locked");
    }

    /// Pause before the next cycle.
    const fn backoff(&self, outcome: CycleOutcome) -> Duration {
        let backoff = &self.config.backoff;
        match outcome {
            CycleOutcome::NoDevices => backoff.registry_retry(),
            CycleOutcome::NoMatch => backoff.no_match(),
            CycleOutcome::SessionAborted | CycleOutcome::AuthFailed { .. } => {
                backoff.auth_failure()
            }
            CycleOutcome::Relocked(_)
            | CycleOutcome::RemoteSessionEnded
            | CycleOutcome::HardReset => backoff.after_relock(),
            CycleOutcome::Stopped => Duration::ZERO,
        }
    }

    /// Run one cycle from Idle back to Idle.
    pub async fn run_cycle(&mut self, stop: &CancellationToken) -> CycleOutcome {
        self.set_device(None);
        self.set_state(SessionState::Idle).await;

        if self.remote_mode_requested().await {
            return self.run_remote_mode(stop).await;
        }

        self.set_state(SessionState::Scanning).await;
        let devices = match self.cloud.fetch_authorized_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                self.record_error(&e.into());
                return CycleOutcome::NoDevices;
            }
        };
        let scan = ScanConfig::new(devices, self.config.radio.vendor_id, self.config.scan.window());
        if scan.authorized.is_empty() {
            info!("No active authorized devices registered");
            return CycleOutcome::NoDevices;
        }
        debug!(devices = scan.authorized.len(), "Scanning for authorized devices");

        let scanned = tokio::select! {
            biased;
            () = stop.cancelled() => return CycleOutcome::Stopped,
            scanned = find_authorized_device(&self.radio, &scan) => scanned,
        };
        let mut found = match scanned {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("No authorized device in range");
                return CycleOutcome::NoMatch;
            }
            Err(e) => {
                self.record_error(&e);
                if e.is_radio_fault() {
                    return self.hard_reset(None, "radio stack fault during scan").await;
                }
                return CycleOutcome::NoMatch;
            }
        };
        let device = SessionDevice::from_match(&found);
        self.set_device(Some(&device));

        let secret = match self.cloud.fetch_device_secret(found.device.numeric_id).await {
            Ok(secret) => secret,
            Err(e) => {
                self.actuator.lock().await;
                self.record_error(&e.into());
                return CycleOutcome::SessionAborted;
            }
        };

        self.set_state(SessionState::Authenticating).await;
        let report = self.authenticator.perform(&self.radio, &found, &secret).await;
        drop(secret);
        found.end_observation();

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.actuator.lock().await;
                self.record_error(&e);
                if e.is_radio_fault() {
                    return self
                        .hard_reset(Some(&device), "radio stack fault during authentication")
                        .await;
                }
                return CycleOutcome::SessionAborted;
            }
        };

        if !report.success {
            self.actuator.lock().await;
            if report.response_received {
                warn!(address = %device.address, "Access denied");
                self.radio_faults = 0;
                self.record_error(&KeylessError::AccessDenied(device.name.clone()));
                self.notify(Some(&device), AccessResult::AccessDenied).await;
            } else {
                self.radio_faults += 1;
                let fault = report.error.map(KeylessError::from);
                if let Some(e) = &fault {
                    self.record_error(e);
                    if e.is_radio_fault() {
                        return self
                            .hard_reset(Some(&device), "radio stack fault during authentication")
                            .await;
                    }
                }
                warn!(
                    address = %device.address,
                    radio_faults = self.radio_faults,
                    "Device did not answer the challenge"
                );
                if self.radio_faults >= self.config.session.radio_fault_limit {
                    return self
                        .hard_reset(Some(&device), "authentication repeatedly got no answer")
                        .await;
                }
            }
            self.publish_counters();
            return CycleOutcome::AuthFailed {
                response_received: report.response_received,
            };
        }

        self.radio_faults = 0;
        self.publish_counters();
        info!(
            address = %device.address,
            name = %device.name,
            outcome = ?report.outcome,
            "Device authenticated"
        );
        self.notify(Some(&device), AccessResult::Authenticated).await;

        self.run_unlocked(&device, stop).await
    }

    async fn run_unlocked(
        &mut self,
        device: &SessionDevice,
        stop: &CancellationToken,
    ) -> CycleOutcome {
        if self.config.proximity.gate_before_unlock {
            let gate = ProximityMonitor::new(
                &self.radio,
                &self.actuator,
                &self.config.proximity,
                self.acknowledger.as_ref(),
            )
            .run(&device.address, MonitorMode::Gate, stop)
            .await;
            match gate {
                MonitorOutcome::UnlockCommanded => {}
                MonitorOutcome::Relock => {
                    return self.relock(device, RelockReason::DeviceLeft).await
                }
                MonitorOutcome::Error => {
                    return self.hard_reset(Some(device), "signal sampling kept failing").await
                }
                MonitorOutcome::Cancelled => {
                    self.actuator.lock().await;
                    return CycleOutcome::Stopped;
                }
            }
        } else {
            self.actuator.unlock().await;
        }
        self.set_state(SessionState::Unlocked).await;

        let session_stop = stop.child_token();
        let monitor = ProximityMonitor::new(
            &self.radio,
            &self.actuator,
            &self.config.proximity,
            self.acknowledger.as_ref(),
        );
        let channel = OverrideChannel::new(&self.cloud, &self.actuator, &self.config.remote)
            .ending(&session_stop);

        let (monitor_outcome, channel_outcome) = tokio::join!(
            async {
                let outcome = monitor.run(&device.address, MonitorMode::Watch, &session_stop).await;
                session_stop.cancel();
                outcome
            },
            async {
                let outcome = channel.run(ChannelKind::Session, &session_stop).await;
                session_stop.cancel();
                outcome
            },
        );
        debug!(?monitor_outcome, ?channel_outcome, "Unlocked session finished");

        let reason = match (monitor_outcome, channel_outcome) {
            (MonitorOutcome::Error, _) => {
                return self.hard_reset(Some(device), "signal sampling kept failing").await
            }
            (_, OverrideOutcome::Failsafe) => RelockReason::Failsafe,
            (_, OverrideOutcome::Locked) => RelockReason::CloudLocked,
            (_, OverrideOutcome::Exit) => RelockReason::CloudExit,
            (MonitorOutcome::Relock, _) => RelockReason::DeviceLeft,
            _ => {
                self.actuator.lock().await;
                return CycleOutcome::Stopped;
            }
        };
        self.relock(device, reason).await
    }

    async fn relock(&mut self, device: &SessionDevice, reason: RelockReason) -> CycleOutcome {
        self.set_state(SessionState::ReLocking).await;
        self.actuator.lock().await;
        info!(address = %device.address, ?reason, "Session ended, machine locked");

        if reason == RelockReason::Failsafe {
            self.record_error(&KeylessError::PushChannelFailsafe {
                timeout_secs: failsafe_secs(&self.config.remote),
            });
        }
        self.notify(Some(device), AccessResult::Locked).await;
        CycleOutcome::Relocked(reason)
    }

    async fn hard_reset(&mut self, device: Option<&SessionDevice>, cause: &str) -> CycleOutcome {
        self.set_state(SessionState::ReLocking).await;
        self.actuator.lock().await;
        error!(cause, "Radio fault, resetting adapter");
        self.record_error(&KeylessError::RadioFault(cause.to_string()));

        if let Err(e) = self.radio.reset().await {
            error!(error = %e, "Adapter reset failed");
        }
        self.radio_faults = 0;
        self.hard_resets += 1;
        self.publish_counters();

        self.notify(device, AccessResult::Error).await;
        CycleOutcome::HardReset
    }

    async fn remote_mode_requested(&self) -> bool {
        match self.cloud.check_remote_mode().await {
            Ok(requested) => requested,
            Err(e) => {
                debug!(error = %e, "Remote status unavailable");
                false
            }
        }
    }

    async fn run_remote_mode(&mut self, stop: &CancellationToken) -> CycleOutcome {
        info!("Remote mode requested");
        self.set_state(SessionState::RemoteMode).await;

        let outcome = OverrideChannel::new(&self.cloud, &self.actuator, &self.config.remote)
            .run(ChannelKind::Remote, stop)
            .await;

        self.actuator.lock().await;
        match outcome {
            OverrideOutcome::Stopped => CycleOutcome::Stopped,
            OverrideOutcome::Failsafe => {
                self.record_error(&KeylessError::PushChannelFailsafe {
                    timeout_secs: failsafe_secs(&self.config.remote),
                });
                CycleOutcome::RemoteSessionEnded
            }
            OverrideOutcome::Exit | OverrideOutcome::Locked => {
                info!("Remote mode ended");
                CycleOutcome::RemoteSessionEnded
            }
        }
    }

    async fn notify(&self, device: Option<&SessionDevice>, result: AccessResult) {
        let (name, id) = device.map_or((NO_DEVICE_NAME, NO_DEVICE_ID), |d| {
            (d.name.as_str(), d.device_id_hex.as_str())
        });
        match self.cloud.notify_event(name, id, result).await {
            Ok(()) => {
                self.status.send_modify(|s| s.last_outcome = Some(result));
            }
            Err(e) => warn!(error = %e, ?result, "Failed to report outcome"),
        }
    }

    async fn set_state(&self, state: SessionState) {
        let locked = self.actuator.current().await;
        self.status.send_if_modified(|s| {
            let changed = s.state != state || s.locked != locked;
            if s.state != state {
                debug!(from = %s.state, to = %state, "State change");
                s.since_utc = Utc::now();
            }
            s.state = state;
            s.locked = locked;
            changed
        });
    }

    fn set_device(&self, device: Option<&SessionDevice>) {
        self.status.send_modify(|s| {
            s.device_name = device.map(|d| d.name.clone());
            s.device_address = device.map(|d| d.address.clone());
        });
    }

    fn record_error(&self, err: &KeylessError) {
        if err.is_recoverable() {
            warn!(code = err.error_code(), error = %err, "Session error");
        } else {
            error!(code = err.error_code(), error = %err, "Session error");
        }
        let code = err.error_code().to_string();
        self.status.send_modify(|s| s.last_error_code = Some(code));
    }

    fn publish_counters(&self) {
        let (radio_faults, hard_resets) = (self.radio_faults, self.hard_resets);
        self.status.send_modify(|s| {
            s.consecutive_radio_faults = radio_faults;
            s.hard_resets = hard_resets;
        });
    }
}
