//! Proximity re-verification of the unlocked device.
//!
//! While a session is unlocked the monitor samples the device's signal
//! strength at a fixed interval. Strong samples keep (or put) the machine
//! unlocked; weak or missing samples lock it and count towards departure.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actuator::{LockActuator, TrackedActuator};
use crate::config::ProximityConfig;
use crate::radio::{RadioLink, SignalSample};

/// What the monitor is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Keep watching an unlocked session until the device leaves.
    Watch,
    /// Hold the machine locked until the device is near and has
    /// acknowledged the unlock.
    Gate,
}

/// Why the monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Gate mode: the device came close and the unlock was commanded.
    UnlockCommanded,
    /// The device is considered gone.
    Relock,
    /// Sampling kept failing; the radio stack needs a reset.
    Error,
    /// The stop token fired.
    Cancelled,
}

/// Device-side confirmation of an unlock in gate mode.
#[async_trait]
pub trait UnlockAcknowledger: Send + Sync {
    /// Returns `true` if the device at `address` confirmed the unlock.
    async fn acknowledge(&self, address: &str) -> bool;
}

/// Acknowledger that confirms every unlock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconditional;

#[async_trait]
impl UnlockAcknowledger for Unconditional {
    async fn acknowledge(&self, _address: &str) -> bool {
        true
    }
}

/// Periodic RSSI check with consecutive-miss and consecutive-fault counters.
pub struct ProximityMonitor<'a, R: ?Sized, A> {
    radio: &'a R,
    actuator: &'a TrackedActuator<A>,
    config: &'a ProximityConfig,
    acknowledger: &'a dyn UnlockAcknowledger,
}

impl<'a, R, A> ProximityMonitor<'a, R, A>
where
    R: RadioLink + ?Sized,
    A: LockActuator,
{
    /// Create a monitor driving `actuator` from samples taken on `radio`.
    pub fn new(
        radio: &'a R,
        actuator: &'a TrackedActuator<A>,
        config: &'a ProximityConfig,
        acknowledger: &'a dyn UnlockAcknowledger,
    ) -> Self {
        Self {
            radio,
            actuator,
            config,
            acknowledger,
        }
    }

    /// Sample `address` until the device leaves, sampling keeps failing, the
    /// gate opens (gate mode only) or `stop` fires.
    pub async fn run(
        &self,
        address: &str,
        mode: MonitorMode,
        stop: &CancellationToken,
    ) -> MonitorOutcome {
        let threshold = self.config.rssi_threshold;
        let mut misses = 0u32;
        let mut faults = 0u32;

        info!(address, ?mode, threshold, "Proximity monitor started");

        loop {
            let sample = tokio::select! {
                biased;
                () = stop.cancelled() => return MonitorOutcome::Cancelled,
                sample = self.radio.sample_signal(address, self.config.sample_window()) => sample,
            };

            match sample {
                Ok(SignalSample::Rssi(rssi)) if rssi > threshold => {
                    debug!(address, rssi, "Device near");
                    misses = 0;
                    faults = 0;
                    match mode {
                        MonitorMode::Watch => {
                            if !self.actuator.unlock_unless(stop).await {
                                return MonitorOutcome::Cancelled;
                            }
                        }
                        MonitorMode::Gate => {
                            if self.acknowledger.acknowledge(address).await {
                                if !self.actuator.unlock_unless(stop).await {
                                    return MonitorOutcome::Cancelled;
                                }
                                info!(address, rssi, "Unlock acknowledged");
                                return MonitorOutcome::UnlockCommanded;
                            }
                            warn!(address, "Unlock not acknowledged, staying locked");
                            self.actuator.lock().await;
                        }
                    }
                }
                Ok(sample) => {
                    faults = 0;
                    misses += 1;
                    if sample != SignalSample::NotObserved {
                        self.actuator.lock().await;
                    }
                    debug!(address, ?sample, misses, "Device weak or absent");
                    if misses >= self.config.miss_limit {
                        info!(address, misses, "Device left");
                        return MonitorOutcome::Relock;
                    }
                }
                Err(e) => {
                    faults += 1;
                    self.actuator.lock().await;
                    warn!(address, error = %e, faults, "Signal sampling failed");
                    if faults >= self.config.fault_limit {
                        return MonitorOutcome::Error;
                    }
                }
            }

            tokio::select! {
                biased;
                () = stop.cancelled() => return MonitorOutcome::Cancelled,
                () = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
    }
}
