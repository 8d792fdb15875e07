//! BlueZ implementation of the radio seam.
//!
//! This module provides:
//! - LE advertisement observation with manufacturer data and RSSI
//! - GATT connections resolving the authentication service
//! - RSSI sampling for proximity checks
//! - Adapter power-cycling for radio-stack resets
//!
//! Requires a running `bluetoothd`; talks to it through `bluer`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{pin_mut, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AuthLink, GattProfile, Observation, RadioError, RadioLink, RadioResult, SignalSample,
};
use crate::types::Advertisement;

/// How often known devices are re-read during an observation.
const REFRESH_INTERVAL: Duration = Duration::from_millis(500);

/// How often the RSSI property is polled while sampling.
const SAMPLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Upper bound for GATT service resolution after connecting.
const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between powering the adapter off and on again.
const POWER_CYCLE_PAUSE: Duration = Duration::from_secs(1);

fn internal(err: bluer::Error) -> RadioError {
    RadioError::Internal {
        message: err.to_string(),
    }
}

fn discovery(err: bluer::Error) -> RadioError {
    RadioError::DiscoveryFailed {
        message: err.to_string(),
    }
}

fn parse_address(address: &str) -> RadioResult<Address> {
    address.parse().map_err(|_| RadioError::InvalidAddress {
        address: address.to_string(),
    })
}

/// Radio backed by the system's BlueZ daemon.
pub struct BluezRadio {
    _session: Session,
    adapter: Adapter,
}

impl BluezRadio {
    /// Open the named adapter (or the default one), power it on and set an
    /// LE discovery filter that reports duplicate advertisements.
    ///
    /// # Errors
    ///
    /// Returns [`RadioError::AdapterNotFound`] if no adapter is available.
    pub async fn new(adapter_name: Option<&str>) -> RadioResult<Self> {
        let session = Session::new().await.map_err(internal)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(|_| RadioError::AdapterNotFound)?,
            None => session
                .default_adapter()
                .await
                .map_err(|_| RadioError::AdapterNotFound)?,
        };

        let radio = Self {
            _session: session,
            adapter,
        };
        radio.prepare_adapter().await?;
        info!(adapter = %radio.adapter.name(), "Bluetooth adapter ready");
        Ok(radio)
    }

    async fn prepare_adapter(&self) -> RadioResult<()> {
        self.adapter.set_powered(true).await.map_err(internal)?;
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..DiscoveryFilter::default()
            })
            .await
            .map_err(discovery)
    }

    fn device(&self, address: &str) -> RadioResult<Device> {
        let address = parse_address(address)?;
        self.adapter.device(address).map_err(internal)
    }
}

/// Read the advertisement-relevant properties of a device. One
/// [`Advertisement`] is produced per manufacturer-data entry.
async fn snapshot(adapter: &Adapter, address: Address) -> Vec<Advertisement> {
    let Ok(device) = adapter.device(address) else {
        return Vec::new();
    };
    let Ok(Some(rssi)) = device.rssi().await else {
        return Vec::new();
    };
    let name = device.name().await.ok().flatten();
    let manufacturer_data = device
        .manufacturer_data()
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    manufacturer_data
        .into_iter()
        .map(|(vendor_id, payload)| Advertisement {
            address: address.to_string(),
            name: name.clone(),
            vendor_id,
            payload,
            rssi,
        })
        .collect()
}

async fn feed_observation(
    adapter: Adapter,
    tx: mpsc::Sender<Advertisement>,
    cancel: CancellationToken,
    ready: oneshot::Sender<RadioResult<()>>,
) {
    let events = match adapter.discover_devices().await {
        Ok(events) => {
            let _ = ready.send(Ok(()));
            events
        }
        Err(e) => {
            let _ = ready.send(Err(discovery(e)));
            return;
        }
    };
    pin_mut!(events);

    let mut known: HashSet<Address> = HashSet::new();
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);

    loop {
        let batch = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => {
                    known.insert(address);
                    snapshot(&adapter, address).await
                }
                Some(AdapterEvent::DeviceRemoved(address)) => {
                    known.remove(&address);
                    Vec::new()
                }
                Some(_) => Vec::new(),
                None => break,
            },
            _ = refresh.tick() => {
                let mut batch = Vec::new();
                for address in &known {
                    batch.extend(snapshot(&adapter, *address).await);
                }
                batch
            }
        };

        for adv in batch {
            if tx.send(adv).await.is_err() {
                return;
            }
        }
    }
    debug!("Observation ended");
}

/// Find the service with `uuid`, waiting for BlueZ to finish resolving.
async fn resolve_service(device: &Device, address: &str, uuid: uuid::Uuid) -> RadioResult<Service> {
    let deadline = Instant::now() + SERVICE_RESOLVE_TIMEOUT;
    loop {
        let services = device.services().await.map_err(|e| RadioError::ConnectFailed {
            address: address.to_string(),
            message: e.to_string(),
        })?;
        for service in services {
            if service.uuid().await.map_err(internal)? == uuid {
                return Ok(service);
            }
        }
        if Instant::now() >= deadline {
            return Err(RadioError::ServiceNotFound {
                address: address.to_string(),
                uuid: uuid.to_string(),
            });
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[async_trait]
impl RadioLink for BluezRadio {
    async fn observe(&self) -> RadioResult<Observation> {
        let (tx, rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        tokio::spawn(feed_observation(
            self.adapter.clone(),
            tx,
            cancel.clone(),
            ready_tx,
        ));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Observation::new(rx, cancel)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RadioError::DiscoveryFailed {
                message: "observation task ended before starting".to_string(),
            }),
        }
    }

    async fn connect(
        &self,
        address: &str,
        profile: &GattProfile,
    ) -> RadioResult<Box<dyn AuthLink>> {
        let device = self.device(address)?;
        let connect_failed = |e: bluer::Error| RadioError::ConnectFailed {
            address: address.to_string(),
            message: e.to_string(),
        };

        if !device.is_connected().await.map_err(connect_failed)? {
            device.connect().await.map_err(connect_failed)?;
        }
        debug!(address, "Connected, resolving authentication service");

        let service = resolve_service(&device, address, profile.service).await?;

        let mut challenge: Option<Characteristic> = None;
        let mut response: Option<Characteristic> = None;
        for characteristic in service.characteristics().await.map_err(connect_failed)? {
            let uuid = characteristic.uuid().await.map_err(internal)?;
            if uuid == profile.challenge {
                challenge = Some(characteristic);
            } else if uuid == profile.response {
                response = Some(characteristic);
            }
        }

        let missing = |uuid: uuid::Uuid| RadioError::CharacteristicNotFound {
            address: address.to_string(),
            uuid: uuid.to_string(),
        };
        let challenge = challenge.ok_or_else(|| missing(profile.challenge))?;
        let response = response.ok_or_else(|| missing(profile.response))?;

        Ok(Box::new(BluezAuthLink {
            device,
            challenge,
            response,
            notifications: None,
        }))
    }

    async fn sample_signal(&self, address: &str, window: Duration) -> RadioResult<SignalSample> {
        let device = self.device(address)?;
        // Keeps discovery running for the duration of the sample.
        let _discovery = self.adapter.discover_devices().await.map_err(discovery)?;

        let deadline = Instant::now() + window;
        let mut seen = false;
        loop {
            match device.rssi().await {
                Ok(Some(rssi)) => return Ok(SignalSample::Rssi(rssi)),
                Ok(None) => seen = true,
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(SAMPLE_POLL_INTERVAL).await;
        }

        Ok(if seen {
            SignalSample::Unreadable
        } else {
            SignalSample::NotObserved
        })
    }

    async fn recover(&self, address: &str) -> RadioResult<()> {
        let device = self.device(address)?;
        if device.is_connected().await.unwrap_or(false) {
            if let Err(e) = device.disconnect().await {
                warn!(address, error = %e, "Disconnect during recovery failed");
            }
        }
        Ok(())
    }

    async fn reset(&self) -> RadioResult<()> {
        warn!(adapter = %self.adapter.name(), "Power-cycling Bluetooth adapter");
        self.adapter.set_powered(false).await.map_err(internal)?;
        tokio::time::sleep(POWER_CYCLE_PAUSE).await;
        self.prepare_adapter().await
    }
}

/// Copy notified values into `tx` until the stream ends, the receiver is
/// dropped or `cancel` fires.
async fn forward_notifications<S>(values: S, tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken)
where
    S: Stream<Item = Vec<u8>>,
{
    pin_mut!(values);
    loop {
        let value = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            value = values.next() => value,
        };
        let Some(value) = value else { return };
        if tx.send(value).await.is_err() {
            return;
        }
    }
}

struct BluezAuthLink {
    device: Device,
    challenge: Characteristic,
    response: Characteristic,
    /// Stops the notification forwarder; cancelled on disconnect and drop.
    notifications: Option<CancellationToken>,
}

impl BluezAuthLink {
    fn stop_notifications(&mut self) {
        if let Some(cancel) = self.notifications.take() {
            cancel.cancel();
        }
    }
}

impl Drop for BluezAuthLink {
    fn drop(&mut self) {
        self.stop_notifications();
    }
}

#[async_trait]
impl AuthLink for BluezAuthLink {
    async fn subscribe_response(&mut self) -> RadioResult<mpsc::Receiver<Vec<u8>>> {
        self.stop_notifications();
        let (tx, rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = oneshot::channel();
        let characteristic = self.response.clone();
        let cancel = CancellationToken::new();
        self.notifications = Some(cancel.clone());

        tokio::spawn(async move {
            let values = match characteristic.notify().await {
                Ok(values) => {
                    let _ = ready_tx.send(Ok(()));
                    values
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            forward_notifications(values, tx, cancel).await;
            debug!("Response notifications stopped");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(message)) => Err(RadioError::ReadFailed { message }),
            Err(_) => Err(RadioError::ReadFailed {
                message: "notification task ended before subscribing".to_string(),
            }),
        }
    }

    async fn write_challenge(&mut self, payload: &[u8]) -> RadioResult<()> {
        self.challenge
            .write(payload)
            .await
            .map_err(|e| RadioError::WriteFailed {
                message: e.to_string(),
            })
    }

    async fn read_response(&mut self) -> RadioResult<Vec<u8>> {
        self.response
            .read()
            .await
            .map_err(|e| RadioError::ReadFailed {
                message: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> RadioResult<()> {
        self.stop_notifications();
        self.device.disconnect().await.map_err(internal)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_forwarder_delivers_values_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let values = futures::stream::iter(vec![vec![1], vec![2, 3]]);

        forward_notifications(values, tx, CancellationToken::new()).await;

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2, 3]));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_forwarder_stops_on_cancel() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_notifications(
            futures::stream::pending::<Vec<u8>>(),
            tx,
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), forwarder)
            .await
            .expect("forwarder ends once cancelled")
            .unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
