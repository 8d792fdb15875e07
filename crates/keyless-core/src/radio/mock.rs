//! In-memory radio for tests and bench setups without Bluetooth hardware.
//!
//! A [`MockRadio`] replays a script of advertisements, answers challenges
//! like a provisioned (or misbehaving) phone, and hands out queued signal
//! samples.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    AuthLink, GattProfile, Observation, RadioError, RadioLink, RadioResult, SignalSample,
};
use crate::auth::NONCE_LEN;
use crate::types::Advertisement;

/// Channel through which a mock peer delivers its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePath {
    /// Answer is available to the next read.
    Read,
    /// Answer is pushed as a notification.
    Notify,
    /// Notifications stay silent and the first read comes back empty; the
    /// answer shows up on a later read.
    LateRead,
}

/// How a mock peer answers a challenge.
#[derive(Debug, Clone)]
pub enum PeerBehavior {
    /// Answer with HMAC-SHA256 of the nonce under `key`.
    Hmac {
        /// Shared secret the phone holds.
        key: Vec<u8>,
        /// Delivery path.
        via: ResponsePath,
    },
    /// Always answer with these bytes on read.
    Fixed(Vec<u8>),
    /// Never answer.
    Silent,
}

#[derive(Debug)]
struct MockPeer {
    behavior: PeerBehavior,
    connect_failures: u32,
}

#[derive(Debug, Default)]
struct MockState {
    script: Vec<(Duration, Advertisement)>,
    close_after_script: bool,
    observe_error: Option<RadioError>,
    peers: HashMap<String, MockPeer>,
    samples: VecDeque<RadioResult<SignalSample>>,
    default_sample: Option<SignalSample>,
    connects: u32,
    recovers: u32,
    resets: u32,
    challenges: Vec<Vec<u8>>,
}

/// Scriptable in-memory [`RadioLink`].
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl MockRadio {
    /// Empty radio: observes nothing, knows no peers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Emit `adv` as soon as an observation starts.
    #[must_use]
    pub fn with_advertisement(self, adv: Advertisement) -> Self {
        self.with_advertisement_after(Duration::ZERO, adv)
    }

    /// Emit `adv` `delay` after the previous scripted advertisement.
    #[must_use]
    pub fn with_advertisement_after(self, delay: Duration, adv: Advertisement) -> Self {
        self.state().script.push((delay, adv));
        self
    }

    /// End each observation once the script is exhausted.
    #[must_use]
    pub fn closing_after_script(self) -> Self {
        self.state().close_after_script = true;
        self
    }

    /// Make the next observation fail to start with `error`.
    #[must_use]
    pub fn failing_observe(self, error: RadioError) -> Self {
        self.state().observe_error = Some(error);
        self
    }

    /// Register a connectable peer.
    #[must_use]
    pub fn with_peer(self, address: &str, behavior: PeerBehavior) -> Self {
        self.state().peers.insert(
            address.to_string(),
            MockPeer {
                behavior,
                connect_failures: 0,
            },
        );
        self
    }

    /// Make the next `count` connects to `address` fail.
    #[must_use]
    pub fn failing_connects(self, address: &str, count: u32) -> Self {
        if let Some(peer) = self.state().peers.get_mut(address) {
            peer.connect_failures = count;
        }
        self
    }

    /// Queue signal samples, returned in order.
    #[must_use]
    pub fn with_samples<I>(self, samples: I) -> Self
    where
        I: IntoIterator<Item = RadioResult<SignalSample>>,
    {
        self.state().samples.extend(samples);
        self
    }

    /// Sample returned once the queue is empty (default: not observed).
    #[must_use]
    pub fn with_default_sample(self, sample: SignalSample) -> Self {
        self.state().default_sample = Some(sample);
        self
    }

    /// Connection attempts so far.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    /// Recover calls so far.
    #[must_use]
    pub fn recover_count(&self) -> u32 {
        self.state().recovers
    }

    /// Adapter resets so far.
    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.state().resets
    }

    /// Every challenge payload written so far.
    #[must_use]
    pub fn written_challenges(&self) -> Vec<Vec<u8>> {
        self.state().challenges.clone()
    }

    /// Samples still queued.
    #[must_use]
    pub fn remaining_samples(&self) -> usize {
        self.state().samples.len()
    }
}

#[async_trait]
impl RadioLink for MockRadio {
    async fn observe(&self) -> RadioResult<Observation> {
        let (script, close) = {
            let mut state = self.state();
            if let Some(error) = state.observe_error.take() {
                return Err(error);
            }
            (state.script.clone(), state.close_after_script)
        };
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            for (delay, adv) in script {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
                if tx.send(adv).await.is_err() {
                    return;
                }
            }
            if !close {
                task_cancel.cancelled().await;
            }
        });

        Ok(Observation::new(rx, cancel))
    }

    async fn connect(
        &self,
        address: &str,
        _profile: &GattProfile,
    ) -> RadioResult<Box<dyn AuthLink>> {
        let mut state = self.state();
        state.connects += 1;
        let Some(peer) = state.peers.get_mut(address) else {
            return Err(RadioError::ConnectFailed {
                address: address.to_string(),
                message: "device not reachable".to_string(),
            });
        };
        if peer.connect_failures > 0 {
            peer.connect_failures -= 1;
            return Err(RadioError::ConnectFailed {
                address: address.to_string(),
                message: "le-connection-abort-by-local".to_string(),
            });
        }
        let behavior = peer.behavior.clone();
        drop(state);

        Ok(Box::new(MockAuthLink {
            behavior,
            notify_tx: None,
            pending_read: None,
            late_read: None,
            radio: self.clone(),
        }))
    }

    async fn sample_signal(&self, _address: &str, _window: Duration) -> RadioResult<SignalSample> {
        let mut state = self.state();
        state
            .samples
            .pop_front()
            .unwrap_or(Ok(state.default_sample.unwrap_or(SignalSample::NotObserved)))
    }

    async fn recover(&self, _address: &str) -> RadioResult<()> {
        self.state().recovers += 1;
        Ok(())
    }

    async fn reset(&self) -> RadioResult<()> {
        self.state().resets += 1;
        Ok(())
    }
}

struct MockAuthLink {
    behavior: PeerBehavior,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
    pending_read: Option<Vec<u8>>,
    late_read: Option<Vec<u8>>,
    radio: MockRadio,
}

#[async_trait]
impl AuthLink for MockAuthLink {
    async fn subscribe_response(&mut self) -> RadioResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(4);
        self.notify_tx = Some(tx);
        Ok(rx)
    }

    async fn write_challenge(&mut self, payload: &[u8]) -> RadioResult<()> {
        self.radio.state().challenges.push(payload.to_vec());
        let nonce = &payload[..payload.len().min(NONCE_LEN)];

        match &self.behavior {
            PeerBehavior::Hmac { key, via } => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|e| {
                    RadioError::Internal {
                        message: e.to_string(),
                    }
                })?;
                mac.update(nonce);
                let answer = mac.finalize().into_bytes().to_vec();
                match via {
                    ResponsePath::Read => self.pending_read = Some(answer),
                    ResponsePath::LateRead => self.late_read = Some(answer),
                    ResponsePath::Notify => {
                        if let Some(tx) = &self.notify_tx {
                            let _ = tx.try_send(answer);
                        }
                    }
                }
            }
            PeerBehavior::Fixed(bytes) => self.pending_read = Some(bytes.clone()),
            PeerBehavior::Silent => {}
        }
        Ok(())
    }

    async fn read_response(&mut self) -> RadioResult<Vec<u8>> {
        if let Some(answer) = self.pending_read.take() {
            return Ok(answer);
        }
        self.pending_read = self.late_read.take();
        Ok(Vec::new())
    }

    async fn disconnect(&mut self) -> RadioResult<()> {
        self.notify_tx = None;
        Ok(())
    }
}
