//! Cloud override channel.
//!
//! A long-lived server-sent event subscription through which the cloud can
//! lock, unlock or release the machine. Lost connections are re-established;
//! if the channel stays down past the failsafe timeout the machine is
//! locked.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::cloud::ChannelKind;

use crate::actuator::{LockActuator, TrackedActuator};
use crate::cloud::CloudClient;
use crate::config::RemoteConfig;
use crate::types::{AccessResult, RemoteEvent};

/// Device name used in the event log for remote-mode commands.
pub const REMOTE_DEVICE_NAME: &str = "Remote Control";

/// Device id used in the event log for remote-mode commands.
pub const REMOTE_DEVICE_ID: &str = "1";

const DATA_PREFIX: &str = "data:";

/// Why the channel stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOutcome {
    /// The cloud locked the session.
    Locked,
    /// The cloud ended the session or remote mode.
    Exit,
    /// The channel was down for longer than the failsafe timeout.
    Failsafe,
    /// The stop token fired.
    Stopped,
}

/// Extract the upper-cased event token from one stream line, if it is a
/// data line.
#[must_use]
pub fn parse_data_line(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix(DATA_PREFIX)
        .map(|data| data.trim().to_ascii_uppercase())
}

/// Subscription to one of the cloud's override streams.
pub struct OverrideChannel<'a, A> {
    cloud: &'a CloudClient,
    actuator: &'a TrackedActuator<A>,
    config: &'a RemoteConfig,
    session: Option<&'a CancellationToken>,
}

impl<'a, A: LockActuator> OverrideChannel<'a, A> {
    /// Create a channel that applies commands to `actuator`.
    pub const fn new(
        cloud: &'a CloudClient,
        actuator: &'a TrackedActuator<A>,
        config: &'a RemoteConfig,
    ) -> Self {
        Self {
            cloud,
            actuator,
            config,
            session: None,
        }
    }

    /// Cancel `session` as soon as the channel ends, before the terminal
    /// lock is commanded, so nothing can reopen the output behind it.
    #[must_use]
    pub fn ending(mut self, session: &'a CancellationToken) -> Self {
        self.session = Some(session);
        self
    }

    /// Follow the `kind` stream until it ends the session, the failsafe
    /// fires or `stop` is cancelled.
    pub async fn run(&self, kind: ChannelKind, stop: &CancellationToken) -> OverrideOutcome {
        let mut last_healthy = Instant::now();
        info!(%kind, "Override channel started");

        loop {
            let result = tokio::select! {
                biased;
                () = stop.cancelled() => return OverrideOutcome::Stopped,
                result = self.follow_stream(kind, &mut last_healthy, stop) => result,
            };

            match result {
                Ok(outcome) => return self.finish(kind, outcome).await,
                Err(reason) => warn!(%kind, reason, "Override channel lost"),
            }

            let failsafe = self.config.failsafe_timeout();
            let down_for = last_healthy.elapsed();
            if down_for >= failsafe {
                error!(
                    %kind,
                    down_secs = down_for.as_secs(),
                    "Override channel down past failsafe timeout, locking"
                );
                return self.finish(kind, OverrideOutcome::Failsafe).await;
            }

            let pause = self.config.reconnect_delay().min(failsafe - down_for);
            tokio::select! {
                biased;
                () = stop.cancelled() => return OverrideOutcome::Stopped,
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Connect and process events until a terminal event or a loss.
    async fn follow_stream(
        &self,
        kind: ChannelKind,
        last_healthy: &mut Instant,
        stop: &CancellationToken,
    ) -> Result<OverrideOutcome, String> {
        let mut response = self
            .cloud
            .open_event_stream(kind)
            .await
            .map_err(|e| e.to_string())?;
        *last_healthy = Instant::now();
        info!(%kind, "Override channel connected");

        let idle = self.config.idle_timeout();
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let chunk = match tokio::time::timeout(idle, response.chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => return Err("server closed the stream".to_string()),
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err(format!("no data for {}s", idle.as_secs())),
            };
            *last_healthy = Instant::now();
            pending.extend_from_slice(&chunk);

            while let Some(end) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(outcome) = self.handle_line(kind, &line, stop).await {
                    return Ok(outcome);
                }
            }
        }
    }

    async fn handle_line(
        &self,
        kind: ChannelKind,
        line: &str,
        stop: &CancellationToken,
    ) -> Option<OverrideOutcome> {
        let token = parse_data_line(line)?;
        let Some(event) = RemoteEvent::parse(&token) else {
            debug!(%kind, token, "Ignoring stream event");
            return None;
        };
        info!(%kind, ?event, "Override command received");

        match (event, kind) {
            (RemoteEvent::Unlock, _) => {
                if self.actuator.unlock_unless(stop).await {
                    self.notify_remote(kind, AccessResult::RemoteUnlocked).await;
                }
                None
            }
            (RemoteEvent::Lock, ChannelKind::Session) => Some(OverrideOutcome::Locked),
            (RemoteEvent::Lock, ChannelKind::Remote) => {
                self.actuator.lock().await;
                self.notify_remote(kind, AccessResult::RemoteLocked).await;
                None
            }
            (RemoteEvent::Exit, _) => Some(OverrideOutcome::Exit),
        }
    }

    /// Terminal lock for every outcome except `Stopped`. Runs outside the
    /// stop select so it cannot be dropped half way.
    async fn finish(&self, kind: ChannelKind, outcome: OverrideOutcome) -> OverrideOutcome {
        if let Some(session) = self.session {
            session.cancel();
        }
        self.actuator.lock().await;
        if outcome == OverrideOutcome::Exit {
            self.notify_remote(kind, AccessResult::RemoteDisabled).await;
        }
        outcome
    }

    /// Remote-mode commands are logged in the cloud under a fixed identity.
    async fn notify_remote(&self, kind: ChannelKind, result: AccessResult) {
        if kind != ChannelKind::Remote {
            return;
        }
        if let Err(e) = self
            .cloud
            .notify_event(REMOTE_DEVICE_NAME, REMOTE_DEVICE_ID, result)
            .await
        {
            warn!(error = %e, ?result, "Failed to report remote command");
        }
    }
}

/// Failsafe timeout in whole seconds, for error reporting.
#[must_use]
pub const fn failsafe_secs(config: &RemoteConfig) -> u64 {
    Duration::from_millis(config.failsafe_timeout_ms).as_secs()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::actuator::testing::RecordingActuator;
    use crate::config::CloudConfig;

    fn cloud(server: &MockServer) -> CloudClient {
        let config = CloudConfig {
            base_url: server.uri(),
            ..CloudConfig::default()
        };
        CloudClient::new(&config, "A116G61").unwrap()
    }

    fn sse(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    fn fast_config() -> RemoteConfig {
        RemoteConfig {
            reconnect_delay_ms: 20,
            failsafe_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_parse_data_line() {
        assert_eq!(parse_data_line("data: lock"), Some("LOCK".to_string()));
        assert_eq!(parse_data_line("data:UNLOCK\r"), Some("UNLOCK".to_string()));
        assert_eq!(parse_data_line(": keep-alive"), None);
        assert_eq!(parse_data_line("event: status"), None);
        assert_eq!(parse_data_line(""), None);
    }

    #[tokio::test]
    async fn test_session_lock_ends_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/sse/A116G61"))
            .respond_with(sse("data: HEARTBEAT\n\ndata: unlock\n\ndata: LOCK\n\ndata: UNLOCK\n\n"))
            .mount(&server)
            .await;

        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        let config = fast_config();

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .run(ChannelKind::Session, &CancellationToken::new())
            .await;

        assert_eq!(outcome, OverrideOutcome::Locked);
        assert_eq!(actuator.inner().writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_remote_mode_runs_until_exit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/remote/sse/A116G61"))
            .respond_with(sse("data: LOCK\n\ndata: UNLOCK\n\n: comment\n\ndata: EXIT\n\n"))
            .mount(&server)
            .await;
        for result in ["Remote Verriegelt", "Remote Entriegelt", "Fernsteuerung deaktiviert"] {
            Mock::given(method("POST"))
                .and(path("/api/rcu/events/add"))
                .and(body_partial_json(json!({
                    "deviceName": "Remote Control",
                    "deviceId": "1",
                    "result": result
                })))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        let config = fast_config();

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .run(ChannelKind::Remote, &CancellationToken::new())
            .await;

        assert_eq!(outcome, OverrideOutcome::Exit);
        assert_eq!(actuator.inner().writes(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/sse/A116G61"))
            .respond_with(sse("data: PING\n\n"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/sse/A116G61"))
            .respond_with(sse("data: LOCK\n\n"))
            .expect(1)
            .mount(&server)
            .await;

        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        let config = fast_config();

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .run(ChannelKind::Session, &CancellationToken::new())
            .await;
        assert_eq!(outcome, OverrideOutcome::Locked);
    }

    #[tokio::test]
    async fn test_outage_past_failsafe_locks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/sse/A116G61"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        actuator.unlock().await;
        let config = RemoteConfig {
            reconnect_delay_ms: 50,
            failsafe_timeout_ms: 300,
            idle_timeout_ms: 1_000,
        };

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .run(ChannelKind::Session, &CancellationToken::new())
            .await;

        assert_eq!(outcome, OverrideOutcome::Failsafe);
        assert_eq!(actuator.current().await, Some(true));
        assert!(server.received_requests().await.unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_lock_ends_the_session_before_locking() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/rcu/sse/A116G61"))
            .respond_with(sse("data: LOCK\n\n"))
            .mount(&server)
            .await;

        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        actuator.unlock().await;
        let config = fast_config();
        let session = CancellationToken::new();

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .ending(&session)
            .run(ChannelKind::Session, &session)
            .await;

        assert_eq!(outcome, OverrideOutcome::Locked);
        assert!(session.is_cancelled());
        assert!(!actuator.unlock_unless(&session).await);
        assert_eq!(actuator.inner().writes(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_stop_token() {
        let server = MockServer::start().await;
        let cloud = cloud(&server);
        let actuator = TrackedActuator::new(RecordingActuator::default());
        let config = fast_config();
        let stop = CancellationToken::new();
        stop.cancel();

        let outcome = OverrideChannel::new(&cloud, &actuator, &config)
            .run(ChannelKind::Session, &stop)
            .await;
        assert_eq!(outcome, OverrideOutcome::Stopped);
        assert!(actuator.inner().writes().is_empty());
    }

    #[test]
    fn test_failsafe_secs() {
        assert_eq!(failsafe_secs(&RemoteConfig::default()), 30);
    }
}
