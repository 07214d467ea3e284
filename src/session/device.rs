/// Connection lifecycle of a single peripheral
use bluer::Uuid;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bluetooth::decoder::decode_payload;
use crate::bluetooth::transport::{Link, NotificationStream, Radio};
use crate::error::TransportError;
use crate::models::{group_snapshot, DeviceIdentity, DeviceRole};
use crate::storage::RecordStore;

/// Where a session is in its connect / listen / retry cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Connecting,
    Subscribed,
    DisconnectedPendingRetry,
    PermanentlyFailed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Discovering => write!(f, "discovering"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Subscribed => write!(f, "subscribed"),
            SessionState::DisconnectedPendingRetry => write!(f, "disconnected, retry pending"),
            SessionState::PermanentlyFailed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Timing and channel parameters shared by every session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Characteristic carrying notifications (and companion pushes)
    pub channel: Uuid,
    /// Fixed delay between a lost link and the next connection attempt
    pub reconnect_delay: Duration,
    /// How often an idle link is checked for being still connected
    pub liveness_interval: Duration,
    /// How often a companion receives the aggregated snapshot
    pub push_interval: Duration,
}

/// Why a subscribed link stopped being used
enum LinkEnd {
    Closed,
    Shutdown,
}

/// One device's connect, subscribe, listen, reconnect loop
///
/// A session never gives up on its device: every lost link or transport
/// error leads to a fixed backoff and another attempt, until the process
/// shutdown token is cancelled. Only invalid construction parameters stop it
/// for good.
pub struct DeviceSession {
    identity: DeviceIdentity,
    role: DeviceRole,
    radio: Arc<dyn Radio>,
    store: Arc<RecordStore>,
    settings: SessionSettings,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl DeviceSession {
    pub fn new(
        identity: DeviceIdentity,
        role: DeviceRole,
        radio: Arc<dyn Radio>,
        store: Arc<RecordStore>,
        settings: SessionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Discovering);
        DeviceSession {
            identity,
            role,
            radio,
            store,
            settings,
            shutdown,
            state,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Follow this session's state changes
    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session until shutdown. Returns the final state.
    pub async fn run(self) -> SessionState {
        let label = self.identity.label.clone();

        if let Err(e) = self.identity.validate() {
            error!("{}: {}", label, e);
            self.transition(SessionState::PermanentlyFailed(e.to_string()));
            return self.current_state();
        }

        loop {
            self.transition(SessionState::Connecting);

            let opened = tokio::select! {
                opened = self.radio.open_link(&self.identity.address) => opened,
                _ = self.shutdown.cancelled() => break,
            };

            match opened {
                Ok(link) => {
                    info!("{}: connected to {}", label, self.identity.address);
                    let outcome = self.drive_link(link.as_ref()).await;
                    // Released on every path out of drive_link
                    link.close().await;

                    match outcome {
                        Ok(LinkEnd::Shutdown) => break,
                        Ok(LinkEnd::Closed) => warn!("{}: link closed", label),
                        Err(e) => warn!("{}: {}", label, e),
                    }
                }
                Err(e) => warn!("{}: {}", label, e),
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            self.transition(SessionState::DisconnectedPendingRetry);
            info!(
                "{}: reconnecting in {} seconds",
                label,
                self.settings.reconnect_delay.as_secs_f32()
            );
            tokio::select! {
                _ = sleep(self.settings.reconnect_delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("{}: session stopped", label);
        self.current_state()
    }

    /// Subscribe and keep ingesting until the link goes away
    async fn drive_link(&self, link: &dyn Link) -> Result<LinkEnd, TransportError> {
        let notifications = tokio::select! {
            subscribed = link.subscribe(self.settings.channel) => subscribed?,
            _ = self.shutdown.cancelled() => return Ok(LinkEnd::Shutdown),
        };
        self.transition(SessionState::Subscribed);
        info!(
            "{}: listening on {} (slot {})",
            self.identity.label, self.settings.channel, self.identity.slot
        );

        let listen = self.listen(link, notifications);
        let push = async {
            match self.role {
                DeviceRole::Companion => self.push_snapshots(link).await,
                DeviceRole::Sensor => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            end = listen => Ok(end),
            _ = push => Ok(LinkEnd::Closed),
        }
    }

    /// Decode and store every notification, checking liveness while idle
    async fn listen(&self, link: &dyn Link, mut notifications: NotificationStream) -> LinkEnd {
        let period = self.settings.liveness_interval;
        let mut liveness = interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return LinkEnd::Shutdown,
                payload = notifications.next() => match payload {
                    Some(payload) => self.ingest(&payload).await,
                    None => return LinkEnd::Closed,
                },
                _ = liveness.tick() => {
                    if !link.is_connected().await {
                        return LinkEnd::Closed;
                    }
                }
            }
        }
    }

    async fn ingest(&self, payload: &[u8]) {
        let label = &self.identity.label;
        debug!("{}: received {}", label, String::from_utf8_lossy(payload));

        let record = match decode_payload(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("{}: dropping payload: {}", label, e);
                return;
            }
        };

        if let Err(e) = self.store.append(self.identity.slot, record).await {
            warn!("{}: {}", label, e);
        }
    }

    /// Periodically write the aggregated snapshot back over the link
    async fn push_snapshots(&self, link: &dyn Link) {
        let period = self.settings.push_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let snapshot = self.store.read_snapshot();
            if snapshot.is_empty() {
                continue;
            }

            let body = match serde_json::to_vec(&group_snapshot(&snapshot, self.store.labels())) {
                Ok(body) => body,
                Err(e) => {
                    error!("{}: failed to serialize snapshot: {}", self.identity.label, e);
                    continue;
                }
            };

            if let Err(e) = link.write(self.settings.channel, &body).await {
                warn!("{}: snapshot push failed: {}", self.identity.label, e);
            }
        }
    }

    fn transition(&self, next: SessionState) {
        debug!("{}: {}", self.identity.label, next);
        self.state.send_replace(next);
    }

    fn current_state(&self) -> SessionState {
        self.state.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockLink, MockRadio};
    use std::collections::BTreeMap;
    use std::path::Path;

    const SENSOR_A: &str = "AA:AA:AA:AA:AA:01";
    const SENSOR_B: &str = "BB:BB:BB:BB:BB:02";
    const PAYLOAD: &[u8] = br#"{"MPU1":{"ax":0.5},"HMC":{"heading":90}}"#;

    fn settings() -> SessionSettings {
        SessionSettings {
            channel: Uuid::from_u128(0xabcd1234_5678_1234_5678_123456789abc),
            reconnect_delay: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(1),
            push_interval: Duration::from_secs(1),
        }
    }

    async fn store(dir: &Path) -> Arc<RecordStore> {
        let labels = BTreeMap::from([(1, "ESP32-1".to_string()), (2, "ESP32-2".to_string())]);
        Arc::new(RecordStore::open(dir, labels).await.expect("open store"))
    }

    fn session(
        label: &str,
        address: &str,
        slot: u8,
        role: DeviceRole,
        radio: &Arc<MockRadio>,
        store: &Arc<RecordStore>,
        shutdown: &CancellationToken,
    ) -> DeviceSession {
        let radio: Arc<dyn Radio> = radio.clone();
        DeviceSession::new(
            DeviceIdentity {
                label: label.into(),
                address: address.into(),
                slot,
            },
            role,
            radio,
            Arc::clone(store),
            settings(),
            shutdown.clone(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, state: SessionState) {
        rx.wait_for(|s| *s == state).await.expect("session alive");
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_retries_once_after_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link_a1, handle_a1) = MockLink::new();
        let (link_a2, _handle_a2) = MockLink::new();
        let (link_b, handle_b) = MockLink::new();
        radio.add_link(SENSOR_A, link_a1);
        radio.add_link(SENSOR_A, link_a2);
        radio.add_link(SENSOR_B, link_b);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let b = session("ESP32-2", SENSOR_B, 2, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state_a = a.watch_state();
        let mut state_b = b.watch_state();
        let task_a = tokio::spawn(a.run());
        let task_b = tokio::spawn(b.run());

        wait_for_state(&mut state_a, SessionState::Subscribed).await;
        wait_for_state(&mut state_b, SessionState::Subscribed).await;

        handle_b.notify(PAYLOAD);
        wait_until(|| store.read_snapshot().contains_key(&2)).await;
        let sibling = store.read_snapshot().get(&2).cloned();

        let dropped_at = Instant::now();
        handle_a1.drop_link();
        wait_for_state(&mut state_a, SessionState::DisconnectedPendingRetry).await;
        assert!(handle_a1.is_closed());
        assert_eq!(radio.connect_attempts(SENSOR_A), 1);

        wait_for_state(&mut state_a, SessionState::Subscribed).await;
        assert!(dropped_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(radio.connect_attempts(SENSOR_A), 2);
        assert_eq!(radio.connect_attempts(SENSOR_B), 1);
        assert_eq!(*state_b.borrow(), SessionState::Subscribed);
        assert_eq!(store.read_snapshot().get(&2).cloned(), sibling);
        assert!(!store.read_snapshot().contains_key(&1));

        shutdown.cancel();
        assert_eq!(task_a.await.expect("join"), SessionState::Subscribed);
        task_b.await.expect("join");
        assert!(handle_b.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_payload_keeps_link_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link, handle) = MockLink::new();
        radio.add_link(SENSOR_A, link);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state = a.watch_state();
        let task = tokio::spawn(a.run());
        wait_for_state(&mut state, SessionState::Subscribed).await;

        handle.notify(b"\xff\xfe not json");
        handle.notify(b"{\"MPU1\": ");
        sleep(Duration::from_secs(3)).await;
        assert!(store.read_snapshot().is_empty());

        handle.notify(PAYLOAD);
        wait_until(|| store.read_snapshot().contains_key(&1)).await;

        let record = store.read_snapshot().remove(&1).expect("slot 1");
        assert_eq!(record.mpu1.ax, Some(0.5));
        assert_eq!(record.mpu1.ay, None);
        assert_eq!(record.hmc.heading, Some(90.0));
        assert_eq!(radio.connect_attempts(SENSOR_A), 1);
        assert_eq!(*state.borrow(), SessionState::Subscribed);

        shutdown.cancel();
        task.await.expect("join");
        assert!(handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        radio.fail_next_connect(SENSOR_A);
        let (link, _handle) = MockLink::new();
        radio.add_link(SENSOR_A, link);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state = a.watch_state();
        let started = Instant::now();
        let task = tokio::spawn(a.run());

        wait_for_state(&mut state, SessionState::Subscribed).await;
        assert_eq!(radio.connect_attempts(SENSOR_A), 2);
        assert!(started.elapsed() >= Duration::from_secs(5));

        shutdown.cancel();
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_closes_link_and_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (broken, broken_handle) = MockLink::new();
        broken_handle.fail_subscribe();
        radio.add_link(SENSOR_A, broken);
        let (link, handle) = MockLink::new();
        radio.add_link(SENSOR_A, link);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state = a.watch_state();
        let started = Instant::now();
        let task = tokio::spawn(a.run());

        wait_for_state(&mut state, SessionState::Subscribed).await;
        assert!(broken_handle.is_closed());
        assert!(!handle.is_closed());
        assert_eq!(radio.connect_attempts(SENSOR_A), 2);
        assert!(started.elapsed() >= Duration::from_secs(5));

        handle.notify(PAYLOAD);
        wait_until(|| store.read_snapshot().contains_key(&1)).await;

        shutdown.cancel();
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_subscribing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link, handle) = MockLink::new();
        handle.stall_subscribe();
        radio.add_link(SENSOR_A, link);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let task = tokio::spawn(a.run());
        wait_until(|| radio.connect_attempts(SENSOR_A) == 1).await;

        shutdown.cancel();
        assert_eq!(task.await.expect("join"), SessionState::Connecting);
        assert!(handle.is_closed());
        assert_eq!(radio.connect_attempts(SENSOR_A), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_check_detects_silent_disconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link, handle) = MockLink::new();
        radio.add_link(SENSOR_A, link);

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state = a.watch_state();
        let task = tokio::spawn(a.run());
        wait_for_state(&mut state, SessionState::Subscribed).await;

        // Notification stream stays open but the device reports disconnected
        handle.set_connected(false);
        wait_for_state(&mut state, SessionState::DisconnectedPendingRetry).await;
        assert!(handle.is_closed());

        shutdown.cancel();
        assert_eq!(
            task.await.expect("join"),
            SessionState::DisconnectedPendingRetry
        );
    }

    #[tokio::test]
    async fn test_invalid_parameters_fail_permanently() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let a = session("ESP32-1", "", 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let final_state = a.run().await;

        assert!(matches!(final_state, SessionState::PermanentlyFailed(_)));
        assert_eq!(radio.connect_attempts(""), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_companion_pushes_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link, handle) = MockLink::new();
        radio.add_link(SENSOR_A, link);

        let companion = session(
            "Companion",
            SENSOR_A,
            3,
            DeviceRole::Companion,
            &radio,
            &store,
            &shutdown,
        );
        let mut state = companion.watch_state();
        let task = tokio::spawn(companion.run());
        wait_for_state(&mut state, SessionState::Subscribed).await;

        // Nothing is pushed while the snapshot is empty
        sleep(Duration::from_millis(2500)).await;
        assert!(handle.writes().is_empty());

        let record = decode_payload(PAYLOAD).expect("decode");
        store.append(2, record).await.expect("append");
        wait_until(|| !handle.writes().is_empty()).await;

        let pushed: serde_json::Value =
            serde_json::from_slice(&handle.writes()[0]).expect("pushed JSON");
        assert_eq!(pushed["ESP32-2"]["MPU1"]["ax"], serde_json::json!(0.5));
        assert_eq!(pushed.as_object().expect("object").len(), 1);

        shutdown.cancel();
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_companion_write_failure_does_not_stop_ingestion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (link, handle) = MockLink::new();
        handle.fail_writes(true);
        radio.add_link(SENSOR_A, link);

        let companion = session(
            "Companion",
            SENSOR_A,
            3,
            DeviceRole::Companion,
            &radio,
            &store,
            &shutdown,
        );
        let mut state = companion.watch_state();
        let task = tokio::spawn(companion.run());
        wait_for_state(&mut state, SessionState::Subscribed).await;

        handle.notify(PAYLOAD);
        wait_until(|| store.read_snapshot().contains_key(&3)).await;
        sleep(Duration::from_secs(3)).await;

        handle.notify(br#"{"MPU1":{"ax":0.75}}"#);
        wait_until(|| {
            store
                .read_snapshot()
                .get(&3)
                .is_some_and(|r| r.mpu1.ax == Some(0.75))
        })
        .await;
        assert_eq!(*state.borrow(), SessionState::Subscribed);
        assert_eq!(radio.connect_attempts(SENSOR_A), 1);

        shutdown.cancel();
        task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path()).await;
        let radio = Arc::new(MockRadio::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let a = session("ESP32-1", SENSOR_A, 1, DeviceRole::Sensor, &radio, &store, &shutdown);
        let mut state = a.watch_state();
        let task = tokio::spawn(a.run());

        wait_for_state(&mut state, SessionState::DisconnectedPendingRetry).await;
        shutdown.cancel();
        assert_eq!(
            task.await.expect("join"),
            SessionState::DisconnectedPendingRetry
        );
        assert_eq!(radio.connect_attempts(SENSOR_A), 1);
    }
}
