//! In-memory radio for exercising sessions without BlueZ.

use async_trait::async_trait;
use bluer::Uuid;
use futures_util::{stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::bluetooth::transport::{Advertisement, Link, NotificationStream, Radio};
use crate::error::TransportError;

#[derive(Default)]
struct LinkState {
    connected: AtomicBool,
    closed: AtomicBool,
    fail_writes: AtomicBool,
    fail_subscribe: AtomicBool,
    stall_subscribe: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
}

pub struct MockLink {
    state: Arc<LinkState>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

/// Test-side control of a [`MockLink`]
pub struct MockLinkHandle {
    state: Arc<LinkState>,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockLink {
    pub fn new() -> (MockLink, MockLinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LinkState::default());
        state.connected.store(true, Ordering::SeqCst);

        let link = MockLink {
            state: Arc::clone(&state),
            notifications: Mutex::new(Some(rx)),
        };
        let handle = MockLinkHandle {
            state,
            sender: Mutex::new(Some(tx)),
        };
        (link, handle)
    }
}

impl MockLinkHandle {
    /// Deliver a notification payload
    pub fn notify(&self, payload: &[u8]) {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(payload.to_vec());
        }
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.sender.lock().unwrap().take();
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self) {
        self.state.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Make `subscribe` wait forever, like a GATT lookup that never answers
    pub fn stall_subscribe(&self) {
        self.state.stall_subscribe.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&self, channel: Uuid) -> Result<NotificationStream, TransportError> {
        if self.state.stall_subscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Subscribe {
                channel: channel.to_string(),
                reason: "characteristic not found".into(),
            });
        }

        let rx = self
            .notifications
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Subscribe {
                channel: channel.to_string(),
                reason: "already subscribed".into(),
            })?;

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|data| (data, rx)) }).boxed())
    }

    async fn write(&self, channel: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Write {
                channel: channel.to_string(),
                reason: "simulated write failure".into(),
            });
        }
        self.state.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Radio with scripted advertisements and links
///
/// Each `open_link` pops the next scripted entry for the address; an empty
/// queue or a scripted failure yields a connect error.
pub struct MockRadio {
    advertisements: Vec<Advertisement>,
    links: Mutex<HashMap<String, VecDeque<Option<MockLink>>>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MockRadio {
    pub fn new(advertisements: Vec<Advertisement>) -> Self {
        MockRadio {
            advertisements,
            links: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_link(&self, address: &str, link: MockLink) {
        self.links
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push_back(Some(link));
    }

    pub fn fail_next_connect(&self, address: &str) {
        self.links
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push_back(None);
    }

    pub fn connect_attempts(&self, address: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        Ok(self.advertisements.clone())
    }

    async fn open_link(&self, address: &str) -> Result<Box<dyn Link>, TransportError> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default() += 1;

        let next = self
            .links
            .lock()
            .unwrap()
            .get_mut(address)
            .and_then(VecDeque::pop_front)
            .flatten();

        match next {
            Some(link) => Ok(Box::new(link)),
            None => Err(TransportError::Connect {
                address: address.to_string(),
                reason: "device not reachable".into(),
            }),
        }
    }
}
