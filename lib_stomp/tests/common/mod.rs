//! # In-memory collaborators for manager integration tests
//!
//! `MockFactory` opens `MockSession`s that record every SUBSCRIBE and
//! UNSUBSCRIBE, accept injected frames and can drop their link on demand.
//! `ScriptedPoster` replays handshake responses.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use lib_stomp::configs::StompConfig;
use lib_stomp::core::{
    Credential, FramePayload, HttpError, HttpPoster, InboundFrame, ManagerSnapshot,
    SessionFactory, SessionOptions, StompChannel, StompManager, StompSession, TransportError,
    TransportEvent,
};

pub const USER: &str = "user-1";

pub struct MockChannel;

impl StompChannel for MockChannel {
    fn user_token(&self) -> &str {
        USER
    }
    fn handshake_url(&self) -> &str {
        "https://broker.test/handshake"
    }
    fn handshake_params(&self) -> serde_json::Value {
        serde_json::json!({ "token": USER })
    }
    fn stomp_url(&self, credential: &Credential) -> Option<String> {
        Some(format!("wss://broker.test/ws?id={}", credential.handshake_id))
    }
}

pub type Scripted = Result<Option<Vec<u8>>, HttpError>;

/// Replays scripted responses; the last one repeats.
pub struct ScriptedPoster {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
}

impl ScriptedPoster {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_ok() -> Arc<Self> {
        Self::new(vec![handshake(200, "abc", 60)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpPoster for ScriptedPoster {
    async fn post_json(
        &self,
        _url: &str,
        _body: &serde_json::Value,
        _headers: &HashMap<String, String>,
    ) -> Result<Option<Vec<u8>>, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

pub fn handshake(code: i64, id: &str, expires_in: u64) -> Scripted {
    Ok(Some(
        serde_json::to_vec(&serde_json::json!({
            "code": code,
            "handshakeId": id,
            "expiresIn": expires_in,
            "msg": if code == 200 { "ok" } else { "server error" },
        }))
        .unwrap(),
    ))
}

pub struct MockSession {
    connected: AtomicBool,
    disconnects: AtomicUsize,
    subscribe_failures: Arc<AtomicUsize>,
    subscribe_latency_ms: Arc<AtomicU64>,
    wire_log: Mutex<Vec<String>>,
    subscribe_attempts: Mutex<Vec<(String, String)>>,
    subscribes: Mutex<Vec<(String, String)>>,
    unsubscribes: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, Vec<u8>, Option<String>)>>,
    events: broadcast::Sender<TransportEvent>,
    messages: broadcast::Sender<Arc<InboundFrame>>,
}

impl MockSession {
    fn new(subscribe_failures: Arc<AtomicUsize>, subscribe_latency_ms: Arc<AtomicU64>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        let (messages, _) = broadcast::channel(64);
        Arc::new(Self {
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            subscribe_failures,
            subscribe_latency_ms,
            wire_log: Mutex::new(Vec::new()),
            subscribe_attempts: Mutex::new(Vec::new()),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            events,
            messages,
        })
    }

    /// `(destination, id)` of every accepted SUBSCRIBE.
    pub fn subscribes(&self) -> Vec<(String, String)> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn subscribe_attempts(&self) -> usize {
        self.subscribe_attempts.lock().unwrap().len()
    }

    /// `SUBSCRIBE <id>` / `UNSUBSCRIBE <id>` in the order the broker saw them.
    pub fn wire_log(&self) -> Vec<String> {
        self.wire_log.lock().unwrap().clone()
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.unsubscribes.lock().unwrap().clone()
    }

    /// `(destination, body, receipt id)` of every SEND.
    pub fn sent(&self) -> Vec<(String, Vec<u8>, Option<String>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Wire id the session saw for `destination`.
    pub fn wire_id_for(&self, destination: &str) -> Option<String> {
        self.subscribes()
            .into_iter()
            .find(|(dest, _)| dest == destination)
            .map(|(_, id)| id)
    }

    pub fn push(&self, destination: &str, subscription: &str, body: &str) {
        let mut headers = HashMap::new();
        headers.insert("subscription".to_string(), subscription.to_string());
        headers.insert("destination".to_string(), destination.to_string());
        let _ = self.messages.send(Arc::new(InboundFrame {
            payload: FramePayload::Text(body.to_string()),
            message_id: format!("msg-{}", body.len()),
            destination: destination.to_string(),
            headers,
        }));
    }

    /// The broker goes away.
    pub fn drop_link(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
    }
}

#[async_trait]
impl StompSession for MockSession {
    fn connect(&self, _timeout: Duration) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::ConnectedToSocket);
        let _ = self.events.send(TransportEvent::ConnectedToProtocol);
    }

    fn disconnect(&self, _force: bool) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn subscribe(
        &self,
        destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let id = headers.get("id").cloned().unwrap_or_default();
        self.subscribe_attempts
            .lock()
            .unwrap()
            .push((destination.to_string(), id.clone()));

        let latency = self.subscribe_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let failed = self
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Protocol {
                description: "subscription refused".into(),
                receipt_id: None,
            });
        }
        self.wire_log.lock().unwrap().push(format!("SUBSCRIBE {}", id));
        self.subscribes
            .lock()
            .unwrap()
            .push((destination.to_string(), id));
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let id = headers.get("id").cloned().unwrap_or_default();
        self.wire_log.lock().unwrap().push(format!("UNSUBSCRIBE {}", id));
        self.unsubscribes.lock().unwrap().push(id);
        Ok(())
    }

    fn send(
        &self,
        body: Vec<u8>,
        destination: &str,
        receipt_id: Option<String>,
        _headers: HashMap<String, String>,
    ) {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), body, receipt_id));
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn messages(&self) -> broadcast::Receiver<Arc<InboundFrame>> {
        self.messages.subscribe()
    }
}

#[derive(Default)]
pub struct MockFactory {
    sessions: Mutex<Vec<(Arc<MockSession>, Url)>>,
    subscribe_failures: Arc<AtomicUsize>,
    subscribe_latency_ms: Arc<AtomicU64>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` SUBSCRIBEs, across sessions, are refused.
    pub fn fail_subscribes(&self, count: usize) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    /// The broker takes this long to accept each SUBSCRIBE.
    pub fn subscribe_latency(&self, latency: Duration) {
        self.subscribe_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index].0)
    }

    pub fn last(&self) -> Arc<MockSession> {
        let sessions = self.sessions.lock().unwrap();
        Arc::clone(&sessions.last().expect("no session opened").0)
    }
}

impl SessionFactory for MockFactory {
    fn open(
        &self,
        url: &Url,
        _headers: &HashMap<String, String>,
        _options: SessionOptions,
    ) -> Arc<dyn StompSession> {
        let session = MockSession::new(
            Arc::clone(&self.subscribe_failures),
            Arc::clone(&self.subscribe_latency_ms),
        );
        self.sessions
            .lock()
            .unwrap()
            .push((Arc::clone(&session), url.clone()));
        session
    }
}

pub fn manager(
    poster: Arc<ScriptedPoster>,
    factory: Arc<MockFactory>,
) -> StompManager<MockChannel> {
    StompManager::new(MockChannel, poster, factory, StompConfig::default())
}

/// Polls `condition` on virtual time until it holds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..3000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Polls the manager's snapshot until `condition` holds and returns it.
pub async fn wait_for_snapshot<C, F>(manager: &StompManager<C>, what: &str, mut condition: F) -> ManagerSnapshot
where
    C: StompChannel,
    F: FnMut(&ManagerSnapshot) -> bool,
{
    for _ in 0..3000 {
        let snapshot = manager.snapshot().await.expect("manager task is gone");
        if condition(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
