//! In-memory collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use crate::core::channel::StompChannel;
use crate::core::credential::{Credential, HttpPoster};
use crate::core::error::{HttpError, TransportError};
use crate::core::transport::{
    InboundFrame, SessionFactory, SessionOptions, StompSession, TransportEvent, ID_HEADER,
};

pub(crate) struct TestChannel;

impl StompChannel for TestChannel {
    fn user_token(&self) -> &str {
        "user-1"
    }
    fn handshake_url(&self) -> &str {
        "https://broker.test/handshake"
    }
    fn handshake_params(&self) -> serde_json::Value {
        serde_json::json!({ "token": "user-1" })
    }
    fn stomp_url(&self, credential: &Credential) -> Option<String> {
        Some(format!("wss://broker.test/ws?id={}", credential.handshake_id))
    }
}

pub(crate) type Scripted = Result<Option<Vec<u8>>, HttpError>;

/// Replays scripted responses; the last one repeats once the script runs out.
pub(crate) struct ScriptedPoster {
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl ScriptedPoster {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Self::with_latency(script, Duration::ZERO)
    }

    pub fn with_latency(script: Vec<Scripted>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            latency,
        })
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
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

pub(crate) fn ok_body(json: serde_json::Value) -> Scripted {
    Ok(Some(serde_json::to_vec(&json).unwrap()))
}

pub(crate) fn network_down() -> Scripted {
    Err(HttpError::Transport("connection refused".into()))
}

/// How a [`RecordingSession`] answers `connect`.
#[derive(Debug, Clone)]
pub(crate) enum ConnectBehavior {
    Accept,
    Reject(TransportError),
    Silent,
}

pub(crate) struct RecordingSession {
    behavior: ConnectBehavior,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    subscribes: Mutex<Vec<String>>,
    unsubscribes: Mutex<Vec<String>>,
    events: broadcast::Sender<TransportEvent>,
    messages: broadcast::Sender<Arc<InboundFrame>>,
}

impl RecordingSession {
    pub fn new(behavior: ConnectBehavior) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let (messages, _) = broadcast::channel(16);
        Arc::new(Self {
            behavior,
            connected: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            events,
            messages,
        })
    }

    /// A session that is already connected.
    pub fn connected() -> Arc<Self> {
        let session = Self::new(ConnectBehavior::Accept);
        session.connected.store(true, Ordering::SeqCst);
        session
    }

    pub fn subscribes(&self) -> Vec<String> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.unsubscribes.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn push_frame(&self, frame: InboundFrame) {
        let _ = self.messages.send(Arc::new(frame));
    }

    /// Simulates the broker closing the socket.
    pub fn drop_link(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Disconnected(reason.to_string()));
    }
}

#[async_trait]
impl StompSession for RecordingSession {
    fn connect(&self, _timeout: Duration) {
        match &self.behavior {
            ConnectBehavior::Accept => {
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::ConnectedToSocket);
                let _ = self.events.send(TransportEvent::ConnectedToProtocol);
            }
            ConnectBehavior::Reject(error) => {
                let _ = self.events.send(TransportEvent::Error(error.clone()));
            }
            ConnectBehavior::Silent => {}
        }
    }

    fn disconnect(&self, _force: bool) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn subscribe(
        &self,
        _destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let id = headers.get(ID_HEADER).cloned().unwrap_or_default();
        self.subscribes.lock().unwrap().push(id);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _destination: &str,
        headers: HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let id = headers.get(ID_HEADER).cloned().unwrap_or_default();
        self.unsubscribes.lock().unwrap().push(id);
        Ok(())
    }

    fn send(
        &self,
        _body: Vec<u8>,
        _destination: &str,
        _receipt_id: Option<String>,
        _headers: HashMap<String, String>,
    ) {
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

/// Opens [`RecordingSession`]s, one scripted behavior per open; the last repeats.
pub(crate) struct RecordingFactory {
    behaviors: Mutex<VecDeque<ConnectBehavior>>,
    opened: Mutex<Vec<(Arc<RecordingSession>, Url)>>,
}

impl RecordingFactory {
    pub fn new(behaviors: Vec<ConnectBehavior>) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(behaviors.into()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<Arc<RecordingSession>> {
        self.opened.lock().unwrap().iter().map(|(s, _)| Arc::clone(s)).collect()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.opened.lock().unwrap().last().map(|(_, url)| url.clone())
    }
}

impl SessionFactory for RecordingFactory {
    fn open(
        &self,
        url: &Url,
        _headers: &HashMap<String, String>,
        _options: SessionOptions,
    ) -> Arc<dyn StompSession> {
        let behavior = {
            let mut behaviors = self.behaviors.lock().unwrap();
            if behaviors.len() > 1 {
                behaviors.pop_front().unwrap()
            } else {
                behaviors.front().cloned().unwrap_or(ConnectBehavior::Accept)
            }
        };
        let session = RecordingSession::new(behavior);
        self.opened.lock().unwrap().push((Arc::clone(&session), url.clone()));
        session
    }
}
