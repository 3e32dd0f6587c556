//! # Connection State Machine
//!
//! Owns the single transport session of a manager and runs the
//! handshake → url → session-open → protocol-connect sequence.
//!
//! ```text
//! Unstarted ─► Connecting(0..=2) ─► Connected ─► Disconnected
//!                    │                               │
//!                    └──► Failed(reason)   ◄─ connect() again
//! ```
//!
//! The connection never reconnects on its own; it reports what happened on a
//! [`ConnectionSignal`] channel and the manager decides. Inbound frames of the
//! current session are forwarded to one broadcast feed that outlives
//! individual sessions, so publishers subscribe to it once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::configs::StompConfig;
use crate::core::channel::StompChannel;
use crate::core::credential::CredentialFetcher;
use crate::core::error::{ConnectionError, TransportError};
use crate::core::transport::{
    InboundFrame, SessionFactory, SessionOptions, SessionRef, StompSession, TransportEvent,
};

/// Capacity of the shared inbound frame feed.
const FRAME_FEED_CAPACITY: usize = 1024;

/// Progress markers reported while `Connecting`.
pub mod progress {
    /// Fetching the handshake credential.
    pub const HANDSHAKE: u8 = 0;
    /// Deriving the STOMP URL.
    pub const URL: u8 = 1;
    /// Session opened, waiting for the broker.
    pub const SESSION: u8 = 2;
}

#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    Unstarted,
    Connecting(u8),
    Connected(SessionRef),
    Disconnected,
    Failed(ConnectionError),
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionStatus::Connecting(_))
    }
}

/// What the connection reports to its owner. `generation` identifies the
/// session the signal belongs to.
#[derive(Debug, Clone)]
pub enum ConnectionSignal {
    Connected { generation: u64, session: SessionRef },
    Disconnected { generation: u64, reason: String },
    ReceiveError { generation: u64, error: TransportError },
}

/// State shared with the per-session listener task.
struct Shared {
    status: watch::Sender<ConnectionStatus>,
    generation: AtomicU64,
    frames: broadcast::Sender<Arc<InboundFrame>>,
    signals: mpsc::UnboundedSender<ConnectionSignal>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

struct ActiveSession {
    session: Arc<dyn StompSession>,
    listener: Option<JoinHandle<()>>,
}

pub struct Connection<C: StompChannel> {
    channel: Arc<C>,
    fetcher: Arc<CredentialFetcher<C>>,
    factory: Arc<dyn SessionFactory>,
    connect_timeout: Duration,
    keepalive: bool,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
}

impl<C: StompChannel> Connection<C> {
    /// Returns the connection and the receiving end of its signal channel.
    pub fn new(
        channel: Arc<C>,
        fetcher: Arc<CredentialFetcher<C>>,
        factory: Arc<dyn SessionFactory>,
        config: &StompConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Unstarted);
        let (frames, _) = broadcast::channel(FRAME_FEED_CAPACITY);

        let connection = Self {
            channel,
            fetcher,
            factory,
            connect_timeout: config.connect_timeout(),
            keepalive: config.keepalive,
            shared: Arc::new(Shared {
                status,
                generation: AtomicU64::new(0),
                frames,
                signals,
            }),
            active: Mutex::new(None),
        };
        (connection, signal_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.borrow().is_connected()
    }

    /// Generation of the newest session; 0 before the first one was opened.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Inbound frames of whichever session is current.
    pub fn frames(&self) -> broadcast::Receiver<Arc<InboundFrame>> {
        self.shared.frames.subscribe()
    }

    /// The active session, if the protocol is connected.
    pub fn session(&self) -> Option<Arc<dyn StompSession>> {
        match &*self.shared.status.borrow() {
            ConnectionStatus::Connected(session) => session.upgrade(),
            _ => None,
        }
    }

    /// Runs one connect attempt.
    ///
    /// Returns `false` at once if an attempt is already running and `true` at
    /// once if already connected.
    pub async fn connect(&self) -> bool {
        let mut already_connected = false;
        let claimed = self.shared.status.send_if_modified(|status| match status {
            ConnectionStatus::Connecting(_) => false,
            ConnectionStatus::Connected(_) => {
                already_connected = true;
                false
            }
            _ => {
                *status = ConnectionStatus::Connecting(progress::HANDSHAKE);
                true
            }
        });
        if !claimed {
            return already_connected;
        }

        let credential = match self.fetcher.fetch().await {
            Ok(credential) => credential,
            Err(e) => return self.fail(ConnectionError::HandshakeInit(e)),
        };

        self.set_status(ConnectionStatus::Connecting(progress::URL));
        let url = match self.channel.stomp_url(&credential).map(|raw| Url::parse(&raw)) {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                log::error!("Invalid STOMP URL for handshake {}: {}", credential.handshake_id, e);
                return self.fail(ConnectionError::UrlInit);
            }
            None => return self.fail(ConnectionError::UrlInit),
        };

        self.set_status(ConnectionStatus::Connecting(progress::SESSION));
        self.teardown();

        let session = self.factory.open(
            &url,
            &self.channel.stomp_headers(),
            SessionOptions {
                keepalive: self.keepalive,
            },
        );
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut events = session.events();
        let messages = session.messages();
        *self.lock_active() = Some(ActiveSession {
            session: Arc::clone(&session),
            listener: None,
        });

        log::info!("Connecting to {} (session {})", url, generation);
        session.connect(self.connect_timeout);

        let outcome = tokio::time::timeout(self.connect_timeout, await_protocol(&mut events)).await;
        if !self.shared.is_current(generation) {
            // Torn down while waiting.
            self.shared.status.send_if_modified(|status| {
                if status.is_connecting() {
                    *status = ConnectionStatus::Disconnected;
                    return true;
                }
                false
            });
            return false;
        }

        match outcome {
            Ok(Ok(())) => {
                let session_ref = SessionRef::new(&session);
                let listener = tokio::spawn(listen(
                    Arc::clone(&self.shared),
                    generation,
                    events,
                    messages,
                ));
                if let Some(active) = self.lock_active().as_mut() {
                    active.listener = Some(listener);
                }
                self.set_status(ConnectionStatus::Connected(session_ref.clone()));
                log::info!("STOMP session {} connected", generation);
                let _ = self.shared.signals.send(ConnectionSignal::Connected {
                    generation,
                    session: session_ref,
                });
                true
            }
            Ok(Err(ConnectOutcome::Closed(reason))) => {
                log::warn!("Session {} closed while connecting: {}", generation, reason);
                self.teardown();
                self.fetcher.invalidate();
                self.set_status(ConnectionStatus::Disconnected);
                false
            }
            Ok(Err(ConnectOutcome::Failed(error))) => {
                self.teardown();
                self.fetcher.invalidate();
                self.fail(ConnectionError::Protocol(error))
            }
            Err(_) => {
                self.teardown();
                self.fail(ConnectionError::Timeout)
            }
        }
    }

    /// Closes the active session, if any.
    pub fn disconnect(&self) {
        self.teardown();
        self.shared.status.send_if_modified(|status| {
            if matches!(status, ConnectionStatus::Connected(_)) {
                *status = ConnectionStatus::Disconnected;
                return true;
            }
            false
        });
    }

    /// Marks the connection disconnected after the listener saw the session
    /// go away. Ignored for superseded sessions.
    pub(crate) fn mark_disconnected(&self, generation: u64) {
        if !self.shared.is_current(generation) {
            return;
        }
        self.teardown();
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Tears down the current session. Bumps the generation so that signals
    /// and waiters of the old session are recognized as stale.
    fn teardown(&self) {
        let Some(active) = self.lock_active().take() else {
            return;
        };
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(listener) = active.listener {
            listener.abort();
        }
        active.session.disconnect(true);
        log::debug!("Previous STOMP session torn down");
    }

    fn fail(&self, error: ConnectionError) -> bool {
        log::error!("STOMP connect failed: {}", error);
        self.set_status(ConnectionStatus::Failed(error));
        false
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.status.send_replace(status);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: StompChannel> Drop for Connection<C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

enum ConnectOutcome {
    Closed(String),
    Failed(TransportError),
}

async fn await_protocol(events: &mut broadcast::Receiver<TransportEvent>) -> Result<(), ConnectOutcome> {
    loop {
        match events.recv().await {
            Ok(TransportEvent::ConnectedToProtocol) => return Ok(()),
            Ok(TransportEvent::ConnectedToSocket) => log::debug!("Socket open, awaiting CONNECTED"),
            Ok(TransportEvent::Disconnected(reason)) => return Err(ConnectOutcome::Closed(reason)),
            Ok(TransportEvent::Error(error)) => return Err(ConnectOutcome::Failed(error)),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err(ConnectOutcome::Failed(TransportError::Closed)),
        }
    }
}

/// Forwards frames of one session and reports its end.
async fn listen(
    shared: Arc<Shared>,
    generation: u64,
    mut events: broadcast::Receiver<TransportEvent>,
    mut messages: broadcast::Receiver<Arc<InboundFrame>>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TransportEvent::Disconnected(reason)) => {
                    report_disconnect(&shared, generation, reason);
                    break;
                }
                Ok(TransportEvent::Error(error)) => {
                    log::warn!("STOMP session {} error: {}", generation, error);
                    let _ = shared.signals.send(ConnectionSignal::ReceiveError { generation, error });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Session {} event feed lagged by {}", generation, skipped);
                }
                Err(RecvError::Closed) => {
                    report_disconnect(&shared, generation, "event feed closed".to_string());
                    break;
                }
            },
            message = messages.recv() => match message {
                Ok(frame) => {
                    let _ = shared.frames.send(frame);
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Session {} dropped {} inbound frames", generation, skipped);
                }
                Err(RecvError::Closed) => {
                    report_disconnect(&shared, generation, "message feed closed".to_string());
                    break;
                }
            },
        }
    }
}

fn report_disconnect(shared: &Shared, generation: u64, reason: String) {
    if !shared.is_current(generation) {
        return;
    }
    log::warn!("STOMP session {} disconnected: {}", generation, reason);
    let _ = shared.signals.send(ConnectionSignal::Disconnected { generation, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::FetchError;
    use crate::core::test_support::{
        ok_body, ConnectBehavior, RecordingFactory, ScriptedPoster, TestChannel,
    };
    use crate::core::transport::{FramePayload, SUBSCRIPTION_HEADER};
    use std::collections::HashMap;

    fn connection(
        poster: Arc<ScriptedPoster>,
        factory: Arc<RecordingFactory>,
    ) -> (Connection<TestChannel>, mpsc::UnboundedReceiver<ConnectionSignal>) {
        let config = StompConfig::default();
        let channel = Arc::new(TestChannel);
        let fetcher = Arc::new(CredentialFetcher::new(Arc::clone(&channel), poster, &config));
        Connection::new(channel, fetcher, factory, &config)
    }

    fn handshake_ok() -> Arc<ScriptedPoster> {
        ScriptedPoster::new(vec![ok_body(
            serde_json::json!({ "code": 200, "handshakeId": "abc", "expiresIn": 60 }),
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_forwards_frames() {
        let factory = RecordingFactory::new(vec![ConnectBehavior::Accept]);
        let (connection, mut signals) = connection(handshake_ok(), factory.clone());
        let mut frames = connection.frames();

        assert!(connection.connect().await);
        assert!(connection.is_connected());
        assert!(connection.connect().await);
        assert_eq!(factory.opened().len(), 1);
        assert_eq!(factory.last_url().unwrap().as_str(), "wss://broker.test/ws?id=abc");
        assert!(matches!(signals.recv().await, Some(ConnectionSignal::Connected { generation: 1, .. })));

        let mut headers = HashMap::new();
        headers.insert(SUBSCRIPTION_HEADER.to_string(), "rs_1".to_string());
        factory.opened()[0].push_frame(InboundFrame {
            payload: FramePayload::Text("{}".into()),
            message_id: "m-1".into(),
            destination: "/topic/a".into(),
            headers,
        });
        assert_eq!(frames.recv().await.unwrap().message_id, "m-1");
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_failure_is_reported() {
        let poster = ScriptedPoster::new(vec![ok_body(serde_json::json!({ "code": 500, "msg": "down" }))]);
        let factory = RecordingFactory::new(vec![ConnectBehavior::Accept]);
        let (connection, _signals) = connection(poster, factory.clone());

        assert!(!connection.connect().await);
        assert!(matches!(
            connection.status(),
            ConnectionStatus::Failed(ConnectionError::HandshakeInit(FetchError::NonSuccessCode(_)))
        ));
        assert!(factory.opened().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_times_out_and_releases_session() {
        let factory = RecordingFactory::new(vec![ConnectBehavior::Silent]);
        let (connection, _signals) = connection(handshake_ok(), factory.clone());

        assert!(!connection.connect().await);
        assert!(matches!(connection.status(), ConnectionStatus::Failed(ConnectionError::Timeout)));
        assert_eq!(factory.opened()[0].disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_error_fails_the_attempt() {
        let factory = RecordingFactory::new(vec![ConnectBehavior::Reject(TransportError::Protocol {
            description: "bad login".into(),
            receipt_id: None,
        })]);
        let (connection, _signals) = connection(handshake_ok(), factory);

        assert!(!connection.connect().await);
        assert!(matches!(
            connection.status(),
            ConnectionStatus::Failed(ConnectionError::Protocol(TransportError::Protocol { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connect_runs_one_attempt() {
        let poster = ScriptedPoster::with_latency(
            vec![ok_body(serde_json::json!({ "code": 200, "handshakeId": "abc" }))],
            Duration::from_millis(100),
        );
        let factory = RecordingFactory::new(vec![ConnectBehavior::Accept]);
        let (connection, _signals) = connection(poster, factory.clone());

        let (first, second) = tokio::join!(connection.connect(), connection.connect());
        assert!(first);
        assert!(!second);
        assert_eq!(factory.opened().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_close_signals_disconnect() {
        let factory = RecordingFactory::new(vec![ConnectBehavior::Accept]);
        let (connection, mut signals) = connection(handshake_ok(), factory.clone());
        assert!(connection.connect().await);
        let _ = signals.recv().await;

        factory.opened()[0].drop_link("broker restart");
        match signals.recv().await {
            Some(ConnectionSignal::Disconnected { generation, reason }) => {
                assert_eq!(reason, "broker restart");
                connection.mark_disconnected(generation);
            }
            other => panic!("unexpected signal {:?}", other),
        }
        assert!(matches!(connection.status(), ConnectionStatus::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn drop_force_disconnects_the_session() {
        let factory = RecordingFactory::new(vec![ConnectBehavior::Accept]);
        let (connection, _signals) = connection(handshake_ok(), factory.clone());
        assert!(connection.connect().await);
        drop(connection);
        assert_eq!(factory.opened()[0].disconnects(), 1);
    }
}
