//! # STOMP Manager
//!
//! Facade over one [`Connection`] and the publisher [`Registry`].
//!
//! All mutable state lives in a single actor task. Public calls and the
//! results of network operations are turned into [`Command`]s and processed
//! one at a time, so registry, pending set and timers never see interleaved
//! mutations. Network I/O (connect, wire subscribe/unsubscribe) runs on
//! spawned tasks that post their outcome back to the actor.
//!
//! The reconnect timer and the pending-recheck timer are both arms of the
//! actor's `select!`. A pending identity whose SUBSCRIBE is in flight is
//! never asked again until that request resolves.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::configs::StompConfig;
use crate::core::backoff::ReconnectBackoff;
use crate::core::callback_queue::CallbackQueue;
use crate::core::channel::StompChannel;
use crate::core::connection::{Connection, ConnectionSignal, ConnectionStatus};
use crate::core::credential::{CredentialFetcher, HttpPoster};
use crate::core::dispatcher::{
    DecodedMessage, DeliveryStrategy, Dispatcher, DispatcherLink, FeedSinks, MessageCallback,
    UndecodedMessage,
};
use crate::core::error::{SendError, SubscriptionError};
use crate::core::publisher::{Publisher, WireFuture, WireStep};
use crate::core::registry::{PublisherSnapshot, Registry};
use crate::core::subscription::{DestinationIdentity, DestinationSpec, SubscriptionHandle};
use crate::core::transport::{InboundFrame, SessionFactory, SessionRef};

/// Capacity of the decoded/undecoded broadcast feeds.
const FEED_CAPACITY: usize = 512;

/// Outcome of the wire subscribe behind a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeResult {
    Success { header_id: String },
    Failed { header_id: String, error: SubscriptionError },
}

/// Optional knobs for [`StompManager::subscribe_with`].
#[derive(Default)]
pub struct SubscribeOptions {
    /// Prepended to the wire id. The first subscriber of an identity decides it.
    pub header_id_prefix: Option<String>,
    /// Called on the subscriber's queue once the wire subscribe resolves.
    pub on_subscribed: Option<Box<dyn FnOnce(SubscribeResult) + Send + 'static>>,
}

/// Point-in-time view of the manager, for diagnostics.
#[derive(Debug, Clone)]
pub struct ManagerSnapshot {
    pub status: ConnectionStatus,
    pub publishers: Vec<PublisherSnapshot>,
    pub pending: Vec<DestinationIdentity>,
    /// Delay the next failed connect attempt would wait.
    pub reconnect_delay: Duration,
    pub reconnect_failures: u32,
    /// The reconnect loop is waiting for a first subscription.
    pub reconnect_parked: bool,
}

/// Spawns a subscriber's dispatcher once the publisher's wire id is known.
/// Runs on the manager task, so subscribing needs no runtime context.
type StartDispatcher = Box<dyn FnOnce(String) + Send + 'static>;

pub(crate) struct Registration {
    identity: DestinationIdentity,
    identifier: String,
    destination: String,
    headers: BTreeMap<String, String>,
    wire_id: String,
    link: DispatcherLink,
    start_dispatcher: StartDispatcher,
    queue: CallbackQueue,
    on_subscribed: Option<Box<dyn FnOnce(SubscribeResult) + Send + 'static>>,
}

/// Everything the actor reacts to.
pub(crate) enum Command {
    Register(Box<Registration>),
    Release {
        identity: DestinationIdentity,
        identifier: String,
        token: u64,
    },
    Unsubscribe {
        identity: DestinationIdentity,
        identifier: String,
    },
    StartConnection {
        delay: Duration,
    },
    ConnectFinished {
        connected: bool,
    },
    WireSubscribed {
        identity: DestinationIdentity,
        epoch: u64,
        result: Result<(), SubscriptionError>,
    },
    WireUnsubscribed {
        identity: DestinationIdentity,
        result: Result<(), SubscriptionError>,
    },
    Snapshot(oneshot::Sender<ManagerSnapshot>),
}

/// Client-side STOMP connection and subscription manager.
///
/// Dropping the manager stops its task and closes the session; handles that
/// outlive it release as no-ops.
pub struct StompManager<C: StompChannel> {
    channel: Arc<C>,
    connection: Arc<Connection<C>>,
    commands: mpsc::UnboundedSender<Command>,
    feeds: FeedSinks,
    connectivity: watch::Receiver<bool>,
    next_token: AtomicU64,
    shutdown: CancellationToken,
}

impl<C: StompChannel> StompManager<C> {
    /// Builds the manager and starts its task. Nothing is dialed until the
    /// first subscription (or [`Self::start_connection`]).
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn new(
        channel: C,
        http: Arc<dyn HttpPoster>,
        factory: Arc<dyn SessionFactory>,
        config: StompConfig,
    ) -> Self {
        let channel = Arc::new(channel);
        let fetcher = Arc::new(CredentialFetcher::new(Arc::clone(&channel), http, &config));
        let (connection, signals) = Connection::new(Arc::clone(&channel), fetcher, factory, &config);
        let connection = Arc::new(connection);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (connectivity_tx, connectivity) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let task = ManagerTask {
            connection: Arc::clone(&connection),
            registry: Registry::default(),
            commands: commands.clone(),
            current_session: None,
            epoch: 0,
            backoff: ReconnectBackoff::from_config(&config),
            reconnect_at: None,
            attempt_in_flight: false,
            reconnect_parked: false,
            recheck_at: None,
            recheck_first_delay: config.recheck_first_delay(),
            recheck_interval: config.recheck_interval(),
            disconnect_retry_delay: config.disconnect_retry_delay(),
            connectivity: connectivity_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(task.run(command_rx, signals));

        log::info!("STOMP manager created for user {}", channel.user_token());
        Self {
            channel,
            connection,
            commands,
            feeds: FeedSinks::new(FEED_CAPACITY),
            connectivity,
            next_token: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Registers a subscriber decoding frames into `T`.
    ///
    /// Returns `None` if the destination or identifier is empty. Drop or
    /// release the handle to stop delivery.
    pub fn subscribe<T, F>(
        &self,
        spec: DestinationSpec,
        strategy: DeliveryStrategy,
        queue: CallbackQueue,
        callback: F,
    ) -> Option<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T, &InboundFrame) + Send + Sync + 'static,
    {
        self.subscribe_with(spec, strategy, queue, SubscribeOptions::default(), callback)
    }

    /// [`Self::subscribe`] with a wire id prefix and/or a subscribed notification.
    pub fn subscribe_with<T, F>(
        &self,
        spec: DestinationSpec,
        strategy: DeliveryStrategy,
        queue: CallbackQueue,
        options: SubscribeOptions,
        callback: F,
    ) -> Option<SubscriptionHandle>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T, &InboundFrame) + Send + Sync + 'static,
    {
        if !spec.is_valid() {
            log::error!(
                "Refusing subscription with empty destination or identifier ('{}', '{}')",
                spec.destination,
                spec.identifier
            );
            return None;
        }

        let identity = spec.identity(self.channel.user_token());
        let wire_id = identity.wire_id(options.header_id_prefix.as_deref());
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let (mailbox, frames) = mpsc::unbounded_channel();
        let callback: MessageCallback<T> = Arc::new(callback);
        let start_dispatcher: StartDispatcher = {
            let identifier = spec.identifier.clone();
            let destination = spec.destination.clone();
            let queue = queue.clone();
            let feeds = self.feeds.clone();
            Box::new(move |wire_id| {
                Dispatcher::new(identifier, wire_id, destination, strategy, queue, callback, feeds)
                    .spawn(frames);
            })
        };

        let registration = Registration {
            identity: identity.clone(),
            identifier: spec.identifier.clone(),
            destination: spec.destination,
            headers: spec.headers,
            wire_id,
            link: DispatcherLink { token, mailbox },
            start_dispatcher,
            queue,
            on_subscribed: options.on_subscribed,
        };
        if self.commands.send(Command::Register(Box::new(registration))).is_err() {
            log::error!("STOMP manager task is gone, cannot subscribe {}", spec.identifier);
            return None;
        }

        Some(SubscriptionHandle::new(
            identity,
            spec.identifier,
            token,
            self.commands.downgrade(),
        ))
    }

    /// Removes the subscriber named by `spec` regardless of which handle registered it.
    pub fn unsubscribe(&self, spec: &DestinationSpec) {
        let _ = self.commands.send(Command::Unsubscribe {
            identity: spec.identity(self.channel.user_token()),
            identifier: spec.identifier.clone(),
        });
    }

    /// Starts the reconnect loop after `delay`. No-op if it is already running
    /// or the connection is up.
    pub fn start_connection(&self, delay: Duration) {
        let _ = self.commands.send(Command::StartConnection { delay });
    }

    pub fn connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn user_token(&self) -> &str {
        self.channel.user_token()
    }

    /// Publishes a frame on the current session, optionally asking for a receipt.
    pub fn send(
        &self,
        body: Vec<u8>,
        destination: &str,
        receipt_id: Option<String>,
        headers: HashMap<String, String>,
    ) -> Result<(), SendError> {
        if destination.is_empty() {
            return Err(SendError::EmptyDestination);
        }
        let session = self.connection.session().ok_or(SendError::NotConnected)?;
        session.send(body, destination, receipt_id, headers);
        Ok(())
    }

    pub fn decoded_messages(&self) -> broadcast::Receiver<DecodedMessage> {
        self.feeds.decoded.subscribe()
    }

    pub fn undecoded_messages(&self) -> broadcast::Receiver<UndecodedMessage> {
        self.feeds.undecoded.subscribe()
    }

    /// `true` while a protocol session is up.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.clone()
    }

    /// Registry state as seen by the manager task. `None` if the task is gone.
    pub async fn snapshot(&self) -> Option<ManagerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }
}

impl<C: StompChannel> Drop for StompManager<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ManagerTask<C: StompChannel> {
    connection: Arc<Connection<C>>,
    registry: Registry,
    commands: mpsc::UnboundedSender<Command>,
    current_session: Option<SessionRef>,
    /// Generation of the session wire results must belong to.
    epoch: u64,
    backoff: ReconnectBackoff,
    reconnect_at: Option<Instant>,
    attempt_in_flight: bool,
    reconnect_parked: bool,
    recheck_at: Option<Instant>,
    recheck_first_delay: Duration,
    recheck_interval: Duration,
    disconnect_retry_delay: Duration,
    connectivity: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl<C: StompChannel> ManagerTask<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        loop {
            let reconnect_at = self.reconnect_at;
            let recheck_at = self.recheck_at;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Some(signal) = signals.recv() => self.handle_signal(signal),
                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.attempt_connect();
                }
                _ = sleep_until(recheck_at.unwrap_or_else(Instant::now)), if recheck_at.is_some() => {
                    self.recheck_at = None;
                    self.recheck_pending();
                }
            }
        }

        self.connection.disconnect();
        self.connectivity.send_replace(false);
        log::info!("STOMP manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register(registration) => self.register(*registration),
            Command::Release { identity, identifier, token } => {
                if let Some(publisher) = self.registry.get_mut(&identity) {
                    publisher.release_registration(&identifier, token);
                    log::debug!("Released '{}' on {}", identifier, publisher.destination());
                }
                self.retire_if_unused(&identity);
            }
            Command::Unsubscribe { identity, identifier } => {
                if let Some(publisher) = self.registry.get_mut(&identity) {
                    if !publisher.remove_message_callback(&identifier) {
                        log::warn!("No subscriber '{}' on {}", identifier, publisher.destination());
                    }
                }
                self.retire_if_unused(&identity);
            }
            Command::StartConnection { delay } => self.start_connection(delay),
            Command::ConnectFinished { connected } => self.connect_finished(connected),
            Command::WireSubscribed { identity, epoch, result } => {
                self.wire_subscribed(identity, epoch, result)
            }
            Command::WireUnsubscribed { identity, result } => match result {
                Ok(()) => log::debug!("Wire unsubscribe done for {}", identity),
                Err(e) => log::warn!("Wire unsubscribe failed for {}: {}", identity, e),
            },
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_signal(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Connected { generation, session } => {
                if generation != self.connection.generation() {
                    log::debug!("Ignoring connect of superseded session {}", generation);
                    return;
                }
                self.epoch = generation;
                self.backoff.reset();
                self.registry.attach_session(&session);
                self.current_session = Some(session);
                self.connectivity.send_replace(true);
                log::info!(
                    "Connected; flushing {} pending subscriptions",
                    self.registry.pending().len()
                );
                self.flush_pending();
            }
            ConnectionSignal::Disconnected { generation, reason } => {
                if generation != self.connection.generation() {
                    return;
                }
                self.connection.mark_disconnected(generation);
                self.current_session = None;
                self.connectivity.send_replace(false);
                let requeued = self.registry.detach_session();
                log::warn!("Disconnected ({}); {} subscriptions requeued", reason, requeued);
                self.start_connection(self.disconnect_retry_delay);
            }
            ConnectionSignal::ReceiveError { error, .. } => {
                log::error!("STOMP receive error: {}", error);
            }
        }
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            identity,
            identifier,
            destination,
            headers,
            wire_id,
            link,
            start_dispatcher,
            queue,
            on_subscribed,
        } = registration;

        let connection = &self.connection;
        let current_session = self.current_session.clone();
        let publisher = self.registry.get_or_insert_with(&identity, || {
            let mut publisher = Publisher::new(
                identity.clone(),
                destination.clone(),
                wire_id,
                headers,
                connection.frames(),
            );
            publisher.set_session(current_session);
            publisher
        });

        // Later subscribers share the wire id the first one fixed.
        start_dispatcher(publisher.wire_id().to_string());
        if publisher.set_message_callback(&identifier, link) {
            log::warn!("Overriding message callback '{}' on {}", identifier, destination);
        }

        if let Some(on_subscribed) = on_subscribed {
            let header_id = publisher.wire_id().to_string();
            publisher.park(Box::new(move |result| {
                let outcome = match result {
                    Ok(()) => SubscribeResult::Success { header_id },
                    Err(error) => SubscribeResult::Failed { header_id, error },
                };
                queue.execute(move || on_subscribed(outcome));
            }));
        }

        self.start_connection(Duration::ZERO);
        if self.current_session.is_some() {
            self.request_subscribe(&identity);
        } else {
            self.registry.pending_mut().insert(identity);
        }
    }

    /// Issues the wire subscribe for `identity` unless it is done or in flight.
    fn request_subscribe(&mut self, identity: &DestinationIdentity) {
        let connected = self.current_session.is_some();
        let Some(publisher) = self.registry.get_mut(identity) else {
            return;
        };
        if !publisher.has_callbacks() {
            self.retire_if_unused(identity);
            return;
        }

        match publisher.subscribe() {
            WireStep::Done => {
                publisher.resolve_parked(Ok(()));
                self.registry.pending_mut().remove(identity);
            }
            WireStep::InFlight => {
                self.registry.pending_mut().remove(identity);
            }
            WireStep::Start(request) => {
                self.registry.pending_mut().remove(identity);
                let identity = identity.clone();
                let epoch = self.epoch;
                self.spawn_wire(request, move |result| Command::WireSubscribed {
                    identity,
                    epoch,
                    result,
                });
            }
            WireStep::Failed(error) => {
                if connected {
                    publisher.resolve_parked(Err(error));
                }
                self.registry.pending_mut().insert(identity.clone());
                self.arm_recheck();
            }
        }
    }

    fn wire_subscribed(
        &mut self,
        identity: DestinationIdentity,
        epoch: u64,
        result: Result<(), SubscriptionError>,
    ) {
        if epoch != self.epoch {
            log::debug!("Dropping subscribe result of an old session for {}", identity);
            return;
        }
        let Some(publisher) = self.registry.get_mut(&identity) else {
            return;
        };

        let failed = result.is_err();
        publisher.complete_subscribe(result);
        if !publisher.has_callbacks() {
            // Every subscriber left while the request was in flight.
            self.retire_if_unused(&identity);
        } else if failed {
            self.registry.pending_mut().insert(identity);
            self.arm_recheck();
        }
    }

    /// Unsubscribes and drops the publisher once nothing uses it.
    fn retire_if_unused(&mut self, identity: &DestinationIdentity) {
        let Some(publisher) = self.registry.get_mut(identity) else {
            return;
        };
        if publisher.has_callbacks() {
            return;
        }

        match publisher.unsubscribe() {
            WireStep::Start(request) => {
                let identity = identity.clone();
                self.spawn_wire(request, move |result| Command::WireUnsubscribed { identity, result });
            }
            WireStep::Failed(e) => log::debug!("Skipping wire unsubscribe for {}: {}", identity, e),
            WireStep::InFlight => {
                log::debug!("Unsubscribe of {} deferred until its SUBSCRIBE resolves", identity)
            }
            WireStep::Done => {}
        }
        self.registry.pending_mut().remove(identity);
        self.registry.remove_if_idle(identity);
    }

    fn spawn_wire<F>(&self, request: WireFuture, report: F)
    where
        F: FnOnce(Result<(), SubscriptionError>) -> Command + Send + 'static,
    {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = request.await;
            let _ = commands.send(report(result));
        });
    }

    fn flush_pending(&mut self) {
        for identity in self.registry.pending_mut().take_all() {
            self.request_subscribe(&identity);
        }
        if !self.registry.pending().is_empty() {
            self.arm_recheck();
        }
    }

    fn arm_recheck(&mut self) {
        if self.recheck_at.is_none() {
            self.recheck_at = Some(Instant::now() + self.recheck_first_delay);
        }
    }

    fn recheck_pending(&mut self) {
        if self.registry.pending().is_empty() {
            return;
        }
        if self.current_session.is_some() {
            log::info!("Rechecking {} pending subscriptions", self.registry.pending().len());
            self.flush_pending();
        }
        if !self.registry.pending().is_empty() {
            self.recheck_at = Some(Instant::now() + self.recheck_interval);
        }
    }

    fn start_connection(&mut self, delay: Duration) {
        if self.attempt_in_flight || self.reconnect_at.is_some() {
            return;
        }
        match self.connection.status() {
            ConnectionStatus::Connected(_) | ConnectionStatus::Connecting(_) => return,
            ConnectionStatus::Unstarted | ConnectionStatus::Disconnected | ConnectionStatus::Failed(_) => {}
        }
        self.reconnect_parked = false;
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn attempt_connect(&mut self) {
        if self.registry.is_empty() {
            log::info!("No subscriptions, connection parked");
            self.reconnect_parked = true;
            return;
        }
        if self.connection.is_connected() {
            return;
        }

        self.attempt_in_flight = true;
        let connection = Arc::clone(&self.connection);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let connected = connection.connect().await;
            let _ = commands.send(Command::ConnectFinished { connected });
        });
    }

    fn connect_finished(&mut self, connected: bool) {
        self.attempt_in_flight = false;
        if self.connection.is_connected() {
            self.backoff.reset();
            return;
        }
        if connected {
            // Dropped again before this report arrived.
            self.start_connection(self.disconnect_retry_delay);
            return;
        }
        let delay = self.backoff.next_delay();
        log::warn!(
            "Connect attempt {} failed ({:?}), retrying in {}s",
            self.backoff.failures(),
            self.connection.status(),
            delay.as_secs()
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            status: self.connection.status(),
            publishers: self.registry.snapshots(),
            pending: self.registry.pending().iter().cloned().collect(),
            reconnect_delay: self.backoff.current(),
            reconnect_failures: self.backoff.failures(),
            reconnect_parked: self.reconnect_parked,
        }
    }
}
