//! # Publisher
//!
//! One publisher per [`DestinationIdentity`]. It owns the single wire
//! subscription shared by every logical subscriber of that identity and a
//! router task that picks its frames out of the connection's shared feed.
//!
//! The publisher does not own the session. It holds a [`SessionRef`] that the
//! manager refreshes on every successful connect.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::core::dispatcher::DispatcherLink;
use crate::core::error::SubscriptionError;
use crate::core::subscription::DestinationIdentity;
use crate::core::transport::{InboundFrame, SessionRef, StompSession, ID_HEADER};

/// Wire-level subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireState {
    Unsubscribed,
    /// A SUBSCRIBE is in flight.
    Subscribing,
    Subscribed,
}

/// Callback notified with the outcome of a wire subscribe.
pub type SubscribeCompletion = Box<dyn FnOnce(Result<(), SubscriptionError>) + Send + 'static>;

/// A transport request, to be awaited off the serialization domain.
pub type WireFuture = Pin<Box<dyn Future<Output = Result<(), SubscriptionError>> + Send + 'static>>;

/// What the caller has to do after asking for a wire operation.
pub enum WireStep {
    /// Nothing to do; the wire is already in the requested state.
    Done,
    /// An identical request is already in flight.
    InFlight,
    /// Await this request, then report back with the matching `complete_*` call.
    Start(WireFuture),
    /// The request could not be issued.
    Failed(SubscriptionError),
}

type Links = Arc<Mutex<HashMap<String, DispatcherLink>>>;

/// Multiplexes many dispatchers onto one wire subscription.
pub struct Publisher {
    identity: DestinationIdentity,
    destination: String,
    wire_id: String,
    subscribe_headers: BTreeMap<String, String>,
    wire_state: WireState,
    session: Option<SessionRef>,
    links: Links,
    handle_tokens: HashSet<u64>,
    parked: Vec<SubscribeCompletion>,
    router: JoinHandle<()>,
}

impl Publisher {
    /// Creates the publisher and starts routing frames from `feed`.
    pub(crate) fn new(
        identity: DestinationIdentity,
        destination: String,
        wire_id: String,
        subscribe_headers: BTreeMap<String, String>,
        feed: broadcast::Receiver<Arc<InboundFrame>>,
    ) -> Self {
        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let router = tokio::spawn(route_frames(
            feed,
            wire_id.clone(),
            destination.clone(),
            Arc::clone(&links),
        ));

        Self {
            identity,
            destination,
            wire_id,
            subscribe_headers,
            wire_state: WireState::Unsubscribed,
            session: None,
            links,
            handle_tokens: HashSet::new(),
            parked: Vec::new(),
            router,
        }
    }

    pub fn identity(&self) -> &DestinationIdentity {
        &self.identity
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn wire_id(&self) -> &str {
        &self.wire_id
    }

    pub fn wire_state(&self) -> WireState {
        self.wire_state
    }

    pub fn is_wire_subscribed(&self) -> bool {
        self.wire_state == WireState::Subscribed
    }

    /// Registers or replaces the dispatcher for `identifier`.
    ///
    /// Returns `true` if a dispatcher was replaced.
    pub(crate) fn set_message_callback(&mut self, identifier: &str, link: DispatcherLink) -> bool {
        self.handle_tokens.insert(link.token);
        lock_links(&self.links)
            .insert(identifier.to_string(), link)
            .is_some()
    }

    /// Removes the dispatcher for `identifier` regardless of which handle registered it.
    pub fn remove_message_callback(&mut self, identifier: &str) -> bool {
        let removed = lock_links(&self.links).remove(identifier);
        match removed {
            Some(link) => {
                self.handle_tokens.remove(&link.token);
                true
            }
            None => false,
        }
    }

    /// Drops the registration made under `token`. The dispatcher for
    /// `identifier` is only removed if it is still the one that token registered.
    pub(crate) fn release_registration(&mut self, identifier: &str, token: u64) -> bool {
        self.handle_tokens.remove(&token);
        let mut links = lock_links(&self.links);
        if links.get(identifier).is_some_and(|link| link.token == token) {
            links.remove(identifier);
            return true;
        }
        false
    }

    pub fn has_callbacks(&self) -> bool {
        !lock_links(&self.links).is_empty()
    }

    pub fn callback_count(&self) -> usize {
        lock_links(&self.links).len()
    }

    /// Whether any live handle still names this publisher.
    pub fn has_handles(&self) -> bool {
        !self.handle_tokens.is_empty()
    }

    /// No dispatchers, no handles and no SUBSCRIBE in flight: the registry may drop it.
    pub fn is_idle(&self) -> bool {
        !self.has_callbacks() && !self.has_handles() && self.wire_state != WireState::Subscribing
    }

    pub(crate) fn set_session(&mut self, session: Option<SessionRef>) {
        self.session = session;
    }

    /// The session went away; the wire subscription went with it.
    ///
    /// Returns whether the publisher had been (or was becoming) subscribed.
    pub(crate) fn reset_wire(&mut self) -> bool {
        let was_active = self.wire_state != WireState::Unsubscribed;
        self.wire_state = WireState::Unsubscribed;
        self.session = None;
        was_active
    }

    /// Parks `completion` until the in-flight or next subscribe resolves.
    pub(crate) fn park(&mut self, completion: SubscribeCompletion) {
        self.parked.push(completion);
    }

    /// Asks for the wire subscription.
    pub(crate) fn subscribe(&mut self) -> WireStep {
        match self.wire_state {
            WireState::Subscribed => WireStep::Done,
            WireState::Subscribing => WireStep::InFlight,
            WireState::Unsubscribed => {
                let Some(session) = self.live_session() else {
                    return WireStep::Failed(SubscriptionError::NotConnected);
                };
                self.wire_state = WireState::Subscribing;

                let destination = self.destination.clone();
                let mut headers: HashMap<String, String> = self
                    .subscribe_headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                headers.insert(ID_HEADER.to_string(), self.wire_id.clone());

                log::info!("Subscribing {} as {}", self.destination, self.wire_id);
                WireStep::Start(Box::pin(async move {
                    session
                        .subscribe(&destination, headers)
                        .await
                        .map_err(SubscriptionError::Transport)
                }))
            }
        }
    }

    /// Applies the result of a [`WireStep::Start`] from [`Self::subscribe`] and
    /// resolves every parked completion with it.
    pub(crate) fn complete_subscribe(&mut self, result: Result<(), SubscriptionError>) {
        if self.wire_state != WireState::Subscribing {
            log::debug!("Ignoring stale subscribe result for {}", self.wire_id);
            return;
        }
        match &result {
            Ok(()) => {
                self.wire_state = WireState::Subscribed;
                log::info!("Subscribed {} ({})", self.destination, self.wire_id);
            }
            Err(e) => {
                self.wire_state = WireState::Unsubscribed;
                log::warn!("Subscribe {} ({}) failed: {}", self.destination, self.wire_id, e);
            }
        }
        self.resolve_parked(result);
    }

    /// Resolves parked completions without touching the wire state.
    pub(crate) fn resolve_parked(&mut self, result: Result<(), SubscriptionError>) {
        for completion in self.parked.drain(..) {
            completion(result.clone());
        }
    }

    /// Asks for the wire unsubscribe. Idempotent when not subscribed.
    ///
    /// Returns [`WireStep::InFlight`] while a SUBSCRIBE is outstanding: the
    /// UNSUBSCRIBE must not overtake it, so the caller asks again once
    /// [`Self::complete_subscribe`] has run.
    pub(crate) fn unsubscribe(&mut self) -> WireStep {
        match self.wire_state {
            WireState::Unsubscribed => return WireStep::Done,
            WireState::Subscribing => return WireStep::InFlight,
            WireState::Subscribed => {}
        }
        self.wire_state = WireState::Unsubscribed;
        self.resolve_parked(Err(SubscriptionError::NotConnected));

        let Some(session) = self.live_session() else {
            return WireStep::Failed(SubscriptionError::NotConnected);
        };
        let destination = self.destination.clone();
        let mut headers = HashMap::new();
        headers.insert(ID_HEADER.to_string(), self.wire_id.clone());

        log::info!("Unsubscribing {} ({})", self.destination, self.wire_id);
        WireStep::Start(Box::pin(async move {
            session
                .unsubscribe(&destination, headers)
                .await
                .map_err(SubscriptionError::Transport)
        }))
    }

    fn live_session(&self) -> Option<Arc<dyn StompSession>> {
        self.session
            .as_ref()
            .and_then(SessionRef::upgrade)
            .filter(|session| session.is_connected())
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.router.abort();
        self.resolve_parked(Err(SubscriptionError::ManagerGone));
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("destination", &self.destination)
            .field("wire_id", &self.wire_id)
            .field("wire_state", &self.wire_state)
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

fn lock_links(links: &Links) -> MutexGuard<'_, HashMap<String, DispatcherLink>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Forwards frames addressed to `wire_id` on `destination` to every dispatcher mailbox.
async fn route_frames(
    mut feed: broadcast::Receiver<Arc<InboundFrame>>,
    wire_id: String,
    destination: String,
    links: Links,
) {
    loop {
        match feed.recv().await {
            Ok(frame) => {
                if frame.subscription_id() != Some(wire_id.as_str()) || frame.destination != destination {
                    continue;
                }
                let mut links = lock_links(&links);
                links.retain(|identifier, link| {
                    if link.mailbox.send(Arc::clone(&frame)).is_ok() {
                        return true;
                    }
                    log::warn!("Dispatcher '{}' on {} is gone, dropping it", identifier, destination);
                    false
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("Router for {} lagged, {} frames skipped", destination, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    log::debug!("Router for {} ({}) stopped", destination, wire_id);
}
