//! # Per-Subscriber Message Dispatcher
//!
//! A `Dispatcher` is the decode-and-deliver unit behind one logical
//! subscriber. Its publisher fans out `Arc<InboundFrame>` pointers into the
//! dispatcher's mailbox, so a frame shared by many subscribers is never copied.
//!
//! ## Delivery strategies
//!
//! - **`All`**: every frame is decoded and delivered, in arrival order.
//! - **`Throttle(interval)`**: the first frame is delivered immediately; later
//!   frames are coalesced so at most one delivery happens per `interval`,
//!   always carrying the most recent frame (trailing edge, latest wins).
//!
//! ## Decoding
//!
//! Every frame is published on the manager's undecoded feed. Frames that
//! decode into `T` also go to the decoded feed and to the subscriber callback,
//! which runs on the subscriber's [`CallbackQueue`]. A decode failure is local
//! to the frame: it is logged, the callback is skipped, and later frames are
//! processed normally.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::core::callback_queue::CallbackQueue;
use crate::core::transport::InboundFrame;

/// How frames are delivered to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStrategy {
    /// Deliver every frame.
    All,
    /// Deliver at most one frame per interval, always the latest.
    Throttle(Duration),
}

/// A successfully decoded frame, as seen on the manager-wide decoded feed.
#[derive(Clone)]
pub struct DecodedMessage {
    /// Wire subscription id of the publisher that routed the frame.
    pub wire_id: String,
    pub destination: String,
    /// Identifier of the subscriber whose dispatcher decoded it.
    pub identifier: String,
    /// The decoded value; downcast with `value.downcast_ref::<T>()`.
    pub value: Arc<dyn Any + Send + Sync>,
    /// `std::any::type_name` of the decoded type.
    pub type_name: &'static str,
}

impl std::fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("wire_id", &self.wire_id)
            .field("destination", &self.destination)
            .field("identifier", &self.identifier)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// A raw frame, as seen on the manager-wide undecoded feed.
#[derive(Debug, Clone)]
pub struct UndecodedMessage {
    pub wire_id: String,
    pub destination: String,
    pub identifier: String,
    pub frame: Arc<InboundFrame>,
    /// Set when the frame could not be decoded into the subscriber's type.
    pub decode_error: Option<String>,
}

/// Broadcast sinks shared by every dispatcher of a manager.
#[derive(Clone)]
pub(crate) struct FeedSinks {
    pub decoded: broadcast::Sender<DecodedMessage>,
    pub undecoded: broadcast::Sender<UndecodedMessage>,
}

impl FeedSinks {
    pub fn new(capacity: usize) -> Self {
        let (decoded, _) = broadcast::channel(capacity);
        let (undecoded, _) = broadcast::channel(capacity);
        Self { decoded, undecoded }
    }
}

/// Subscriber callback: decoded value plus the raw frame (headers, message id).
pub type MessageCallback<T> = Arc<dyn Fn(&T, &InboundFrame) + Send + Sync>;

/// Where a publisher routes frames to reach one dispatcher.
pub(crate) struct DispatcherLink {
    /// Registration token; a stale handle cannot remove a newer registration.
    pub token: u64,
    pub mailbox: mpsc::UnboundedSender<Arc<InboundFrame>>,
}

/// Decode-and-deliver unit for one logical subscriber.
pub struct Dispatcher<T> {
    identifier: String,
    wire_id: String,
    destination: String,
    strategy: DeliveryStrategy,
    queue: CallbackQueue,
    callback: MessageCallback<T>,
    feeds: FeedSinks,
    _decodes: PhantomData<fn() -> T>,
}

impl<T> Dispatcher<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        identifier: String,
        wire_id: String,
        destination: String,
        strategy: DeliveryStrategy,
        queue: CallbackQueue,
        callback: MessageCallback<T>,
        feeds: FeedSinks,
    ) -> Self {
        Self {
            identifier,
            wire_id,
            destination,
            strategy,
            queue,
            callback,
            feeds,
            _decodes: PhantomData,
        }
    }

    /// Starts the dispatcher. It stops when every sender of `frames` is dropped.
    pub(crate) fn spawn(self, frames: mpsc::UnboundedReceiver<Arc<InboundFrame>>) -> JoinHandle<()> {
        tokio::spawn(self.run(frames))
    }

    async fn run(self, mut frames: mpsc::UnboundedReceiver<Arc<InboundFrame>>) {
        match self.strategy {
            DeliveryStrategy::All => {
                while let Some(frame) = frames.recv().await {
                    self.dispatch(frame);
                }
            }
            DeliveryStrategy::Throttle(interval) => self.run_throttled(frames, interval).await,
        }
        log::debug!("Dispatcher '{}' ({}) stopped", self.identifier, self.destination);
    }

    async fn run_throttled(
        &self,
        mut frames: mpsc::UnboundedReceiver<Arc<InboundFrame>>,
        interval: Duration,
    ) {
        let mut window_end: Option<Instant> = None;
        let mut pending: Option<Arc<InboundFrame>> = None;

        loop {
            let deadline = window_end.unwrap_or_else(Instant::now);
            tokio::select! {
                received = frames.recv() => {
                    let Some(frame) = received else { break };
                    let now = Instant::now();
                    let window_open = window_end.map_or(true, |end| now >= end);
                    if window_open && pending.is_none() {
                        self.dispatch(frame);
                        window_end = Some(now + interval);
                    } else {
                        // Older frames inside the window are superseded.
                        pending = Some(frame);
                    }
                }
                _ = sleep_until(deadline), if pending.is_some() => {
                    if let Some(frame) = pending.take() {
                        self.dispatch(frame);
                        window_end = Some(Instant::now() + interval);
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Arc<InboundFrame>) {
        let decoded = serde_json::from_slice::<T>(frame.body());

        let _ = self.feeds.undecoded.send(UndecodedMessage {
            wire_id: self.wire_id.clone(),
            destination: self.destination.clone(),
            identifier: self.identifier.clone(),
            frame: Arc::clone(&frame),
            decode_error: decoded.as_ref().err().map(|e| e.to_string()),
        });

        let value = match decoded {
            Ok(value) => Arc::new(value),
            Err(e) => {
                log::error!(
                    "Dispatcher '{}' could not decode message {} on {}: {}",
                    self.identifier,
                    frame.message_id,
                    self.destination,
                    e
                );
                return;
            }
        };

        log::trace!(
            target: "stomp::message",
            "received msg: {} ({})\ndata: {}",
            self.identifier,
            self.wire_id,
            String::from_utf8_lossy(frame.body())
        );

        let _ = self.feeds.decoded.send(DecodedMessage {
            wire_id: self.wire_id.clone(),
            destination: self.destination.clone(),
            identifier: self.identifier.clone(),
            value: Arc::clone(&value) as Arc<dyn Any + Send + Sync>,
            type_name: std::any::type_name::<T>(),
        });

        let callback = Arc::clone(&self.callback);
        self.queue.execute(move || callback(value.as_ref(), frame.as_ref()));
    }
}
