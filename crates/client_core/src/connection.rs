use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak,
    },
};

use anyhow::Result;
use futures::StreamExt;
use shared::{
    domain::UserId,
    protocol::{EventKind, ServerEvent},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::transport::{ChannelStream, ChannelTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPresence {
    Absent,
    Live(UserId),
}

/// A server frame together with the identity of the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub identity: UserId,
    pub event: ServerEvent,
}

struct ActiveChannel {
    identity: UserId,
    generation: u64,
    pump: JoinHandle<()>,
}

struct Subscriber {
    kind: EventKind,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: StdMutex<HashMap<u64, Subscriber>>,
}

impl SubscriberRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, kind: EventKind) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, Subscriber { kind, tx });
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn dispatch(&self, identity: &UserId, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let mut subscribers = self.lock();
        subscribers.retain(|_, subscriber| !subscriber.tx.is_closed());
        subscribers
            .values()
            .filter(|subscriber| subscriber.kind == kind)
            .filter(|subscriber| {
                subscriber
                    .tx
                    .send(ChannelEvent {
                        identity: identity.clone(),
                        event: event.clone(),
                    })
                    .is_ok()
            })
            .count()
    }
}

/// Receiving end of a channel subscription for one event kind.
///
/// The subscription is removed from the connection manager when the handle
/// is dropped or [`Subscription::unsubscribe`] is called. It survives channel
/// reconnects.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the connection manager
    /// has been dropped. Frames queued before a reconnect still carry the
    /// identity of the channel they arrived on.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Owns the single realtime channel of a session.
pub struct ConnectionManager {
    transport: Arc<dyn ChannelTransport>,
    active: Arc<Mutex<Option<ActiveChannel>>>,
    generation: AtomicU64,
    subscribers: Arc<SubscriberRegistry>,
    presence: Arc<watch::Sender<ChannelPresence>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        let (presence, _) = watch::channel(ChannelPresence::Absent);
        Self {
            transport,
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            subscribers: Arc::new(SubscriberRegistry::default()),
            presence: Arc::new(presence),
        }
    }

    /// Reconciles the channel with `identity`: keeps the live channel when the
    /// identity is unchanged, otherwise tears it down first and opens a new
    /// one if an identity is given. Failures to open leave no channel.
    pub async fn connect(&self, identity: Option<&UserId>) -> Result<()> {
        let mut active = self.active.lock().await;
        if let (Some(current), Some(identity)) = (active.as_ref(), identity) {
            if &current.identity == identity && !current.pump.is_finished() {
                debug!(identity = %identity, "channel: already connected");
                return Ok(());
            }
        }

        if let Some(previous) = active.take() {
            previous.pump.abort();
            info!(identity = %previous.identity, "channel: torn down");
        }
        self.presence.send_replace(ChannelPresence::Absent);

        let Some(identity) = identity else {
            return Ok(());
        };

        let stream = self.transport.open(identity).await?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let pump = self.spawn_pump(identity.clone(), generation, stream);
        *active = Some(ActiveChannel {
            identity: identity.clone(),
            generation,
            pump,
        });
        self.presence
            .send_replace(ChannelPresence::Live(identity.clone()));
        info!(identity = %identity, generation, "channel: live");
        Ok(())
    }

    pub async fn disconnect(&self) {
        // Infallible without an identity to open.
        let _ = self.connect(None).await;
    }

    pub fn presence(&self) -> ChannelPresence {
        self.presence.borrow().clone()
    }

    pub fn watch_presence(&self) -> watch::Receiver<ChannelPresence> {
        self.presence.subscribe()
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.subscribers.register(kind)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn spawn_pump(&self, identity: UserId, generation: u64, mut stream: ChannelStream) -> JoinHandle<()> {
        let subscribers = Arc::clone(&self.subscribers);
        let active = Arc::clone(&self.active);
        let presence = Arc::clone(&self.presence);
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => {
                        let delivered = subscribers.dispatch(&identity, &event);
                        debug!(identity = %identity, kind = ?event.kind(), delivered, "channel: event dispatched");
                    }
                    Err(err) => {
                        warn!(identity = %identity, "channel: dropping unreadable frame: {err}");
                    }
                }
            }

            let mut guard = active.lock().await;
            if guard.as_ref().map(|channel| channel.generation) == Some(generation) {
                *guard = None;
                presence.send_replace(ChannelPresence::Absent);
                info!(identity = %identity, "channel: closed by remote");
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.try_lock() {
            if let Some(channel) = active.take() {
                channel.pump.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
