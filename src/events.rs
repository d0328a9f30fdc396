use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::mpsc;

/// How the server can be reached after startup, as reported in the ready
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// The gateway forwards this external address to the server.
    External(SocketAddr),
    /// Port mapping failed; the server is reachable on the local network
    /// only. `reason` carries the gateway error text.
    LocalOnly { reason: String },
}

/// Payload of [`ServerEvent::Ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    /// The address the listener actually bound.
    pub local: SocketAddr,
    pub reachability: Reachability,
}

/// Notifications fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Fired exactly once per successful start.
    Ready(ReadyInfo),
    /// One inbound payload, UTF-8 decoded and trimmed. Ordered per
    /// connection; no ordering across connections.
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A registered subscriber's receiving end. Dropping it is equivalent to
/// unsubscribing; the bus prunes the dead sender on the next emit.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the bus has been cleared or this
    /// subscription removed.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

/// One-to-many event fan-out. Subscribers live in a concurrent map so that
/// subscribe/unsubscribe racing a broadcast needs no lock around the emit
/// loop.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<DashMap<SubscriberId, mpsc::UnboundedSender<ServerEvent>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.remove(&id);
    }

    /// Deliver `event` to every live subscriber. Subscribers whose receiver
    /// has been dropped are removed along the way. No subscribers is fine.
    pub fn emit(&self, event: ServerEvent) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every registration. Pending receivers see end-of-stream.
    pub fn clear(&self) {
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
