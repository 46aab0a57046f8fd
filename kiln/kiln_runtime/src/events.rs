//! Server event notifications.
//!
//! The event bus fans notifications out to subscribers over bounded
//! channels. Publishing never waits: a subscriber whose buffer is full
//! misses the event, and a subscriber whose receiver is gone is pruned.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use kiln_core::id::ConnectionId;
use kiln_core::types::{RequestMeta, TransportId};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A notification published by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A handshake completed and its 101 response was sent
    ConnectionOpened {
        /// Transport the session lives on
        transport: TransportId,

        /// Registered connection
        connection: ConnectionId,

        /// Metadata of the upgrade request
        request: RequestMeta,
    },
}

impl ServerEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionOpened { .. } => "connection_opened",
        }
    }

    /// The transport the event concerns.
    pub fn transport(&self) -> TransportId {
        match self {
            Self::ConnectionOpened { transport, .. } => *transport,
        }
    }
}

/// Fan-out of [`ServerEvent`]s to any number of subscribers.
#[derive(Debug)]
pub struct EventBus {
    buffer: usize,
    subscribers: Mutex<Vec<mpsc::Sender<ServerEvent>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus whose subscribers buffer `buffer` events each.
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers.lock().push(tx);
        debug!(buffer = self.buffer, "Added event subscriber");
        rx
    }

    /// Deliver `event` to every live subscriber without waiting.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();

        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = event.name(), "Event subscriber lagging, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Pruning closed event subscriber");
                false
            }
        });

        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(event = event.name(), transport = %event.transport(), delivered, "Published event");
        delivered
    }

    /// Number of subscribers still registered.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Events published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries skipped because a subscriber was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Consumer of server events.
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    /// Handle one event.
    async fn on_event(&self, event: ServerEvent);
}

/// Drive `listener` with events from `receiver` in a task of its own.
///
/// The task ends when the bus is dropped.
pub fn spawn_listener<L>(mut receiver: mpsc::Receiver<ServerEvent>, listener: L) -> JoinHandle<()>
where
    L: EventListener,
{
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            listener.on_event(event).await;
        }
        debug!("Event listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;

    fn opened(raw: u64) -> ServerEvent {
        let request = http::Request::builder()
            .uri("/ws")
            .body(Bytes::new())
            .unwrap();
        ServerEvent::ConnectionOpened {
            transport: TransportId::new(raw),
            connection: ConnectionId::new(),
            request: RequestMeta::from_request(&request),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(opened(1)), 2);

        assert_eq!(a.recv().await.unwrap().transport(), TransportId::new(1));
        assert_eq!(b.recv().await.unwrap().transport(), TransportId::new(1));
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(opened(1)), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_does_not_block() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe();

        assert_eq!(bus.publish(opened(1)), 1);
        assert_eq!(bus.publish(opened(2)), 0);
        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(bus.subscriber_count(), 1);

        assert_eq!(slow.recv().await.unwrap().transport(), TransportId::new(1));
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let bus = EventBus::new(4);
        let gone = bus.subscribe();
        let _kept = bus.subscribe();
        drop(gone);

        assert_eq!(bus.publish(opened(1)), 1);
        assert_eq!(bus.subscriber_count(), 1);
    }

    struct Collect(Arc<Mutex<Vec<TransportId>>>);

    #[async_trait]
    impl EventListener for Collect {
        async fn on_event(&self, event: ServerEvent) {
            self.0.lock().push(event.transport());
        }
    }

    #[tokio::test]
    async fn test_spawned_listener_consumes_events() {
        let bus = EventBus::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_listener(bus.subscribe(), Collect(Arc::clone(&seen)));

        bus.publish(opened(5));
        bus.publish(opened(6));
        drop(bus);

        handle.await.unwrap();
        assert_eq!(*seen.lock(), vec![TransportId::new(5), TransportId::new(6)]);
    }
}
