//! In-process event bus.
//!
//! Two ways to listen:
//! - [`EventBus::subscribe`] registers a handler that is called synchronously
//!   during [`EventBus::publish`]. Handler errors and panics are logged and
//!   never stop delivery to the remaining handlers.
//! - [`EventBus::stream`] returns a broadcast receiver for async consumers
//!   (dashboards, the CLI). Slow receivers lose the oldest events.
//!
//! Events from one publisher arrive in publish order. Nothing is promised
//! across publishers.

use crate::event::{CoordinationEvent, EventKind};
use crate::id::SubscriptionId;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Something that reacts to events.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. Errors are logged by the bus.
    fn handle(&self, event: &CoordinationEvent) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&CoordinationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, event: &CoordinationEvent) -> anyhow::Result<()> {
        self(event)
    }
}

struct Registration {
    id: SubscriptionId,
    kind: Option<EventKind>,
    handler: Arc<dyn EventHandler>,
}

struct BusInner {
    handlers: RwLock<Vec<Registration>>,
    sender: broadcast::Sender<CoordinationEvent>,
}

/// Publish/subscribe channel for [`CoordinationEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose stream buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(Vec::new()),
                sender,
            }),
        }
    }

    /// Create a bus with the default capacity (1024).
    pub fn with_default_capacity() -> Self {
        Self::new(1024)
    }

    /// Deliver `event` to every matching handler and to stream receivers.
    ///
    /// Returns how many handlers completed without error.
    pub fn publish(&self, event: CoordinationEvent) -> usize {
        let kind = event.kind();
        debug!(event = %kind, "Publishing event");

        // Snapshot so handlers may subscribe, unsubscribe or publish re-entrantly.
        let targets: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .inner
            .handlers
            .read()
            .iter()
            .filter(|r| r.kind.map_or(true, |k| k == kind))
            .map(|r| (r.id, Arc::clone(&r.handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscription = %id, event = %kind, error = %e, "Event handler failed");
                }
                Err(_) => {
                    error!(subscription = %id, event = %kind, "Event handler panicked");
                }
            }
        }

        if self.inner.sender.send(event).is_err() {
            debug!(event = %kind, "No stream receivers");
        }

        delivered
    }

    /// Call `handler` for every event of `kind`.
    pub fn subscribe<H: EventHandler>(&self, kind: EventKind, handler: H) -> Subscription {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Call `handler` for every event.
    pub fn subscribe_all<H: EventHandler>(&self, handler: H) -> Subscription {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = SubscriptionId::new();
        self.inner.handlers.write().push(Registration { id, kind, handler });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every event published from now on.
    pub fn stream(&self) -> EventStream {
        EventStream {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the handler. Returns false if the bus is gone.
    pub fn unsubscribe(self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut handlers = bus.handlers.write();
        let before = handlers.len();
        handlers.retain(|r| r.id != self.id);
        handlers.len() != before
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner")
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

/// Async receiver over all published events.
pub struct EventStream {
    receiver: broadcast::Receiver<CoordinationEvent>,
}

impl EventStream {
    /// Next event; `None` once the bus is dropped. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<CoordinationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event stream lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<CoordinationEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Event stream lagged by {} events", n);
                }
                Err(_) => return None,
            }
        }
    }
}
