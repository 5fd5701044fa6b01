//! Typed event bus shared by the connection manager, the request correlator
//! and downstream consumers.
//!
//! Listeners are registered per [`EventKind`]. Registration returns either a
//! bare [`ListenerId`] (deregister with [`EventBus::off`]) or a
//! [`ListenerGuard`] that deregisters itself when dropped.

use crate::market::types::{MessageType, WireMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    Connected,
    Disconnected { code: u16, reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Reconnected { attempt: u32 },
    Error { message: String, fatal: bool },
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::Reconnected { .. } => EventKind::Reconnected,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Frame(MessageType),
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Frame(WireMessage),
    Lifecycle(LifecycleEvent),
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Frame(frame) => EventKind::Frame(frame.message_type),
            Self::Lifecycle(event) => event.kind(),
        }
    }

    pub fn as_frame(&self) -> Option<&WireMessage> {
        match self {
            Self::Frame(frame) => Some(frame),
            Self::Lifecycle(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

pub struct EventBus {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Handler)>>>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
            lifecycle_tx,
        }
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let mut removed = false;
        listeners.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(listener_id, _)| *listener_id != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    pub fn scoped<F>(self: &Arc<Self>, kind: EventKind, handler: F) -> ListenerGuard
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.on(kind, handler);
        ListenerGuard {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Dispatches to a snapshot of the current listeners so handlers may
    /// register or deregister without deadlocking.
    pub fn emit(&self, event: &BusEvent) {
        let handlers: Vec<Handler> = {
            let listeners = self.listeners.lock();
            match listeners.get(&event.kind()) {
                Some(entries) => entries.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => Vec::new(),
            }
        };

        for handler in handlers {
            handler(event);
        }

        if let BusEvent::Lifecycle(lifecycle) = event {
            // No receivers is not an error.
            let _ = self.lifecycle_tx.send(lifecycle.clone());
        }
    }

    pub fn emit_frame(&self, frame: WireMessage) {
        self.emit(&BusEvent::Frame(frame));
    }

    pub fn emit_lifecycle(&self, event: LifecycleEvent) {
        self.emit(&BusEvent::Lifecycle(event));
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }

    pub fn listener_count_for(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

/// Deregisters its listener on drop.
#[must_use = "dropping the guard removes the listener immediately"]
pub struct ListenerGuard {
    bus: Weak<EventBus>,
    id: ListenerId,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.off(self.id);
        }
    }
}
