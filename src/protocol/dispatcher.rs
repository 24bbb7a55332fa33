use crate::error::{constants, Result, TransportError};
use crate::protocol::events::{EventKind, NetworkEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

type HandlerFn = dyn Fn(&NetworkEvent) + Send + Sync + 'static;

/// Handle returned by [`EventDispatcher::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Instance-scoped publish/subscribe hub.
///
/// Clones share the same subscriber table, so one dispatcher can be handed
/// to a client and a server and observed from a single place. Handlers run
/// synchronously on the task that raised the event and must not block.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<(SubscriptionId, Arc<HandlerFn>)>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| TransportError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Ok(id)
    }

    /// Subscribe one handler to every event category.
    pub fn subscribe_all<F>(&self, handler: F) -> Result<Vec<SubscriptionId>>
    where
        F: Fn(&NetworkEvent) + Send + Sync + 'static,
    {
        let handler: Arc<HandlerFn> = Arc::new(handler);
        [
            EventKind::ClientStatusChanged,
            EventKind::ServerStatusChanged,
            EventKind::ConnectionStatusChanged,
            EventKind::MessageReceived,
            EventKind::StreamReceived,
        ]
        .into_iter()
        .map(|kind| {
            let handler = handler.clone();
            self.subscribe(kind, move |event| handler(event))
        })
        .collect()
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| TransportError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
        }
        Ok(removed)
    }

    /// Deliver `event` to every handler subscribed to its kind.
    ///
    /// Raising never fails: a poisoned table is logged and the event dropped.
    pub fn raise(&self, event: NetworkEvent) {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let targets: Vec<Arc<HandlerFn>> = match self.handlers.read() {
            Ok(handlers) => handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(_) => {
                warn!(kind = ?event.kind(), "{}", constants::ERR_DISPATCHER_READ_LOCK);
                return;
            }
        };

        for handler in targets {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers
            .read()
            .map(|handlers| handlers.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}
