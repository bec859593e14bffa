//! Per-type subscriber fan-out.
//!
//! Every message type keeps its handlers in registration order. Dispatch
//! snapshots the matching handlers under a read lock and then runs them
//! with no lock held, so a handler may subscribe, unsubscribe, send or even
//! dispose the client without deadlocking.
//!
//! Envelopes whose type has no handler fall through to catch-all handlers,
//! and are dropped when there are none.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::codec::MessageEnvelope;

/// Callback invoked for each delivered envelope.
pub type Handler = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Opaque subscription token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    Type(String),
    CatchAll,
}

struct Entry {
    id: HandlerId,
    handler: Handler,
}

#[derive(Default)]
struct Entries {
    by_type: HashMap<String, Vec<Entry>>,
    catch_all: Vec<Entry>,
    /// Reverse index for O(1) unsubscribe lookups
    topics: HashMap<HandlerId, Topic>,
}

/// Maps message types to ordered handler lists.
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: RwLock<Entries>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Register a handler for one message type.
    pub fn subscribe<F>(&self, message_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.insert(Topic::Type(message_type.into()), Arc::new(handler))
    }

    /// Register a handler for envelopes no type-specific handler claims.
    pub fn subscribe_all<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&MessageEnvelope) + Send + Sync + 'static,
    {
        self.insert(Topic::CatchAll, Arc::new(handler))
    }

    fn insert(&self, topic: Topic, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.write();
        let entry = Entry { id, handler };
        match &topic {
            Topic::Type(name) => entries.by_type.entry(name.clone()).or_default().push(entry),
            Topic::CatchAll => entries.catch_all.push(entry),
        }
        entries.topics.insert(id, topic);
        id
    }

    /// Remove a handler. Unknown or already-removed ids are a no-op.
    ///
    /// Returns whether a handler was actually removed.
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut entries = self.write();
        let Some(topic) = entries.topics.remove(&id) else {
            return false;
        };
        match topic {
            Topic::Type(name) => {
                if let Some(list) = entries.by_type.get_mut(&name) {
                    list.retain(|e| e.id != id);
                    if list.is_empty() {
                        entries.by_type.remove(&name);
                    }
                }
            }
            Topic::CatchAll => entries.catch_all.retain(|e| e.id != id),
        }
        true
    }

    /// Deliver an envelope to its handlers in registration order.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    /// Returns the number of handlers that completed normally.
    pub fn dispatch(&self, envelope: &MessageEnvelope) -> usize {
        let targets: Vec<(HandlerId, Handler)> = {
            let entries = self.read();
            let list = match entries.by_type.get(&envelope.message_type) {
                Some(list) if !list.is_empty() => list,
                _ => &entries.catch_all,
            };
            list.iter().map(|e| (e.id, Arc::clone(&e.handler))).collect()
        };

        if targets.is_empty() {
            log::debug!(
                "No subscriber for message type '{}', dropping",
                envelope.message_type
            );
            return 0;
        }

        let mut delivered = 0;
        for (id, handler) in targets {
            // An earlier handler may have unsubscribed this one.
            if !self.contains(id) {
                continue;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(()) => delivered += 1,
                Err(payload) => log::error!(
                    "Subscriber {id} for '{}' panicked: {}",
                    envelope.message_type,
                    panic_message(payload.as_ref())
                ),
            }
        }
        delivered
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        self.read().topics.contains_key(&id)
    }

    /// Handlers registered for exactly this type (catch-all excluded).
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.read().by_type.get(message_type).map_or(0, Vec::len)
    }

    /// Total registered handlers, catch-all included.
    pub fn len(&self) -> usize {
        self.read().topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler.
    pub fn clear(&self) {
        let mut entries = self.write();
        entries.by_type.clear();
        entries.catch_all.clear();
        entries.topics.clear();
    }

    // Handlers never run under these locks, so a poisoned lock still holds
    // consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
