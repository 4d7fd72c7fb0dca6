//! Cache listeners and their registration
//!
//! The authoritative cache owns a [`ListenerSet`] and reports every mutation
//! through [`ListenerSet::notify`]. The set checks that each event continues
//! the history already delivered for its prefix before any listener sees it.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info_span, warn, Span};

use super::event::{ChangeEvent, Identity, ModificationKind};
use super::prefix::Prefix;
use crate::{Error, Result};

/// A component tracking the prefix → identity cache incrementally
///
/// Calls are synchronous and made from the cache's mutation path, so
/// implementations must return promptly and must neither query nor notify
/// the prefix whose event they are handling.
pub trait CacheListener: Send + Sync {
    /// Called for every insert, update or removal of a mapping. Events for
    /// the same prefix arrive in mutation order; no order is guaranteed
    /// across prefixes.
    fn on_change(&self, event: &ChangeEvent);

    /// Called when the listener's view may have drifted from the cache.
    /// The listener must reconcile against the authoritative source and drop
    /// whatever it cannot confirm.
    fn on_full_sync(&self);
}

/// Last identity delivered for one prefix. Held for the whole delivery of
/// an event so that events for the prefix go out one at a time.
type Slot = Arc<Mutex<Option<Identity>>>;

/// Registered listeners plus the last identity delivered per prefix
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn CacheListener>>>,
    delivered: DashMap<Prefix, Slot>,
    span: Span,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::with_span(info_span!("ipcache_listeners"))
    }

    /// Create an empty set that logs inside `span`
    pub fn with_span(span: Span) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            delivered: DashMap::new(),
            span,
        }
    }

    /// Register a listener. It receives events from the next notification on.
    pub fn add(&self, listener: Arc<dyn CacheListener>) {
        self.listeners.write().push(listener);
        debug!(parent: &self.span, listeners = self.len(), "Registered cache listener");
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Identity most recently delivered for `prefix`, if it is mapped.
    ///
    /// Blocks while an event for `prefix` is being delivered.
    pub fn delivered_identity(&self, prefix: &Prefix) -> Option<Identity> {
        let slot = self.delivered.get(prefix).map(|s| Arc::clone(s.value()))?;
        let live = *slot.lock();
        live
    }

    /// Deliver `event` to every listener in registration order.
    ///
    /// Rejects, without delivering, an event that does not continue its
    /// prefix's history: a fresh Upsert of a mapped prefix, or an Upsert or
    /// Delete whose previous identity differs from the last one delivered.
    /// Delivery for one prefix is serialized, so concurrent notifiers cannot
    /// reorder its events. Other prefixes are not held up.
    pub fn notify(&self, event: &ChangeEvent) -> Result<()> {
        let cidr = event.cidr();

        loop {
            let slot = Arc::clone(self.delivered.entry(cidr).or_default().value());
            let mut live = slot.lock();
            // Lost a race with the removal of an emptied slot
            if !self.is_current(&cidr, &slot) {
                continue;
            }

            let outcome = self.advance(event, &mut live);
            let unmapped = live.is_none();
            drop(live);

            if unmapped {
                // Skipped if another notifier is waiting on the slot; it
                // removes the slot itself if it leaves it empty.
                self.delivered.remove_if(&cidr, |_, s| {
                    Arc::ptr_eq(s, &slot) && s.try_lock().is_some_and(|live| live.is_none())
                });
            }
            return outcome;
        }
    }

    /// Ask every listener to reconcile against the authoritative source
    pub fn notify_full_sync(&self) {
        let listeners = self.listeners.read().clone();
        debug!(parent: &self.span, listeners = listeners.len(), "Requesting full sync");
        for listener in listeners {
            listener.on_full_sync();
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        let listeners = self.listeners.read().clone();
        debug!(parent: &self.span, event = %event, listeners = listeners.len(), "Delivering change");
        for listener in listeners {
            listener.on_change(event);
        }
    }

    fn is_current(&self, cidr: &Prefix, slot: &Slot) -> bool {
        self.delivered
            .get(cidr)
            .is_some_and(|s| Arc::ptr_eq(s.value(), slot))
    }

    fn advance(&self, event: &ChangeEvent, live: &mut Option<Identity>) -> Result<()> {
        if event.old_id() != *live {
            return Err(self.reject(event, *live));
        }
        let next = match (event.kind(), event.new_id()) {
            (ModificationKind::Upsert, Some(new_id)) => Some(new_id),
            (ModificationKind::Upsert, None) => return Err(self.reject(event, *live)),
            (ModificationKind::Delete, _) => None,
        };
        self.deliver(event);
        *live = next;
        Ok(())
    }

    fn reject(&self, event: &ChangeEvent, live: Option<Identity>) -> Error {
        let live = live.map_or_else(|| "no mapping".to_string(), |id| format!("identity {}", id));
        let err = Error::invalid_event(format!(
            "{} does not follow the delivered state of {} ({})",
            event,
            event.cidr(),
            live
        ));
        warn!(parent: &self.span, error = %err, "Rejected change event");
        err
    }
}
