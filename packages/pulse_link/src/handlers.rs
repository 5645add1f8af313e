//! Handler registration with capability-style detachment.
//!
//! Every `on_*` registration across the crate returns a [`Subscription`]
//! whose `detach()` removes exactly the handler it was issued for. Dispatch
//! iterates a snapshot of the set, so a handler may detach itself (or drive
//! the owning channel's lifecycle) without corrupting iteration.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: HashMap<u64, Callback<T>>,
}

impl<T> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
        }
    }
}

/// An id-keyed set of callbacks with O(1) removal and snapshot dispatch.
pub struct HandlerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

// Manual Clone: T itself need not be Clone.
impl<T> Clone for HandlerSet<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for HandlerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new())),
        }
    }

    /// Register a handler. The returned [`Subscription`] is the only way to
    /// remove it; dropping the subscription leaves the handler attached.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: 'static,
    {
        let id = {
            let mut reg = self.registry.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.entries.insert(id, Arc::new(handler));
            id
        };
        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Box::new(move || {
                if let Some(reg) = registry.upgrade() {
                    reg.lock().entries.remove(&id);
                }
            }),
        }
    }

    /// Invoke every currently-registered handler with `value`.
    ///
    /// Handlers run outside the lock, over a snapshot taken at entry;
    /// registrations or detachments performed by a handler take effect on the
    /// next dispatch.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self.registry.lock().entries.values().cloned().collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Revocation handle for one registered handler.
///
/// Detachment is by capability, not by lookup: the handle closes over the id
/// it was issued for and holds only a `Weak` reference to the set, so a live
/// subscription never keeps a dropped channel alive.
pub struct Subscription {
    detach: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    /// Remove the handler. Consumes the handle; removing an already-gone
    /// handler (set dropped, handler detached through a clone race) is a
    /// silent no-op.
    pub fn detach(self) {
        (self.detach)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_all_subscribers() {
        let set: HandlerSet<u32> = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = set.subscribe(move |v| {
            h1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = set.subscribe(move |v| {
            h2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        set.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn detach_removes_only_its_handler() {
        let set: HandlerSet<()> = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let s1 = set.subscribe(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = set.subscribe(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        s1.detach();
        set.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn handler_may_detach_itself_during_dispatch() {
        let set: HandlerSet<()> = HandlerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = slot.clone();
        let h = hits.clone();
        let sub = set.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = slot_in_handler.lock().take() {
                sub.detach();
            }
        });
        *slot.lock() = Some(sub);

        set.emit(&());
        set.emit(&());
        // Fired once, then removed itself.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn detach_after_set_dropped_is_noop() {
        let set: HandlerSet<()> = HandlerSet::new();
        let sub = set.subscribe(|_| {});
        drop(set);
        sub.detach();
    }
}
