#![forbid(unsafe_code)]

//! Multicast fan-out primitives: [`Observer`], [`Subscription`], and the
//! crate-internal subscriber registry used by both the payload broadcaster
//! and the enablement-change listener list.
//!
//! # Invariants
//!
//! 1. Subscribers are notified in registration order.
//! 2. Once dropping a [`Subscription`] returns, the observer receives
//!    nothing further — including an emit that snapshotted the subscriber
//!    list before the drop on another thread.
//! 3. `close()` delivers the completion signal to each observer exactly once,
//!    and no observer receives `on_next` after its `on_completed`, even under
//!    concurrent `emit`/`close`.
//! 4. Subscribing to a closed registry delivers `on_completed` immediately
//!    and returns an inert handle.
//! 5. The registry lock is never held while observer code runs; an observer
//!    may subscribe or unsubscribe other observers from its callback, but
//!    must not notify the registry it is being called from.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Acquire `mutex`, recovering the guard if a panicking observer poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiver of multicast values.
///
/// `on_completed` fires at most once, when the source closes permanently;
/// no `on_next` follows it. Any `FnMut(&T) + Send` closure is an observer
/// that ignores completion.
pub trait Observer<T>: Send {
    fn on_next(&mut self, value: &T);
    fn on_completed(&mut self) {}
}

impl<T, F: FnMut(&T) + Send> Observer<T> for F {
    fn on_next(&mut self, value: &T) {
        self(value);
    }
}

/// RAII guard for an attached observer. Dropping it detaches the observer.
#[must_use = "dropping a Subscription immediately detaches the observer"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to detach (e.g. subscribing after close).
    pub(crate) fn inert() -> Self {
        Self { cancel: None }
    }

    /// Whether this handle still has something to detach.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Consume the handle without detaching; the observer stays attached for
    /// the lifetime of the source.
    pub fn forget(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// One attached observer plus its delivery latch. The latch is checked and
/// flipped under the slot's own lock, which is what guarantees invariants
/// 2 and 3: both close and cancellation set it, and emit skips a latched
/// slot even when it snapshotted the slot beforehand.
struct Slot<T> {
    done: bool,
    observer: Box<dyn Observer<T>>,
}

struct Registry<T> {
    next_id: u64,
    closed: bool,
    slots: Vec<(u64, Arc<Mutex<Slot<T>>>)>,
}

/// Insertion-ordered, closable fan-out channel.
pub(crate) struct Multicast<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: 'static> Multicast<T> {
    /// Attach `observer`. If the channel is already closed, the observer
    /// receives `on_completed` immediately and the returned handle is inert.
    pub(crate) fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        let mut observer = observer;
        let (id, slot) = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                drop(registry);
                observer.on_completed();
                return Subscription::inert();
            }
            let id = registry.next_id;
            registry.next_id += 1;
            let slot = Arc::new(Mutex::new(Slot {
                done: false,
                observer: Box::new(observer),
            }));
            registry.slots.push((id, Arc::clone(&slot)));
            (id, Arc::downgrade(&slot))
        };
        let registry: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            // Latch first: an emit that already snapshotted this slot must
            // not deliver once cancellation returns.
            if let Some(slot) = slot.upgrade() {
                lock(&slot).done = true;
            }
            if let Some(registry) = registry.upgrade() {
                lock(&registry).slots.retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }
}

impl<T> Multicast<T> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                closed: false,
                slots: Vec::new(),
            })),
        }
    }

    /// Deliver `value` to every live subscriber in insertion order. No-op
    /// once closed.
    pub(crate) fn emit(&self, value: &T) {
        let slots: Vec<Arc<Mutex<Slot<T>>>> = {
            let registry = lock(&self.registry);
            if registry.closed {
                return;
            }
            registry.slots.iter().map(|(_, s)| Arc::clone(s)).collect()
        };
        for slot in slots {
            let mut slot = lock(&slot);
            if !slot.done {
                slot.observer.on_next(value);
            }
        }
    }

    /// Permanently close the channel: completion is delivered to every
    /// subscriber exactly once and the registry is cleared. Idempotent.
    pub(crate) fn close(&self) {
        let slots = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.slots)
        };
        tracing::trace!(subscribers = slots.len(), "closing multicast channel");
        for (_, slot) in slots {
            let mut slot = lock(&slot);
            if !slot.done {
                slot.done = true;
                slot.observer.on_completed();
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        lock(&self.registry).slots.len()
    }
}

impl<T> fmt::Debug for Multicast<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("Multicast")
            .field("closed", &registry.closed)
            .field("subscribers", &registry.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every delivery so tests can assert order and completion.
    struct Probe {
        events: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    }

    impl Probe {
        fn new(events: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Self {
            Self {
                events: Arc::clone(events),
                tag,
            }
        }
    }

    impl Observer<i32> for Probe {
        fn on_next(&mut self, value: &i32) {
            self.events.lock().unwrap().push(format!("{}:{value}", self.tag));
        }

        fn on_completed(&mut self) {
            self.events.lock().unwrap().push(format!("{}:done", self.tag));
        }
    }

    #[test]
    fn emit_reaches_subscribers_in_insertion_order() {
        let chan = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _a = chan.subscribe(Probe::new(&events, "a"));
        let _b = chan.subscribe(Probe::new(&events, "b"));

        chan.emit(&1);
        chan.emit(&2);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:1", "b:1", "a:2", "b:2"],
            "fan-out must preserve insertion order per emit"
        );
    }

    #[test]
    fn dropping_subscription_detaches() {
        let chan = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let a = chan.subscribe(Probe::new(&events, "a"));
        let _b = chan.subscribe(Probe::new(&events, "b"));

        drop(a);
        chan.emit(&7);

        assert_eq!(*events.lock().unwrap(), vec!["b:7"]);
        assert_eq!(chan.subscriber_count(), 1);
    }

    #[test]
    fn forget_keeps_observer_attached() {
        let chan = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        chan.subscribe(Probe::new(&events, "a")).forget();

        chan.emit(&3);
        assert_eq!(*events.lock().unwrap(), vec!["a:3"]);
    }

    #[test]
    fn close_completes_each_subscriber_once() {
        let chan = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _a = chan.subscribe(Probe::new(&events, "a"));
        let _b = chan.subscribe(Probe::new(&events, "b"));

        chan.close();
        chan.close();

        assert_eq!(*events.lock().unwrap(), vec!["a:done", "b:done"]);
        assert!(chan.is_closed());
    }

    #[test]
    fn emit_after_close_is_dropped() {
        let chan = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _a = chan.subscribe(Probe::new(&events, "a"));

        chan.close();
        chan.emit(&42);

        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:done"],
            "no payload may follow completion"
        );
    }

    #[test]
    fn subscribe_after_close_completes_immediately() {
        let chan = Multicast::new();
        chan.close();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sub = chan.subscribe(Probe::new(&events, "late"));

        assert_eq!(*events.lock().unwrap(), vec!["late:done"]);
        assert!(!sub.is_active(), "late subscription must be inert");
    }

    #[test]
    fn closure_observers_ignore_completion() {
        let chan = Multicast::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = chan.subscribe(move |v: &i32| s.lock().unwrap().push(*v));

        chan.emit(&1);
        chan.close();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn cancelled_observer_misses_an_emit_already_in_flight() {
        let chan: Multicast<i32> = Multicast::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let held: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // The first observer cancels the second mid-delivery, after emit has
        // already snapshotted both slots.
        let held_in_cb = Arc::clone(&held);
        let _first = chan.subscribe(move |_: &i32| {
            held_in_cb.lock().unwrap().take();
        });
        let second = chan.subscribe(Probe::new(&events, "b"));
        *held.lock().unwrap() = Some(second);

        chan.emit(&1);

        assert!(
            events.lock().unwrap().is_empty(),
            "no delivery may follow a completed cancellation"
        );
    }

    #[test]
    fn unsubscribe_from_inside_callback_does_not_deadlock() {
        let chan: Multicast<i32> = Multicast::new();
        let held: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let held_in_cb = Arc::clone(&held);
        let sub = chan.subscribe(move |_: &i32| {
            // Dropping another observer's handle re-enters the registry
            // lock, which must not be held during delivery.
            held_in_cb.lock().unwrap().take();
        });
        let other = chan.subscribe(|_: &i32| {});
        *held.lock().unwrap() = Some(other);

        chan.emit(&1);
        assert_eq!(chan.subscriber_count(), 1);
        drop(sub);
    }
}
