#![forbid(unsafe_code)]

//! [`Relay`]: a clonable multicast push source.
//!
//! A `Relay<bool>` is the usual enablement source for a
//! [`Command`](crate::Command): application code pushes permission changes
//! into it, the command subscribes to it. A relay nobody pushes into is a
//! stream that never emits.

use std::fmt;

use crate::multicast::{Multicast, Observer, Subscription};

/// Shared push source. Clones share the same subscriber list, so a value
/// pushed through any clone reaches every subscriber.
pub struct Relay<T> {
    fanout: Multicast<T>,
}

impl<T> Clone for Relay<T> {
    fn clone(&self) -> Self {
        Self {
            fanout: self.fanout.clone(),
        }
    }
}

impl<T: 'static> Relay<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fanout: Multicast::new(),
        }
    }

    /// Broadcast `value` to all current subscribers in insertion order.
    pub fn push(&self, value: T) {
        self.fanout.emit(&value);
    }

    /// Attach an observer; detaches when the returned handle drops.
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        self.fanout.subscribe(observer)
    }
}

impl<T: 'static> Default for Relay<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Relay<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay").field("fanout", &self.fanout).finish()
    }
}
