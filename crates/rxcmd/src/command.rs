#![forbid(unsafe_code)]

//! The reactive command core: enablement state machine, gated and ungated
//! invocation, scheduler-mediated change notification, and the disposal
//! protocol.
//!
//! A [`Command<T>`] sits between an enablement stream and any number of
//! payload subscribers. The stream drives a single boolean flag; invocations
//! broadcast payloads; disposal tears both down exactly once.
//!
//! # Invariants
//!
//! 1. `disposed` transitions false→true at most once; disposal effects past
//!    the first call are no-ops.
//! 2. After disposal, [`is_enabled`](Command::is_enabled) reads `false`, and
//!    any change notification fired during or after disposal carries `false`.
//! 3. The flag changes only on a *distinct* value from the enablement stream
//!    (consecutive duplicates are suppressed before scheduling) or on
//!    disposal.
//! 4. Once disposal closes the payload broadcaster, no payload is delivered
//!    to anyone; late subscribers receive only the completion signal.
//! 5. Change listeners fire via the scheduler, never synchronously with the
//!    thread that produced the enablement value.
//!
//! # Gating asymmetry
//!
//! The command-protocol surfaces ([`try_execute`](Command::try_execute) and
//! [`UiCommand::execute`]) silently drop the payload while disabled. The
//! direct surface ([`emit`](Command::emit)) always broadcasts; it is the raw
//! escape hatch for callers that hold the typed command and take
//! responsibility for the gate themselves. The asymmetry is contractual.
//!
//! # Concurrency
//!
//! All state is explicitly synchronized: the two flags are atomics, the
//! subscriber registries are mutex-protected, and each observer carries a
//! completion latch so no payload follows its completion signal even when
//! `emit` races `dispose` across threads. Scheduled flag flips and the
//! disposal transition share one guard, so a flip can never interleave with
//! `dispose` between its disposed check and its store. One precondition
//! remains: an observer or change listener must not call back into the
//! command it observes from inside its own callback (a delivery lock, and
//! for listeners the transition guard, is held at that point).

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace};

use crate::multicast::{Multicast, Observer, Subscription, lock};
use crate::relay::Relay;
use crate::scheduler::Scheduler;

/// Type-erased invocation payload for the command-protocol surface.
pub type Payload = Box<dyn Any + Send>;

/// Errors surfaced by the type-erased invocation path. The typed surfaces
/// are infallible by construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The erased payload could not be converted to the command's parameter
    /// type. Raised only when the command was enabled; a disabled or
    /// disposed command never inspects the payload.
    #[error("payload type mismatch: expected `{expected}`")]
    PayloadType { expected: &'static str },
}

/// The command protocol an affordance (button, menu item, key binding)
/// programs against: a permission query plus a gated, type-erased
/// invocation.
pub trait UiCommand: Send + Sync {
    /// Current permission state. No side effects.
    fn can_execute(&self) -> bool;

    /// Gated invocation: broadcasts the payload to subscribers only if the
    /// command is enabled at the moment of the call, otherwise silently
    /// drops it and returns `Ok(())`.
    fn execute(&self, parameter: Payload) -> Result<(), CommandError>;
}

/// Payload-independent command state. Scheduled tasks capture this block,
/// never the typed broadcaster.
struct Control {
    enabled: AtomicBool,
    disposed: AtomicBool,
    /// Serializes the disposed/enabled transition pair: a scheduled flip
    /// holds this across its disposed check, flag store, and notification,
    /// so `dispose` can never land between the check and the store.
    transition: Mutex<()>,
    /// Enablement-change listener registry; fired only from scheduled tasks.
    changes: Multicast<bool>,
    scheduler: Arc<dyn Scheduler>,
}

impl Control {
    fn new(initially_enabled: bool, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(initially_enabled),
            disposed: AtomicBool::new(false),
            transition: Mutex::new(()),
            changes: Multicast::new(),
            scheduler,
        })
    }
}

/// A reactive command: a boolean enablement flag driven by an external
/// stream, plus a multicast channel of invocation payloads.
///
/// States: `Active-Enabled` ⇄ `Active-Disabled` on distinct stream values,
/// either → `Disposed` on [`dispose`](Command::dispose) (terminal).
///
/// Dropping the command disposes it.
pub struct Command<T> {
    control: Arc<Control>,
    /// Payload broadcaster; closed permanently on disposal.
    trigger: Multicast<T>,
    /// Owned exclusively; released on disposal only.
    enablement: Mutex<Option<Subscription>>,
}

/// `Command<()>`: invocations carry no payload beyond the fact that they
/// happened.
pub type UnitCommand = Command<()>;

impl<T> Command<T> {
    /// Create a command driven by `source`.
    ///
    /// The subscription filters the stream to values that differ from the
    /// immediately preceding *stream* value (the initial flag does not seed
    /// the filter: a first emission equal to `initially_enabled` still
    /// notifies). Each passing value is handed to `scheduler`, where it
    /// overwrites the flag and fires the change listeners.
    pub fn new(
        source: &Relay<bool>,
        scheduler: Arc<dyn Scheduler>,
        initially_enabled: bool,
    ) -> Self {
        let control = Control::new(initially_enabled, scheduler);

        let subscription = {
            let control = Arc::clone(&control);
            let mut last_seen: Option<bool> = None;
            source.subscribe(move |value: &bool| {
                let value = *value;
                if last_seen == Some(value) {
                    trace!(value, "suppressed duplicate enablement value");
                    return;
                }
                last_seen = Some(value);
                let target = Arc::clone(&control);
                control.scheduler.schedule(Box::new(move || {
                    // A flip scheduled before disposal must not land after
                    // it; the guard keeps `dispose` out between the check
                    // and the store.
                    let _guard = lock(&target.transition);
                    if target.disposed.load(Ordering::Acquire) {
                        return;
                    }
                    target.enabled.store(value, Ordering::Release);
                    target.changes.emit(&value);
                }));
            })
        };

        Self {
            control,
            trigger: Multicast::new(),
            enablement: Mutex::new(Some(subscription)),
        }
    }

    /// Create a command whose enablement never changes from `true` until
    /// disposal (a never-emitting source).
    pub fn always_enabled(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            control: Control::new(true, scheduler),
            trigger: Multicast::new(),
            enablement: Mutex::new(None),
        }
    }

    /// Current enablement. No side effects.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.control.enabled.load(Ordering::Acquire)
    }

    /// Whether [`dispose`](Command::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.control.disposed.load(Ordering::Acquire)
    }

    /// Gated invocation: broadcast `parameter` only if the command is
    /// enabled at the moment of the call. Returns whether the gate passed.
    pub fn try_execute(&self, parameter: T) -> bool {
        if !self.is_enabled() {
            trace!("gated invocation dropped while disabled");
            return false;
        }
        self.trigger.emit(&parameter);
        true
    }

    /// Ungated invocation: broadcast `parameter` to subscribers regardless
    /// of enablement. After disposal the broadcaster is closed, so this is
    /// a silent no-op.
    pub fn emit(&self, parameter: T) {
        self.trigger.emit(&parameter);
    }

    /// Attach an enablement-change listener. Listeners fire via the
    /// scheduler with the new flag value; they never run synchronously with
    /// the thread that produced it.
    pub fn on_enabled_changed(&self, listener: impl Observer<bool> + 'static) -> Subscription {
        self.control.changes.subscribe(listener)
    }

    /// Tear the command down. Idempotent. In order: mark disposed, close the
    /// payload broadcaster, release the enablement subscription, and — only
    /// if the flag was `true` — clear it synchronously and schedule the
    /// final `false` notification to listeners.
    pub fn dispose(&self) {
        {
            // Taken under the transition guard: once this swap is visible,
            // no scheduled flip touches the flag again.
            let _guard = lock(&self.control.transition);
            if self.control.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        debug!("disposing command");
        self.trigger.close();
        let released = lock(&self.enablement).take();
        drop(released);

        if self.control.enabled.swap(false, Ordering::AcqRel) {
            // The flag is already false for synchronous readers; listeners
            // still observe the transition on their own context.
            let control = Arc::clone(&self.control);
            self.control.scheduler.schedule(Box::new(move || {
                control.enabled.store(false, Ordering::Release);
                control.changes.emit(&false);
            }));
        }
    }
}

impl<T: 'static> Command<T> {
    /// Attach a payload observer. Delivery order for a single invocation is
    /// attachment order. If the command is already disposed, the observer
    /// receives the completion signal immediately.
    ///
    /// The observer must not invoke this command from inside its callback.
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        self.trigger.subscribe(observer)
    }
}

impl Command<()> {
    /// Zero-payload convenience: broadcast the unit sentinel, ungated.
    pub fn fire(&self) {
        self.emit(());
    }
}

impl<T: Any + Send> UiCommand for Command<T> {
    fn can_execute(&self) -> bool {
        self.is_enabled()
    }

    fn execute(&self, parameter: Payload) -> Result<(), CommandError> {
        // Gate before the downcast: a disabled or disposed command never
        // inspects the payload.
        if !self.is_enabled() {
            trace!("gated invocation dropped while disabled");
            return Ok(());
        }
        match parameter.downcast::<T>() {
            Ok(value) => {
                self.trigger.emit(&*value);
                Ok(())
            }
            Err(_) => Err(CommandError::PayloadType {
                expected: std::any::type_name::<T>(),
            }),
        }
    }
}

impl<T> Drop for Command<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("enabled", &self.is_enabled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
