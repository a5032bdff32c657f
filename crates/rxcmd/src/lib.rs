#![forbid(unsafe_code)]

//! Reactive command primitive for binding UI affordances to asynchronous
//! enablement logic.
//!
//! A [`Command<T>`] owns a boolean "may this action run" flag driven by an
//! external stream of values (a [`Relay<bool>`]), notifies listeners when the
//! flag changes — always via an injectable [`Scheduler`], so listeners see
//! one consistent execution context — and broadcasts invocation payloads to
//! any number of subscribers. An affordance such as a button talks to the
//! type-erased [`UiCommand`] protocol; application code holds the typed
//! command and its [`Subscription`] handles.
//!
//! # Usage
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use rxcmd::{Command, Relay, TestScheduler};
//!
//! let permits = Relay::new();
//! let scheduler = Arc::new(TestScheduler::new());
//! let save: Command<String> = Command::new(&permits, scheduler.clone(), false);
//!
//! let saved = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&saved);
//! let _sub = save.subscribe(move |path: &String| sink.lock().unwrap().push(path.clone()));
//!
//! // Disabled: the gated surface drops the call.
//! assert!(!save.try_execute("draft.txt".into()));
//!
//! permits.push(true);
//! scheduler.run_until_idle(); // deliver the enablement change
//! assert!(save.is_enabled());
//! assert!(save.try_execute("draft.txt".into()));
//! assert_eq!(saved.lock().unwrap().len(), 1);
//! ```
//!
//! # Architecture
//!
//! - [`multicast`]: observer trait, RAII [`Subscription`], and the
//!   insertion-ordered fan-out registry behind every broadcast.
//! - [`relay`]: clonable push source; `Relay<bool>` is the enablement stream.
//! - [`scheduler`]: the execution-context abstraction and its inline,
//!   worker-queue, and test implementations.
//! - [`command`]: the state machine tying the pieces together.

pub mod command;
pub mod multicast;
pub mod relay;
pub mod scheduler;

pub use command::{Command, CommandError, Payload, UiCommand, UnitCommand};
pub use multicast::{Observer, Subscription};
pub use relay::Relay;
pub use scheduler::{InlineScheduler, QueueScheduler, Scheduler, Task, TestScheduler};
