#![forbid(unsafe_code)]

//! Injectable execution contexts for change-notification delivery.
//!
//! The command never calls listeners from whatever thread produced an
//! enablement value; it hands a task to a [`Scheduler`] instead, so listeners
//! always observe changes on one consistent context. Three contexts cover
//! the design space:
//!
//! - [`InlineScheduler`] runs the task before `schedule` returns.
//! - [`QueueScheduler`] serializes tasks on a dedicated worker thread,
//!   the shape of a UI message loop.
//! - [`TestScheduler`] defers tasks into a queue the test drives explicitly,
//!   making delivery deterministic.
//!
//! Scheduler FIFO semantics determine relative ordering across signals;
//! all three implementations here are FIFO.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, mpsc};
use std::thread;

use crate::multicast::lock;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send>;

/// Accepts units of work and runs them, immediately or deferred.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task);
}

// ---------------------------------------------------------------------------
// InlineScheduler
// ---------------------------------------------------------------------------

/// Runs every task synchronously on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Task) {
        task();
    }
}

// ---------------------------------------------------------------------------
// QueueScheduler
// ---------------------------------------------------------------------------

/// Serializes tasks on a dedicated worker thread in submission order.
///
/// Dropping the scheduler drains tasks already submitted, then joins the
/// worker. Tasks submitted after the drop began are discarded.
#[derive(Debug)]
pub struct QueueScheduler {
    tx: Option<mpsc::Sender<Task>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl QueueScheduler {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("rxcmd-queue".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
                tracing::trace!("queue scheduler worker drained");
            })
            .expect("failed to spawn queue scheduler worker");
        Self {
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Block until every task submitted before this call has run.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if let Some(tx) = &self.tx {
            let barrier: Task = Box::new(move || {
                let _ = done_tx.send(());
            });
            if tx.send(barrier).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, task: Task) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(task);
        }
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QueueScheduler {
    fn drop(&mut self) {
        // Closing the channel ends the worker's recv loop after the queue
        // drains.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

// ---------------------------------------------------------------------------
// TestScheduler
// ---------------------------------------------------------------------------

/// Deterministic deferred queue for tests.
///
/// `schedule` only enqueues; nothing runs until the test calls [`run_one`]
/// or [`run_until_idle`]. Tasks run on the driving thread in FIFO order.
///
/// [`run_one`]: TestScheduler::run_one
/// [`run_until_idle`]: TestScheduler::run_until_idle
#[derive(Default)]
pub struct TestScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl TestScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the oldest pending task, if any. Returns whether one ran.
    pub fn run_one(&self) -> bool {
        let task = lock(&self.queue).pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty, including tasks enqueued while
    /// draining. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

impl Scheduler for TestScheduler {
    fn schedule(&self, task: Task) {
        lock(&self.queue).push_back(task);
    }
}

impl fmt::Debug for TestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn inline_runs_before_schedule_returns() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        InlineScheduler.schedule(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_preserves_submission_order_on_one_thread() {
        let scheduler = QueueScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            scheduler.schedule(Box::new(move || {
                log.lock().unwrap().push((i, thread::current().id()));
            }));
        }
        scheduler.flush();

        let log = log.lock().unwrap();
        let order: Vec<usize> = log.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert!(
            log.iter().all(|(_, id)| *id == log[0].1),
            "all tasks must run on the single worker thread"
        );
        assert_ne!(log[0].1, thread::current().id());
    }

    #[test]
    fn queue_drains_on_drop() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = QueueScheduler::new();
            for _ in 0..100 {
                let r = Arc::clone(&ran);
                scheduler.schedule(Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_scheduler_defers_until_driven() {
        let scheduler = TestScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        scheduler.schedule(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(ran.load(Ordering::SeqCst), 0, "nothing runs eagerly");
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.run_until_idle(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_scheduler_runs_tasks_enqueued_while_draining() {
        let scheduler = Arc::new(TestScheduler::new());
        let inner = Arc::clone(&scheduler);
        scheduler.schedule(Box::new(move || {
            inner.schedule(Box::new(|| {}));
        }));

        assert_eq!(scheduler.run_until_idle(), 2);
    }
}
