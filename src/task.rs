// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The run queue (RQ): a FIFO of ready callbacks drained either
//! by a caller thread (`dispatch`) or by a fixed pool of worker threads.

use crate::park::Event;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crate::error::InitError;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// A run-queue element. A task is bound to a [`RunQueue`] at construction
/// and submitted via [`Task::exec`]; once its callback begins executing the
/// task is free to be reused or dropped.
///
/// Higher-level armed objects (timers, FD waiters, mailboxes) hold their
/// own `Arc<Task>` and close over a clone of it in the callback they hand
/// to `exec`: the callback always recovers a handle to the enclosing state
/// itself, rather than to a bare `Task`.
pub struct Task {
    owner: RunQueue,
    slot: Mutex<Option<Callback>>,
    queued: AtomicBool,
}

assert_impl_all!(Task: Send, Sync);
assert_impl_all!(RunQueue: Send, Sync);

impl Task {
    #[must_use]
    pub fn new(owner: RunQueue) -> Arc<Task> {
        Arc::new(Task { owner, slot: Mutex::new(None), queued: AtomicBool::new(false) })
    }

    #[must_use]
    pub fn owner(&self) -> &RunQueue {
        &self.owner
    }

    /// Submit this task to its owning run queue. Panics if the task is
    /// already enqueued.
    pub fn exec(self: &Arc<Self>, callback: impl FnOnce() + Send + 'static) {
        self.owner.clone().exec(self, callback);
    }
}

struct Worker {
    wakeup: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    queue: Mutex<VecDeque<Arc<Task>>>,
    workers: Mutex<Vec<Worker>>,
    quit: AtomicBool,
    wakeup_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// The run queue itself. Cheap to clone — clones share the same underlying
/// FIFO and worker pool.
#[derive(Clone)]
pub struct RunQueue(Arc<Inner>);

enum Popped {
    Quit,
    Empty,
    Ran,
}

impl RunQueue {
    /// Allocate `workers` background worker threads (`0` means
    /// foreground-only: callers must periodically call [`RunQueue::dispatch`]).
    /// If the k-th worker fails to start, previously created workers are
    /// quit and joined before returning the error.
    pub fn new(workers: u32) -> Result<Self, InitError> {
        let rq = RunQueue(Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            wakeup_hook: Mutex::new(None),
        }));

        let mut started = Vec::with_capacity(workers as usize);
        for index in 0..workers {
            let wakeup = Arc::new(Event::new());
            let worker_rq = rq.clone();
            let worker_wakeup = wakeup.clone();
            match std::thread::Builder::new().name(format!("ioq-worker-{index}")).spawn(
                move || worker_loop(worker_rq, worker_wakeup),
            ) {
                Ok(handle) => started.push(Worker { wakeup, handle: Some(handle) }),
                Err(source) => {
                    rq.0.quit.store(true, Ordering::SeqCst);
                    for mut w in started {
                        w.wakeup.raise();
                        if let Some(h) = w.handle.take() {
                            let _ = h.join();
                        }
                    }
                    return Err(InitError::Worker { index, source });
                }
            }
        }

        *rq.0.workers.lock() = started;
        Ok(rq)
    }

    /// Install a hook called whenever the queue transitions from empty to
    /// non-empty. Must be configured before submitting any jobs.
    pub fn set_wakeup_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.0.wakeup_hook.lock() = Some(Box::new(hook));
    }

    /// Request quit and join every worker thread.
    pub fn shutdown(&self) {
        if self.0.quit.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.0.workers.lock();
        for w in workers.iter() {
            w.wakeup.raise();
        }
        for w in workers.iter_mut() {
            if let Some(h) = w.handle.take() {
                let _ = h.join();
            }
        }
    }

    fn exec(&self, task: &Arc<Task>, callback: impl FnOnce() + Send + 'static) {
        assert!(
            !task.queued.swap(true, Ordering::AcqRel),
            "ioq: task submitted while already enqueued"
        );
        *task.slot.lock() = Some(Box::new(callback));

        let was_empty = {
            let mut q = self.0.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task.clone());
            was_empty
        };

        if was_empty {
            tracing::trace!(target: "ioq::task", "run queue woke from empty");
            for w in self.0.workers.lock().iter() {
                w.wakeup.raise();
            }
            if let Some(hook) = self.0.wakeup_hook.lock().as_ref() {
                hook();
            }
        }
    }

    fn pop_and_run(&self) -> Popped {
        if self.0.quit.load(Ordering::SeqCst) {
            return Popped::Quit;
        }
        let task = {
            let mut q = self.0.queue.lock();
            q.pop_front()
        };
        let Some(task) = task else {
            return Popped::Empty;
        };

        task.queued.store(false, Ordering::Release);
        let cb = task.slot.lock().take();
        drop(task);
        if let Some(cb) = cb {
            cb();
        }
        Popped::Ran
    }

    /// Foreground drain: repeatedly pop one task under the lock and run its
    /// callback outside the lock, up to `limit` (`0` means unlimited).
    /// Returns the number of tasks dispatched.
    pub fn dispatch(&self, limit: u32) -> u32 {
        let mut count = 0u32;
        loop {
            if limit != 0 && count >= limit {
                break;
            }
            match self.pop_and_run() {
                Popped::Ran => count += 1,
                Popped::Empty | Popped::Quit => break,
            }
        }
        count
    }
}

fn worker_loop(rq: RunQueue, wakeup: Arc<Event>) {
    loop {
        wakeup.wait();
        wakeup.clear();
        loop {
            match rq.pop_and_run() {
                Popped::Ran => {}
                Popped::Empty => break,
                Popped::Quit => return,
            }
        }
    }
}
