// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wait queue (WQ): a deadline-ordered set of timers that
//! become runnable on a run queue when their deadline passes.

use crate::clock::{Clock, Ticks};
use crate::task::{RunQueue, Task};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A wait-queue element. The embedded task is first so
/// that dispatch can submit it directly; `deadline == 0` is the
/// cancellation sentinel.
pub struct Timer {
    task: Arc<Task>,
    id: u64,
    deadline: AtomicU64,
    armed: AtomicBool,
    owner: WaitQueue,
}

impl Timer {
    #[must_use]
    pub fn new(owner: WaitQueue) -> Arc<Timer> {
        Arc::new(Timer {
            task: Task::new(owner.run.clone()),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            deadline: AtomicU64::new(0),
            armed: AtomicBool::new(false),
            owner,
        })
    }

    /// True iff this timer's most recent expiry was due to cancellation
    /// rather than natural deadline passage. Not meaningful before the
    /// first expiry.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.deadline.load(Ordering::Acquire) == 0
    }

    fn key(&self) -> (Ticks, u64) {
        (self.deadline.load(Ordering::Acquire), self.id)
    }

    /// Arm this timer to fire `interval_ms` from now, running `callback`
    /// when it expires (naturally or via cancellation).
    pub fn wait(self: &Arc<Self>, interval_ms: u64, callback: impl FnOnce() + Send + 'static) {
        let deadline = self.owner.clock.now() + interval_ms;
        self.deadline.store(deadline, Ordering::Release);
        *self.owner.callbacks.lock().entry(self.id).or_default() = Some(Box::new(callback));
        self.owner.insert(self);
    }

    /// Cancel this timer. If it is still armed, it is removed and its
    /// callback fires immediately with `deadline == 0`. A no-op if the
    /// timer has already expired naturally.
    pub fn cancel(self: &Arc<Self>) {
        if self.owner.remove(self) {
            self.deadline.store(0, Ordering::Release);
            self.owner.fire(self.clone());
        }
    }

    /// Reschedule this timer `interval_ms` from now, provided it is still
    /// armed. A no-op if it has already expired.
    pub fn reschedule(self: &Arc<Self>, interval_ms: u64) {
        if self.owner.remove(self) {
            let deadline = self.owner.clock.now() + interval_ms;
            self.deadline.store(deadline, Ordering::Release);
            self.owner.insert(self);
        }
    }
}

type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// The wait queue itself. Cheap to clone.
#[derive(Clone)]
pub struct WaitQueue {
    run: RunQueue,
    clock: Clock,
    waiting: std::sync::Arc<Mutex<BTreeMap<(Ticks, u64), Arc<Timer>>>>,
    callbacks: std::sync::Arc<Mutex<std::collections::HashMap<u64, Option<TimerCallback>>>>,
    wakeup_hook: std::sync::Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>,
}

impl WaitQueue {
    #[must_use]
    pub fn new(run: RunQueue) -> Self {
        WaitQueue::with_clock(run, Clock::new())
    }

    #[must_use]
    pub fn with_clock(run: RunQueue, clock: Clock) -> Self {
        WaitQueue {
            run,
            clock,
            waiting: std::sync::Arc::new(Mutex::new(BTreeMap::new())),
            callbacks: std::sync::Arc::new(Mutex::new(std::collections::HashMap::new())),
            wakeup_hook: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_wakeup_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.wakeup_hook.lock() = Some(Box::new(hook));
    }

    fn insert(&self, timer: &Arc<Timer>) {
        let key = timer.key();
        let became_earliest = {
            let mut w = self.waiting.lock();
            w.insert(key, timer.clone());
            timer.armed.store(true, Ordering::Release);
            matches!(w.keys().next(), Some(first) if *first == key)
        };
        if became_earliest {
            if let Some(hook) = self.wakeup_hook.lock().as_ref() {
                hook();
            }
        }
    }

    fn remove(&self, timer: &Arc<Timer>) -> bool {
        if !timer.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mut w = self.waiting.lock();
        w.remove(&timer.key()).is_some()
    }

    fn fire(&self, timer: Arc<Timer>) {
        tracing::trace!(timer.id = timer.id, cancelled = timer.was_cancelled(), "timer expired");
        let cb = self.callbacks.lock().remove(&timer.id).flatten();
        let task = timer.task.clone();
        task.exec(move || {
            if let Some(cb) = cb {
                cb();
            }
        });
    }

    /// Milliseconds until the earliest expiry: `0` if already due, `-1` if
    /// the set is empty.
    #[must_use]
    pub fn next_deadline(&self) -> i32 {
        let now = self.clock.now();
        let earliest = self.waiting.lock().keys().next().map(|(d, _)| *d);
        match earliest {
            None => -1,
            Some(d) if d <= now => 0,
            Some(d) => i32::try_from(d - now).unwrap_or(i32::MAX),
        }
    }

    /// For each timer whose deadline has passed, remove it and submit its
    /// task, up to `limit` (`0` = unlimited). Returns the count dispatched.
    pub fn dispatch(&self, limit: u32) -> u32 {
        let now = self.clock.now();
        let mut count = 0u32;
        loop {
            if limit != 0 && count >= limit {
                break;
            }
            let due = {
                let mut w = self.waiting.lock();
                let key = w.keys().next().copied().filter(|(d, _)| *d <= now);
                key.and_then(|k| w.remove(&k))
            };
            let Some(timer) = due else { break };
            timer.armed.store(false, Ordering::Release);
            self.fire(timer);
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    #[test]
    fn timers_fire_in_deadline_order_and_one_cancels() {
        crate::test_util::init_tracing();
        let rq = RunQueue::new(0).unwrap();
        let wq = WaitQueue::new(rq.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut timers = Vec::new();

        for i in 1..=10u64 {
            let ms = i * 50;
            let t = Timer::new(wq.clone());
            let fired = fired.clone();
            let cancelled_check = t.clone();
            t.wait(ms, move || {
                fired.lock().push((ms, cancelled_check.was_cancelled()));
            });
            timers.push(t);
        }
        timers[5].cancel(); // the 300ms timer

        let start = Instant::now();
        // drive both the WQ and the RQ until everything's fired.
        while fired.lock().len() < 10 {
            wq.dispatch(0);
            rq.dispatch(0);
            std::thread::sleep(Duration::from_millis(5));
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");

        let results = fired.lock();
        assert_eq!(results.len(), 10);
        let cancelled_count = results.iter().filter(|(_, c)| *c).count();
        assert_eq!(cancelled_count, 1);
    }

    #[test]
    fn next_deadline_reports_empty_and_due() {
        let rq = RunQueue::new(0).unwrap();
        let wq = WaitQueue::new(rq);
        assert_eq!(wq.next_deadline(), -1);
        let t = Timer::new(wq.clone());
        let ran = Arc::new(AtomicU32::new(0));
        let ran2 = ran.clone();
        t.wait(0, move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(wq.next_deadline(), 0);
        assert_eq!(wq.dispatch(0), 1);
    }
}
