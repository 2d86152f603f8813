// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Threading primitives: a manual-reset event used by
//! worker threads to park until the run queue has work, and by user code to
//! build timeouts out of [`Event::timed_wait`].

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of [`Event::timed_wait`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitResult {
    Signalled,
    TimedOut,
}

/// A manual-reset event: `raise` sets it and wakes every waiter, `clear`
/// resets it, `wait`/`timed_wait` block until it is set. A mutex-guarded
/// boolean plus a condition variable, built on `parking_lot`.
#[derive(Debug)]
pub struct Event {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Event { state: Mutex::new(false), condvar: Condvar::new() }
    }

    pub fn raise(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock() = false;
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.condvar.wait(&mut state);
        }
    }

    /// Block for at most `timeout_ms`, returning whether the event had been
    /// raised when the wait ended.
    pub fn timed_wait(&self, timeout_ms: u64) -> WaitResult {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut state = self.state.lock();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return WaitResult::TimedOut;
            }
            let timed_out = self.condvar.wait_for(&mut state, deadline - now).timed_out();
            if timed_out && !*state {
                return WaitResult::TimedOut;
            }
        }
        WaitResult::Signalled
    }
}
