// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mailbox: a 32-flag asynchronous signal. Multiple producers
//! raise flag bits; a single consumer asynchronously waits for "any" or
//! "all" of a mask to become set.

use crate::task::{RunQueue, Task};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which fire condition an armed wait is using.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WaitMode {
    None,
    Any,
    All,
}

type MailboxCallback = Box<dyn FnOnce(u32) + Send + 'static>;

struct State {
    flags: u32,
    expected: u32,
    mode: WaitMode,
    callback: Option<MailboxCallback>,
}

/// A 32-flag mailbox. The embedded task submits exactly once per
/// armed wait; while a wait is armed the task is never on the run queue
/// except at the moment its fire condition is satisfied.
pub struct Mailbox {
    task: Arc<Task>,
    state: Mutex<State>,
}

impl Mailbox {
    #[must_use]
    pub fn new(run: RunQueue) -> Arc<Mailbox> {
        Arc::new(Mailbox {
            task: Task::new(run),
            state: Mutex::new(State { flags: 0, expected: 0, mode: WaitMode::None, callback: None }),
        })
    }

    /// Atomically sample the current flag state and clear `clear_mask` from
    /// it. Consumer-only.
    pub fn take(&self, clear_mask: u32) -> u32 {
        let mut s = self.state.lock();
        let flags = s.flags;
        s.flags &= !clear_mask;
        flags
    }

    /// Atomically set `set_mask`. May be called from any number of
    /// producer threads. If an armed wait's fire condition becomes true,
    /// the wait is consumed and the task submitted exactly once.
    pub fn raise(self: &Arc<Self>, set_mask: u32) {
        let (fire, cb) = {
            let mut s = self.state.lock();
            s.flags |= set_mask;
            let fire = match s.mode {
                WaitMode::None => false,
                WaitMode::Any => s.expected & s.flags != 0,
                WaitMode::All => (s.expected & s.flags) == s.expected,
            };
            if fire {
                s.mode = WaitMode::None;
                (true, s.callback.take())
            } else {
                (false, None)
            }
        };

        if fire {
            self.dispatch(cb);
        }
    }

    /// Arm a wait that fires when any bit in `set` becomes raised. If the
    /// condition already holds (including the empty set), fires
    /// immediately.
    pub fn wait(self: &Arc<Self>, set: u32, callback: impl FnOnce(u32) + Send + 'static) {
        self.arm(set, WaitMode::Any, callback);
    }

    /// Arm a wait that fires only once every bit in `set` is raised.
    pub fn wait_all(self: &Arc<Self>, set: u32, callback: impl FnOnce(u32) + Send + 'static) {
        self.arm(set, WaitMode::All, callback);
    }

    fn arm(self: &Arc<Self>, set: u32, mode: WaitMode, callback: impl FnOnce(u32) + Send + 'static) {
        let (fire, cb) = {
            let mut s = self.state.lock();
            s.expected = set;
            let holds = match mode {
                WaitMode::Any => s.flags & set != 0,
                WaitMode::All => (s.flags & set) == set,
                WaitMode::None => true,
            };
            if holds {
                s.mode = WaitMode::None;
                (true, Some(Box::new(callback) as MailboxCallback))
            } else {
                s.mode = mode;
                s.callback = Some(Box::new(callback));
                (false, None)
            }
        };

        if fire {
            self.dispatch(cb);
        }
    }

    fn dispatch(self: &Arc<Self>, callback: Option<MailboxCallback>) {
        tracing::trace!("mailbox wait fired");
        let mailbox = self.clone();
        self.task.exec(move || {
            let flags = mailbox.state.lock().flags;
            if let Some(cb) = callback {
                cb(flags);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FORWARD: u32 = 1 << 0;
    const QUIT: u32 = 1 << 1;

    #[test]
    fn wait_any_fires_on_first_matching_bit() {
        let rq = RunQueue::new(0).unwrap();
        let mbox = Mailbox::new(rq.clone());
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        mbox.wait(FORWARD | QUIT, move |flags| seen2.store(flags, Ordering::SeqCst));
        mbox.raise(FORWARD);
        rq.dispatch(0);
        assert_eq!(seen.load(Ordering::SeqCst), FORWARD);
    }

    #[test]
    fn wait_all_requires_every_bit() {
        let rq = RunQueue::new(0).unwrap();
        let mbox = Mailbox::new(rq.clone());
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        mbox.wait_all(FORWARD | QUIT, move |_| fired2.store(1, Ordering::SeqCst));
        mbox.raise(FORWARD);
        rq.dispatch(0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        mbox.raise(QUIT);
        rq.dispatch(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// S4: a ring of mailboxes. `raise(#0, FORWARD)` walks the ring forward;
    /// the last mailbox turns it into `QUIT`, which walks back to #0.
    #[test]
    fn mailbox_ring_propagates_forward_then_quit() {
        const N: usize = 10;
        crate::test_util::init_tracing();

        fn arm(boxes: Arc<Vec<Arc<Mailbox>>>, i: usize, terminated: Arc<AtomicU32>) {
            let is_last = i + 1 == boxes.len();
            let boxes_for_cb = boxes.clone();
            let terminated_for_cb = terminated.clone();
            boxes[i].clone().wait(FORWARD | QUIT, move |flags| {
                if flags & QUIT != 0 {
                    if i == 0 {
                        terminated_for_cb.store(1, Ordering::SeqCst);
                    } else {
                        boxes_for_cb[i - 1].raise(QUIT);
                        arm(boxes_for_cb, i, terminated_for_cb);
                    }
                } else if flags & FORWARD != 0 {
                    if is_last {
                        boxes_for_cb[i].raise(QUIT);
                    } else {
                        boxes_for_cb[i + 1].raise(FORWARD);
                    }
                    arm(boxes_for_cb, i, terminated_for_cb);
                }
            });
        }

        let rq = RunQueue::new(0).unwrap();
        let boxes = Arc::new(
            (0..N).map(|_| Mailbox::new(rq.clone())).collect::<Vec<_>>(),
        );
        let terminated = Arc::new(AtomicU32::new(0));

        for i in 0..N {
            arm(boxes.clone(), i, terminated.clone());
        }

        boxes[0].raise(FORWARD);

        let mut rounds = 0;
        while terminated.load(Ordering::SeqCst) == 0 && rounds < 10_000 {
            rq.dispatch(0);
            rounds += 1;
        }
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
    }
}
