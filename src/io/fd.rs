// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! FD waiter: a level-triggered readiness wait on one POSIX
//! file descriptor.

use crate::error::SysError;
use crate::io::IoQueue;
use crate::task::Task;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;

bitflags! {
    /// The subset of readiness events the multiplexer reports. Level
    /// triggered: these reflect state at poll time, not edges.
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct ReadyMask: u32 {
        const IN  = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub(crate) struct FdFlags: u8 {
        const ON_MOD_LIST = 0x01;
        const REGISTERED  = 0x02;
        const WAITING     = 0x04;
    }
}

type FdCallback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct FdState {
    pub(crate) requested: ReadyMask,
    pub(crate) ready: ReadyMask,
    pub(crate) err: SysError,
    pub(crate) flags: FdFlags,
    pub(crate) callback: Option<FdCallback>,
}

/// One outstanding readiness wait on a single OS file descriptor. No two `FdWaiter`s may refer to the same `fd`; at most one
/// wait may be outstanding on a given waiter at a time.
pub struct FdWaiter {
    pub(crate) task: Arc<Task>,
    pub(crate) fd: RawFd,
    pub(crate) owner: IoQueue,
    pub(crate) state: Mutex<FdState>,
}

impl FdWaiter {
    #[must_use]
    pub fn new(owner: IoQueue, fd: RawFd) -> Arc<FdWaiter> {
        Arc::new(FdWaiter {
            task: Task::new(owner.run_queue().clone()),
            fd,
            owner,
            state: Mutex::new(FdState {
                requested: ReadyMask::empty(),
                ready: ReadyMask::empty(),
                err: SysError::NONE,
                flags: FdFlags::empty(),
                callback: None,
            }),
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The readiness bits observed at the last wait completion.
    #[must_use]
    pub fn ready(&self) -> ReadyMask {
        self.state.lock().ready
    }

    /// The error (if any) from the last wait completion. A successful wait
    /// can still report an error *event* (`ERR`/`HUP` in `ready()`); this is
    /// distinct and reflects a failure in the wait machinery itself (e.g. a
    /// failed `epoll_ctl`).
    #[must_use]
    pub fn error(&self) -> SysError {
        self.state.lock().err
    }

    /// Begin a wait for any of the (level-triggered) events in `mask`. Only
    /// legal when no wait is currently in progress. `mask == 0` (the empty
    /// set) completes immediately.
    pub fn wait(self: &Arc<Self>, mask: ReadyMask, callback: impl FnOnce() + Send + 'static) {
        {
            let mut s = self.state.lock();
            s.callback = Some(Box::new(callback));
            s.requested = mask;
            s.ready = ReadyMask::empty();
            s.err = SysError::NONE;
            s.flags = FdFlags::WAITING;
        }

        if mask.is_empty() {
            self.submit();
            return;
        }

        self.owner.enqueue_mod(self);
    }

    /// Alter the set of events waited for, if the wait is still active.
    /// A no-op if the wait already terminated (lost the race).
    pub fn rewait(self: &Arc<Self>, mask: ReadyMask) {
        let mut s = self.state.lock();
        if s.flags.contains(FdFlags::WAITING) {
            s.requested = mask;
            drop(s);
            self.owner.enqueue_mod(self);
        }
    }

    /// Equivalent to `rewait(ReadyMask::empty())`.
    pub fn cancel(self: &Arc<Self>) {
        self.rewait(ReadyMask::empty());
    }

    pub(crate) fn submit(self: &Arc<Self>) {
        let waiter = self.clone();
        self.task.exec(move || {
            let cb = waiter.state.lock().callback.take();
            if let Some(cb) = cb {
                cb();
            }
        });
    }
}
