// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O queue (IOQ): owns a run queue and a wait queue,
//! drives an `epoll`-based readiness multiplexer, and exposes the single
//! loop-iteration primitive that services all three event classes.

mod fd;

pub use fd::{FdWaiter, ReadyMask};
use fd::FdFlags;

use crate::clock::Clock;
use crate::error::{InitError, SysError};
use crate::task::RunQueue;
use crate::timer::WaitQueue;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

const MAX_EVENTS: usize = 128;

struct Inner {
    run: RunQueue,
    wait: WaitQueue,
    epoll_fd: RawFd,
    wake_r: RawFd,
    wake_w: RawFd,
    notified: AtomicBool,
    mod_list: Mutex<VecDeque<Arc<FdWaiter>>>,
    registered: Mutex<HashMap<RawFd, Arc<FdWaiter>>>,
}

/// The I/O queue itself. Cheap to clone; clones share the same epoll set,
/// run queue and wait queue.
#[derive(Clone)]
pub struct IoQueue(Arc<Inner>);

impl IoQueue {
    /// Construct an I/O queue with `background_workers` run-queue workers
    /// (`0` means the run queue is drained in-line by [`IoQueue::iterate`]).
    pub fn new(background_workers: u32) -> Result<Self, InitError> {
        let run = RunQueue::new(background_workers)?;
        let wait = WaitQueue::with_clock(run.clone(), Clock::new());

        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(InitError::Multiplexer(std::io::Error::last_os_error()));
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(InitError::WakeupPipe(err));
        }
        let (wake_r, wake_w) = (pipe_fds[0], pipe_fds[1]);
        set_nonblocking(wake_r);

        let mut add_evt = libc::epoll_event { events: libc::EPOLLIN as u32, u64: u64::MAX };
        if unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_r, &mut add_evt)
        } < 0
        {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(epoll_fd);
                libc::close(wake_r);
                libc::close(wake_w);
            }
            return Err(InitError::Multiplexer(err));
        }

        let inner = Arc::new(Inner {
            run,
            wait,
            epoll_fd,
            wake_r,
            wake_w,
            notified: AtomicBool::new(false),
            mod_list: Mutex::new(VecDeque::new()),
            registered: Mutex::new(HashMap::new()),
        });

        let queue = IoQueue(inner);
        let weak_for_run: Weak<Inner> = Arc::downgrade(&queue.0);
        queue.0.run.set_wakeup_hook(move || {
            if let Some(inner) = weak_for_run.upgrade() {
                IoQueue(inner).notify();
            }
        });
        let weak_for_wait: Weak<Inner> = Arc::downgrade(&queue.0);
        queue.0.wait.set_wakeup_hook(move || {
            if let Some(inner) = weak_for_wait.upgrade() {
                IoQueue(inner).notify();
            }
        });

        Ok(queue)
    }

    #[must_use]
    pub fn run_queue(&self) -> &RunQueue {
        &self.0.run
    }

    #[must_use]
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.0.wait
    }

    /// Cross-thread wakeup, debounced: only the first `false -> true`
    /// transition of the `notified` flag actually writes to the wakeup
    /// pipe.
    pub fn notify(&self) {
        if !self.0.notified.swap(true, Ordering::AcqRel) {
            let byte = [0u8; 1];
            unsafe {
                libc::write(self.0.wake_w, byte.as_ptr().cast(), 1);
            }
        }
    }

    pub(crate) fn enqueue_mod(&self, waiter: &Arc<FdWaiter>) {
        let need_wakeup = enqueue_mod_nolock(&self.0.mod_list, waiter);
        if need_wakeup {
            self.notify();
        }
    }

    fn ack_wakeup(&self) {
        let mut discard = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(self.0.wake_r, discard.as_mut_ptr().cast(), discard.len())
            };
            if n <= 0 {
                break;
            }
        }
        self.0.notified.store(false, Ordering::Release);
    }

    /// One pass of the event loop: block on the multiplexer
    /// (bounded by the next timer deadline), drain FD readiness and the
    /// modification FIFO, then dispatch expired timers and ready tasks.
    pub fn iterate(&self) -> Result<(), SysError> {
        let timeout = self.0.wait.next_deadline();
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.0.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(SysError::from(err));
        }

        self.ack_wakeup();

        for evt in &events[..n as usize] {
            if evt.u64 == u64::MAX {
                continue; // the wakeup pipe itself
            }
            let fd = evt.u64 as RawFd;
            let waiter = self.0.registered.lock().remove(&fd);
            let Some(waiter) = waiter else { continue };

            unsafe {
                libc::epoll_ctl(self.0.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }

            {
                let mut s = waiter.state.lock();
                s.ready = ReadyMask::from_bits_truncate(evt.events);
                s.flags.remove(FdFlags::REGISTERED | FdFlags::WAITING);
            }
            enqueue_mod_nolock(&self.0.mod_list, &waiter);
        }

        tracing::trace!(events = n, "iterate: epoll returned");
        self.drain_mod_list();
        self.0.wait.dispatch(0);
        self.0.run.dispatch(0);

        Ok(())
    }

    fn drain_mod_list(&self) {
        loop {
            let waiter = self.0.mod_list.lock().pop_front();
            let Some(waiter) = waiter else { break };

            let (waiting, requested, registered) = {
                let mut s = waiter.state.lock();
                s.flags.remove(FdFlags::ON_MOD_LIST);
                (
                    s.flags.contains(FdFlags::WAITING),
                    s.requested,
                    s.flags.contains(FdFlags::REGISTERED),
                )
            };

            if !waiting {
                waiter.submit();
            } else if requested.is_empty() {
                if registered {
                    unsafe {
                        libc::epoll_ctl(
                            self.0.epoll_fd,
                            libc::EPOLL_CTL_DEL,
                            waiter.fd,
                            std::ptr::null_mut(),
                        );
                    }
                    self.0.registered.lock().remove(&waiter.fd);
                }
                {
                    let mut s = waiter.state.lock();
                    s.ready = ReadyMask::empty();
                    s.flags.remove(FdFlags::REGISTERED | FdFlags::WAITING);
                }
                enqueue_mod_nolock(&self.0.mod_list, &waiter);
            } else {
                let op = if registered { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
                let mut evt = libc::epoll_event { events: requested.bits(), u64: waiter.fd as u64 };
                let rc = unsafe { libc::epoll_ctl(self.0.epoll_fd, op, waiter.fd, &mut evt) };
                if rc < 0 {
                    let err = SysError::last_os_error();
                    let mut s = waiter.state.lock();
                    s.err = err;
                    s.requested = ReadyMask::empty();
                    drop(s);
                    enqueue_mod_nolock(&self.0.mod_list, &waiter);
                } else {
                    waiter.state.lock().flags.insert(FdFlags::REGISTERED);
                    self.0.registered.lock().insert(waiter.fd, waiter.clone());
                }
            }
        }
    }

    /// Tear down in order: run queue first (join workers), then wait queue,
    /// then the multiplexer and wakeup pipe.
    pub fn shutdown(&self) {
        self.0.run.shutdown();
        unsafe {
            libc::close(self.0.epoll_fd);
            libc::close(self.0.wake_r);
            libc::close(self.0.wake_w);
        }
    }
}

fn enqueue_mod_nolock(mod_list: &Mutex<VecDeque<Arc<FdWaiter>>>, waiter: &Arc<FdWaiter>) -> bool {
    let mut list = mod_list.lock();
    let mut s = waiter.state.lock();
    if s.flags.contains(FdFlags::ON_MOD_LIST) {
        return false;
    }
    let need_wakeup = list.is_empty();
    s.flags.insert(FdFlags::ON_MOD_LIST);
    drop(s);
    list.push_back(waiter.clone());
    need_wakeup
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::FromRawFd;

    #[test]
    fn fd_wait_fires_on_pipe_writability_and_then_readability() {
        let ioq = IoQueue::new(0).unwrap();
        let mut pipe_fds = [0i32; 2];
        unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        let (r, w) = (pipe_fds[0], pipe_fds[1]);
        set_nonblocking(r);
        set_nonblocking(w);

        let waiter = FdWaiter::new(ioq.clone(), w);
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        waiter.wait(ReadyMask::OUT, move || {
            fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        for _ in 0..50 {
            if fired.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            ioq.iterate().unwrap();
        }
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));

        unsafe {
            let mut f = std::fs::File::from_raw_fd(w);
            f.write_all(b"x").unwrap();
            std::mem::forget(f);
        }

        let read_waiter = FdWaiter::new(ioq.clone(), r);
        let got = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let got2 = got.clone();
        read_waiter.wait(ReadyMask::IN, move || {
            got2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        for _ in 0..50 {
            if got.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            ioq.iterate().unwrap();
        }
        assert!(got.load(std::sync::atomic::Ordering::SeqCst));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
        ioq.shutdown();
    }

    #[test]
    fn notify_debounces_concurrent_callers() {
        let ioq = IoQueue::new(0).unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ioq = ioq.clone();
            handles.push(std::thread::spawn(move || ioq.notify()));
        }
        for h in handles {
            h.join().unwrap();
        }
        // a single iterate should see at most one pending wakeup byte and
        // return promptly rather than block.
        ioq.iterate().unwrap();
        ioq.shutdown();
    }
}
