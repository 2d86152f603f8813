// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous file: independent read and write
//! callbacks over an OS file descriptor, built on the I/O queue.

use crate::error::SysError;
use crate::io::{FdWaiter, IoQueue, ReadyMask};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    struct Want: u8 {
        const READ   = 0x01;
        const WRITE  = 0x02;
        const CANCEL = 0x04;
    }
}

type FileCallback = Box<dyn FnOnce(&Arc<AsyncFile>) + Send + 'static>;

struct Op {
    buffer: *mut u8,
    len: usize,
    size: usize,
    error: SysError,
    callback: Option<FileCallback>,
}

// SAFETY: the raw buffer pointer is only dereferenced on the thread driving
// the owning `IoQueue`'s dispatch while the corresponding `want` bit is
// held.
unsafe impl Send for Op {}

/// An asynchronous file handle manager. Reads and writes may be issued
/// independently and concurrently; ownership of the underlying fd is not
/// taken, the caller remains responsible for closing it.
pub struct AsyncFile {
    fd: Arc<FdWaiter>,
    read: Mutex<Op>,
    write: Mutex<Op>,
    want: Mutex<Want>,
}

impl AsyncFile {
    #[must_use]
    pub fn new(ioq: IoQueue, fd: RawFd) -> Arc<AsyncFile> {
        Arc::new(AsyncFile {
            fd: FdWaiter::new(ioq, fd),
            read: Mutex::new(Op {
                buffer: std::ptr::null_mut(),
                len: 0,
                size: 0,
                error: SysError::NONE,
                callback: None,
            }),
            write: Mutex::new(Op {
                buffer: std::ptr::null_mut(),
                len: 0,
                size: 0,
                error: SysError::NONE,
                callback: None,
            }),
            want: Mutex::new(Want::empty()),
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.fd()
    }

    #[must_use]
    pub fn read_result(&self) -> (usize, SysError) {
        let r = self.read.lock();
        (r.size, r.error)
    }

    #[must_use]
    pub fn write_result(&self) -> (usize, SysError) {
        let w = self.write.lock();
        (w.size, w.error)
    }

    pub fn read(self: &Arc<Self>, buf: &mut [u8], callback: impl FnOnce(&Arc<AsyncFile>) + Send + 'static) {
        {
            let mut r = self.read.lock();
            r.buffer = buf.as_mut_ptr();
            r.len = buf.len();
            r.callback = Some(Box::new(callback));
        }
        self.begin_wait(Want::READ);
    }

    pub fn write(self: &Arc<Self>, buf: &[u8], callback: impl FnOnce(&Arc<AsyncFile>) + Send + 'static) {
        {
            let mut w = self.write.lock();
            w.buffer = buf.as_ptr().cast_mut();
            w.len = buf.len();
            w.callback = Some(Box::new(callback));
        }
        self.begin_wait(Want::WRITE);
    }

    /// Cancel all outstanding operations. Both sides subsequently complete
    /// with whatever error was recorded.
    pub fn cancel(self: &Arc<Self>) {
        let had_wait = {
            let mut want = self.want.lock();
            let had = !want.is_empty();
            *want |= Want::CANCEL;
            had
        };
        if had_wait {
            self.fd.cancel();
        }
    }

    fn begin_wait(self: &Arc<Self>, bit: Want) {
        let mut want = self.want.lock();
        let had_wait = !want.is_empty();
        *want |= bit;
        let file = self.clone();
        if had_wait {
            self.fd.rewait(ReadyMask::IN | ReadyMask::OUT);
        } else {
            self.fd.wait(mask_for(bit), move || file.on_ready());
        }
    }

    fn on_ready(self: Arc<Self>) {
        let (perform, error) = self.end_wait();
        tracing::trace!(fd = self.fd(), ?perform, "async file wait completed");

        if perform.contains(Want::READ) {
            let (size, error) = if perform.contains(Want::CANCEL) {
                (0, error)
            } else {
                let mut r = self.read.lock();
                do_read(self.fd.fd(), r.buffer, r.len)
            };
            {
                let mut r = self.read.lock();
                r.size = size;
                r.error = error;
            }
            if let Some(cb) = self.read.lock().callback.take() {
                cb(&self);
            }
        }

        if perform.contains(Want::WRITE) {
            let (size, error) = if perform.contains(Want::CANCEL) {
                (0, error)
            } else {
                let w = self.write.lock();
                do_write(self.fd.fd(), w.buffer, w.len)
            };
            {
                let mut w = self.write.lock();
                w.size = size;
                w.error = error;
            }
            if let Some(cb) = self.write.lock().callback.take() {
                cb(&self);
            }
        }
    }

    fn end_wait(self: &Arc<Self>) -> (Want, SysError) {
        let mut wait_mask = ReadyMask::empty();
        let mut perform = Want::empty();
        let mut error = SysError::NONE;

        let mut want = self.want.lock();
        let err = self.fd.error();
        if !err.is_none() {
            perform = *want | Want::CANCEL;
            *want = Want::empty();
            error = err;
        } else if want.contains(Want::CANCEL) {
            perform = *want;
            *want = Want::empty();
        } else {
            let ready = self.fd.ready();
            if want.contains(Want::WRITE) {
                if ready.intersects(ReadyMask::OUT | ReadyMask::ERR | ReadyMask::HUP) {
                    perform |= Want::WRITE;
                    want.remove(Want::WRITE);
                } else {
                    wait_mask |= ReadyMask::OUT;
                }
            }
            if want.contains(Want::READ) {
                if ready.intersects(ReadyMask::IN | ReadyMask::ERR | ReadyMask::HUP) {
                    perform |= Want::READ;
                    want.remove(Want::READ);
                } else {
                    wait_mask |= ReadyMask::IN;
                }
            }
            if !wait_mask.is_empty() {
                let fd_waiter = self.fd.clone();
                let file = Arc::clone(self);
                drop(want);
                fd_waiter.wait(wait_mask, move || file.on_ready());
                return (perform, error);
            }
        }
        (perform, error)
    }
}

fn mask_for(bit: Want) -> ReadyMask {
    match bit {
        Want::READ => ReadyMask::IN,
        Want::WRITE => ReadyMask::OUT,
        _ => ReadyMask::IN | ReadyMask::OUT,
    }
}

fn do_read(fd: RawFd, buffer: *mut u8, len: usize) -> (usize, SysError) {
    let r = unsafe { libc::read(fd, buffer.cast(), len) };
    if r < 0 {
        (0, SysError::last_os_error())
    } else {
        (r as usize, SysError::NONE)
    }
}

fn do_write(fd: RawFd, buffer: *mut u8, len: usize) -> (usize, SysError) {
    let r = unsafe { libc::write(fd, buffer.cast(), len) };
    if r < 0 {
        (0, SysError::last_os_error())
    } else {
        (r as usize, SysError::NONE)
    }
}
