// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A portable, completion-callback-based I/O and concurrency runtime core.
//!
//! Four subsystems, leaves first:
//!
//! - [`task`] — a run queue (RQ) of callbacks drained by a caller thread or
//!   a fixed worker pool.
//! - [`timer`] — a deadline-ordered wait queue (WQ) of timers that post to
//!   an RQ on expiry.
//! - [`io`] — an I/O queue (IOQ) that owns an RQ and a WQ and multiplexes
//!   POSIX file descriptor readiness.
//! - [`mailbox`] — a 32-flag asynchronous event object.
//!
//! [`fs`] and [`net`] build an async file and an async socket on top of the
//! I/O queue; [`dns`] sketches a worker-thread-backed name resolver on top
//! of the run queue.

pub mod clock;
pub mod dns;
pub mod error;
pub mod fs;
pub mod io;
pub mod mailbox;
pub mod net;
pub mod park;
pub mod task;
pub mod timer;

pub use clock::{Clock, Ticks};
pub use dns::{DnsRequest, DnsResolver};
pub use error::{InitError, SysError};
pub use fs::AsyncFile;
pub use io::{FdWaiter, IoQueue, ReadyMask};
pub use mailbox::{Mailbox, WaitMode};
pub use net::AsyncSocket;
pub use park::{Event, WaitResult};
pub use task::{RunQueue, Task};
pub use timer::{Timer, WaitQueue};

#[cfg(test)]
pub(crate) mod test_util;
