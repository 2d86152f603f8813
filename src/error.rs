// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy. System errors are an opaque OS error code;
//! they never unwind through the runtime and are always delivered to the
//! callback associated with the operation that failed.

use std::fmt;
use std::io;

/// An opaque system error code, carrying the underlying OS `errno`.
///
/// `0` is reserved to mean "no error" so that per-operation error fields
/// (`read.error`, `ca_error`, ...) can use `SysError::NONE` as their rest
/// state without an `Option` wrapper.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
pub struct SysError(i32);

impl SysError {
    pub const NONE: SysError = SysError(0);

    #[must_use]
    pub const fn from_errno(errno: i32) -> Self {
        SysError(errno)
    }

    #[must_use]
    pub fn last_os_error() -> Self {
        SysError(io::Error::last_os_error().raw_os_error().unwrap_or(-1))
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("SysError(none)")
        } else {
            write!(f, "SysError({}: {})", self.0, self)
        }
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("no error")
        } else {
            fmt::Display::fmt(&io::Error::from_raw_os_error(self.0), f)
        }
    }
}

impl std::error::Error for SysError {}

impl From<io::Error> for SysError {
    fn from(e: io::Error) -> Self {
        SysError(e.raw_os_error().unwrap_or(-1))
    }
}

/// Failures that can occur while constructing a runtime object. These are
/// the only fallible paths in the core: worker thread creation,
/// multiplexer/pipe creation, mutex/event initialization.
#[derive(Debug)]
pub enum InitError {
    /// The `n`-th worker thread failed to spawn. Workers `0..n` were
    /// already quit and joined before this error is returned.
    Worker { index: u32, source: io::Error },
    /// Creating the OS readiness multiplexer failed.
    Multiplexer(io::Error),
    /// Creating the cross-thread wakeup pipe failed.
    WakeupPipe(io::Error),
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::Worker { index, source } => {
                write!(f, "failed to start worker thread {index}: {source}")
            }
            InitError::Multiplexer(e) => write!(f, "failed to create readiness multiplexer: {e}"),
            InitError::WakeupPipe(e) => write!(f, "failed to create wakeup pipe: {e}"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::Worker { source, .. } => Some(source),
            InitError::Multiplexer(e) | InitError::WakeupPipe(e) => Some(e),
        }
    }
}
