// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monotonic millisecond time source.

use std::time::{Duration, Instant};

/// Absolute monotonic time, in milliseconds, measured from an arbitrary
/// epoch fixed the first time [`Clock::now`] is called in this process.
pub type Ticks = u64;

/// A monotonic clock with millisecond resolution and a blocking sleep.
///
/// `Clock` is cheap to construct and `Copy`; every caller sees the same
/// epoch because [`Instant`] is itself monotonic and process-wide.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    #[must_use]
    pub fn new() -> Self {
        Clock { epoch: Instant::now() }
    }

    /// Milliseconds elapsed since this clock's epoch.
    #[must_use]
    pub fn now(&self) -> Ticks {
        self.epoch.elapsed().as_millis() as Ticks
    }

    /// Block the calling thread for `delay` milliseconds.
    pub fn wait(&self, delay_ms: u64) {
        std::thread::sleep(Duration::from_millis(delay_ms));
    }
}
