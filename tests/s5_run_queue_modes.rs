// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Submit 10 tasks twice, once on a foreground-only run queue and once on a
//! 4-worker run queue; in both cases the shared counter reaches 20 and
//! stays there once the queue has been quiet for a while.

use ioq::{RunQueue, Task};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn ten_tasks_twice_reach_twenty_in_both_dispatch_modes() {
    let counter = Arc::new(AtomicU32::new(0));

    let foreground = RunQueue::new(0).unwrap();
    for _ in 0..10 {
        let counter = counter.clone();
        let t = Task::new(foreground.clone());
        t.exec(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }
    foreground.dispatch(0);
    assert_eq!(counter.load(Ordering::SeqCst), 10);

    let workers = RunQueue::new(4).unwrap();
    for _ in 0..10 {
        let counter = counter.clone();
        let t = Task::new(workers.clone());
        t.exec(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut waited = Duration::ZERO;
    while counter.load(Ordering::SeqCst) < 20 && waited < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
        waited += Duration::from_millis(10);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 20);

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.load(Ordering::SeqCst), 20);

    workers.shutdown();
}
