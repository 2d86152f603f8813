// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A worker-thread-backed asynchronous name resolver. One resolver may be
//! shared by any number of requests; each request keeps its own result and
//! completion callback, and resolution runs on a single dedicated thread so
//! that `getaddrinfo`-style blocking lookups never stall the run queue.

use crate::error::{InitError, SysError};
use crate::park::Event;
use crate::task::{RunQueue, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

struct Inner {
    run: RunQueue,
    queue: Mutex<VecDeque<Arc<DnsRequest>>>,
    wakeup: Arc<Event>,
    quit: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A shared asynchronous resolver. Cheap to clone.
#[derive(Clone)]
pub struct DnsResolver(Arc<Inner>);

impl DnsResolver {
    /// Spawn the resolver's single worker thread.
    pub fn new(run: RunQueue) -> Result<Self, InitError> {
        let inner = Arc::new(Inner {
            run,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Arc::new(Event::new()),
            quit: AtomicBool::new(false),
            worker: Mutex::new(None),
        });

        let worker_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("ioq-dns-worker".into())
            .spawn(move || worker_loop(worker_inner))
            .map_err(|e| InitError::Worker { index: 0, source: e })?;
        *inner.worker.lock() = Some(handle);

        Ok(DnsResolver(inner))
    }

    /// Stop accepting new work, wake the worker, and join it. May block
    /// until any lookup currently in flight finishes.
    pub fn shutdown(&self) {
        self.0.quit.store(true, Ordering::Release);
        self.0.wakeup.raise();
        if let Some(handle) = self.0.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

struct ReqState {
    busy: bool,
    host: String,
    service: String,
    callback: Option<Box<dyn FnOnce(&Arc<DnsRequest>) + Send + 'static>>,
}

/// One outstanding or completed lookup. Must not be asked from two threads
/// at once.
pub struct DnsRequest {
    owner: DnsResolver,
    task: Arc<Task>,
    state: Mutex<ReqState>,
    result: Mutex<(Vec<SocketAddr>, SysError)>,
}

impl DnsRequest {
    #[must_use]
    pub fn new(owner: DnsResolver) -> Arc<DnsRequest> {
        let task = Task::new(owner.0.run.clone());
        Arc::new(DnsRequest {
            owner,
            task,
            state: Mutex::new(ReqState {
                busy: false,
                host: String::new(),
                service: String::new(),
                callback: None,
            }),
            result: Mutex::new((Vec::new(), SysError::NONE)),
        })
    }

    #[must_use]
    pub fn result(&self) -> (Vec<SocketAddr>, SysError) {
        self.result.lock().clone()
    }

    pub fn clear_result(&self) {
        *self.result.lock() = (Vec::new(), SysError::NONE);
    }

    /// Begin a lookup of `hostname` under `service` (a port number or
    /// service name), as accepted by [`ToSocketAddrs`]. Any previous result
    /// is cleared first.
    pub fn ask(
        self: &Arc<Self>,
        hostname: impl Into<String>,
        service: impl Into<String>,
        callback: impl FnOnce(&Arc<DnsRequest>) + Send + 'static,
    ) {
        self.clear_result();

        let mut queue = self.owner.0.queue.lock();
        let mut state = self.state.lock();
        state.host = hostname.into();
        state.service = service.into();
        state.busy = true;
        state.callback = Some(Box::new(callback));
        drop(state);

        let was_empty = queue.is_empty();
        queue.push_back(self.clone());
        drop(queue);

        if was_empty {
            self.owner.0.wakeup.raise();
        }
    }

    /// Cancel a pending lookup. A cancelled request completes immediately
    /// with no error and an empty result. A no-op once resolution has
    /// started (the in-flight lookup still completes normally).
    pub fn cancel(self: &Arc<Self>) {
        let was_busy = {
            let mut queue = self.owner.0.queue.lock();
            let mut state = self.state.lock();
            if !state.busy {
                false
            } else {
                state.busy = false;
                if let Some(pos) = queue.iter().position(|r| Arc::ptr_eq(r, self)) {
                    queue.remove(pos);
                }
                true
            }
        };

        if was_busy {
            self.fire(Vec::new(), SysError::NONE);
        }
    }

    fn fire(self: &Arc<Self>, addrs: Vec<SocketAddr>, error: SysError) {
        tracing::trace!(resolved = addrs.len(), ok = error.is_none(), "dns request completed");
        *self.result.lock() = (addrs, error);
        let cb = self.state.lock().callback.take();
        let req = self.clone();
        self.task.exec(move || {
            if let Some(cb) = cb {
                cb(&req);
            }
        });
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        if inner.quit.load(Ordering::Acquire) {
            break;
        }

        let next = inner.queue.lock().front().cloned();
        let Some(req) = next else {
            inner.wakeup.wait();
            inner.wakeup.clear();
            continue;
        };

        let (host, service) = {
            let s = req.state.lock();
            (s.host.clone(), s.service.clone())
        };

        let lookup = format!("{host}:{service}").as_str().to_socket_addrs();

        // Only fire if this request is still the one at the front of the
        // queue: a concurrent cancel may have already removed it and fired
        // its callback with an empty, error-free result, in which case this
        // lookup's outcome must be discarded rather than delivered twice.
        let still_head = {
            let mut queue = inner.queue.lock();
            let matches = queue.front().is_some_and(|r| Arc::ptr_eq(r, &req));
            if matches {
                queue.pop_front();
            }
            matches
        };
        if !still_head {
            continue;
        }

        match lookup {
            Ok(addrs) => req.fire(addrs.collect(), SysError::NONE),
            Err(e) => req.fire(Vec::new(), SysError::from(e)),
        }
    }
}
