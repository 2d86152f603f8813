// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous TCP socket: connect/accept, send and recv, each with its
//! own independent completion callback, plus a wait subsystem that
//! multiplexes all outstanding operations onto a single `FdWaiter` and a
//! dispatcher that hands completions to a run-queue task in a fixed order.

use crate::error::SysError;
use crate::io::{FdWaiter, IoQueue, ReadyMask};
use crate::task::Task;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::Arc;

bitflags! {
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    struct Ops: u8 {
        const CONNECT = 0x01;
        const ACCEPT  = 0x02;
        const SEND    = 0x04;
        const RECV    = 0x08;
        const CANCEL  = 0x10;
    }
}

type SockCallback = Box<dyn FnOnce(&Arc<AsyncSocket>) + Send + 'static>;

struct Ca {
    func: Option<SockCallback>,
    error: SysError,
    client: Option<Arc<AsyncSocket>>,
    addr: Option<(libc::sockaddr_in, libc::socklen_t)>,
}

struct SendState {
    data: *const u8,
    len: usize,
    size: usize,
    error: SysError,
    func: Option<SockCallback>,
}
unsafe impl Send for SendState {}

struct RecvState {
    data: *mut u8,
    len: usize,
    size: usize,
    error: SysError,
    func: Option<SockCallback>,
}
unsafe impl Send for RecvState {}

struct Wait {
    fd: Option<Arc<FdWaiter>>,
    ops: Ops,
}

/// An asynchronous TCP socket, inactive (no OS handle) until `listen` or
/// `connect` is called.
pub struct AsyncSocket {
    ioq: IoQueue,
    sock: Mutex<RawFd>,
    ca: Mutex<Ca>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    wait: Mutex<Wait>,
    dispatch_task: Arc<Task>,
    dispatch_queue: Mutex<Ops>,
}

impl AsyncSocket {
    #[must_use]
    pub fn new(ioq: IoQueue) -> Arc<AsyncSocket> {
        Arc::new(AsyncSocket {
            dispatch_task: Task::new(ioq.run_queue().clone()),
            ioq,
            sock: Mutex::new(-1),
            ca: Mutex::new(Ca { func: None, error: SysError::NONE, client: None, addr: None }),
            send: Mutex::new(SendState {
                data: std::ptr::null(),
                len: 0,
                size: 0,
                error: SysError::NONE,
                func: None,
            }),
            recv: Mutex::new(RecvState {
                data: std::ptr::null_mut(),
                len: 0,
                size: 0,
                error: SysError::NONE,
                func: None,
            }),
            wait: Mutex::new(Wait { fd: None, ops: Ops::empty() }),
            dispatch_queue: Mutex::new(Ops::empty()),
        })
    }

    #[must_use]
    pub fn handle(&self) -> RawFd {
        *self.sock.lock()
    }

    #[must_use]
    pub fn ca_error(&self) -> SysError {
        self.ca.lock().error
    }

    #[must_use]
    pub fn send_result(&self) -> (usize, SysError) {
        let s = self.send.lock();
        (s.size, s.error)
    }

    #[must_use]
    pub fn recv_result(&self) -> (usize, SysError) {
        let r = self.recv.lock();
        (r.size, r.error)
    }

    /// Bind and listen. The socket is created here; no accept is armed yet.
    pub fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<(), SysError> {
        let (raw, len) = sockaddr_from(addr)?;

        let mut sock = self.sock.lock();
        if *sock >= 0 {
            unsafe { libc::close(*sock) };
        }
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            let err = SysError::last_os_error();
            self.ca.lock().error = err;
            return Err(err);
        }
        *sock = fd;
        self.wait_init(fd);

        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&optval as *const libc::c_int).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = SysError::last_os_error();
            self.ca.lock().error = err;
            return Err(err);
        }

        let rc = unsafe { libc::bind(fd, std::ptr::addr_of!(raw).cast(), len) };
        if rc < 0 {
            let err = SysError::last_os_error();
            self.ca.lock().error = err;
            return Err(err);
        }

        let rc = unsafe { libc::listen(fd, libc::SOMAXCONN) };
        if rc < 0 {
            let err = SysError::last_os_error();
            self.ca.lock().error = err;
            return Err(err);
        }

        Ok(())
    }

    /// Wait for and accept one connection. `client` must be an inactive
    /// socket; on success it is populated with the accepted file
    /// descriptor. Accept and connect may not be outstanding together.
    pub fn accept(self: &Arc<Self>, client: Arc<AsyncSocket>, callback: impl FnOnce(&Arc<AsyncSocket>) + Send + 'static) {
        {
            let mut ca = self.ca.lock();
            ca.client = Some(client);
            ca.func = Some(Box::new(callback));
        }
        if *self.sock.lock() < 0 {
            self.ca.lock().error = SysError::from_errno(libc::EBADF);
            self.dispatch_push(Ops::ACCEPT);
            return;
        }
        self.wait_begin(Ops::ACCEPT);
    }

    /// Connect to `addr`, replacing any current OS handle on this socket.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr, callback: impl FnOnce(&Arc<AsyncSocket>) + Send + 'static) {
        let (raw, len) = match sockaddr_from(addr) {
            Ok(v) => v,
            Err(e) => {
                let mut ca = self.ca.lock();
                ca.func = Some(Box::new(callback));
                ca.error = e;
                drop(ca);
                self.dispatch_push(Ops::CONNECT);
                return;
            }
        };

        {
            let mut sock = self.sock.lock();
            if *sock >= 0 {
                unsafe { libc::close(*sock) };
            }
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                let err = SysError::last_os_error();
                drop(sock);
                let mut ca = self.ca.lock();
                ca.func = Some(Box::new(callback));
                ca.error = err;
                self.dispatch_push(Ops::CONNECT);
                return;
            }
            *sock = fd;
        }

        let fd = *self.sock.lock();
        self.wait_init(fd);
        set_nonblocking(fd);

        {
            let mut ca = self.ca.lock();
            ca.func = Some(Box::new(callback));
            ca.addr = Some((raw, len));
        }

        let rc = unsafe { libc::connect(fd, std::ptr::addr_of!(raw).cast(), len) };
        let err = std::io::Error::last_os_error();
        if rc < 0 && err.raw_os_error() != Some(libc::EINPROGRESS) {
            self.ca.lock().error = SysError::from(err);
            self.dispatch_push(Ops::CONNECT);
            return;
        }

        self.wait_begin(Ops::CONNECT);
    }

    /// Send on a connected socket. May run concurrently with a `recv`.
    pub fn send(self: &Arc<Self>, data: &[u8], callback: impl FnOnce(&Arc<AsyncSocket>) + Send + 'static) {
        {
            let mut s = self.send.lock();
            s.data = data.as_ptr();
            s.len = data.len();
            s.func = Some(Box::new(callback));
        }
        if *self.sock.lock() < 0 {
            self.send.lock().error = SysError::from_errno(libc::EBADF);
            self.dispatch_push(Ops::SEND);
            return;
        }
        self.wait_begin(Ops::SEND);
    }

    /// Receive on a connected socket. A graceful close yields `(0, None)`.
    pub fn recv(self: &Arc<Self>, data: &mut [u8], callback: impl FnOnce(&Arc<AsyncSocket>) + Send + 'static) {
        {
            let mut r = self.recv.lock();
            r.data = data.as_mut_ptr();
            r.len = data.len();
            r.func = Some(Box::new(callback));
        }
        if *self.sock.lock() < 0 {
            self.recv.lock().error = SysError::from_errno(libc::EBADF);
            self.dispatch_push(Ops::RECV);
            return;
        }
        self.wait_begin(Ops::RECV);
    }

    /// Cancel all outstanding operations and close the handle. Pending
    /// callbacks still fire, reporting whatever was in flight as canceled.
    pub fn close(self: &Arc<Self>) {
        let mut sock = self.sock.lock();
        if *sock < 0 {
            return;
        }
        let had_wait = self.wait_begin(Ops::CANCEL) != Ops::empty();
        if !had_wait {
            unsafe { libc::close(*sock) };
        }
        *sock = -1;
    }

    fn wait_init(self: &Arc<Self>, fd: RawFd) {
        let mut w = self.wait.lock();
        w.fd = Some(FdWaiter::new(self.ioq.clone(), fd));
        w.ops = Ops::empty();
    }

    fn wait_begin(self: &Arc<Self>, mask: Ops) -> Ops {
        let mut w = self.wait.lock();
        let previous = w.ops;

        if mask.contains(Ops::CANCEL) {
            if !w.ops.is_empty() {
                w.ops |= Ops::CANCEL;
                if let Some(fd) = &w.fd {
                    fd.cancel();
                }
            }
        } else {
            w.ops |= mask;
            let ready_mask = wait_mask(w.ops);
            let had_wait = !previous.is_empty();
            if let Some(fd) = w.fd.clone() {
                if had_wait {
                    fd.rewait(ready_mask);
                } else {
                    let socket = self.clone();
                    fd.wait(ready_mask, move || socket.wait_end());
                }
            }
        }

        previous
    }

    fn wait_end(self: Arc<Self>) {
        let mut dispatch_mask = Ops::empty();

        {
            let mut w = self.wait.lock();
            let fd = w.fd.clone().expect("wait_end fired without a wait fd");
            let fd_err = fd.error();

            if w.ops.contains(Ops::CANCEL) || !fd_err.is_none() {
                let e = fd_err;
                if w.ops.intersects(Ops::CONNECT | Ops::ACCEPT) {
                    self.ca.lock().error = e;
                }
                if w.ops.contains(Ops::SEND) {
                    let mut s = self.send.lock();
                    s.size = 0;
                    s.error = e;
                }
                if w.ops.contains(Ops::RECV) {
                    let mut r = self.recv.lock();
                    r.size = 0;
                    r.error = e;
                }
                if w.ops.contains(Ops::CANCEL) {
                    let sock = *self.sock.lock();
                    if sock >= 0 {
                        unsafe { libc::close(sock) };
                    }
                }
                dispatch_mask = w.ops;
                w.ops = Ops::empty();
            } else {
                if w.ops.contains(Ops::CONNECT) {
                    dispatch_mask |= self.wait_connect(&fd);
                }
                if w.ops.contains(Ops::ACCEPT) {
                    dispatch_mask |= self.wait_accept(&fd);
                }
                if w.ops.contains(Ops::SEND) {
                    dispatch_mask |= self.wait_send(&fd);
                }
                if w.ops.contains(Ops::RECV) {
                    dispatch_mask |= self.wait_recv(&fd);
                }

                w.ops.remove(dispatch_mask);
                if !w.ops.is_empty() {
                    let mask = wait_mask(w.ops);
                    let socket = self.clone();
                    fd.wait(mask, move || socket.wait_end());
                }
            }
        }

        if !dispatch_mask.is_empty() {
            self.dispatch_push(dispatch_mask);
        }
    }

    fn wait_connect(self: &Arc<Self>, fd: &Arc<FdWaiter>) -> Ops {
        let (raw, len) = self.ca.lock().addr.expect("connect without a target address");
        let rc = unsafe { libc::connect(fd.fd(), std::ptr::addr_of!(raw).cast(), len) };
        let err = std::io::Error::last_os_error();
        if rc < 0 {
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ops::empty();
            }
            self.ca.lock().error = SysError::from(err);
        } else {
            self.ca.lock().error = SysError::NONE;
        }
        Ops::CONNECT
    }

    fn wait_accept(self: &Arc<Self>, fd: &Arc<FdWaiter>) -> Ops {
        if !fd.ready().intersects(ReadyMask::IN | ReadyMask::OUT | ReadyMask::ERR) {
            return Ops::empty();
        }
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let r = unsafe { libc::accept(fd.fd(), std::ptr::addr_of_mut!(addr).cast(), &mut len) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ops::empty();
            }
            self.ca.lock().error = SysError::from(err);
        } else {
            let client = self.ca.lock().client.clone().expect("accept without a client socket");
            let mut client_sock = client.sock.lock();
            if *client_sock >= 0 {
                unsafe { libc::close(*client_sock) };
            }
            *client_sock = r;
            drop(client_sock);
            client.wait_init(r);
            self.ca.lock().error = SysError::NONE;
        }
        Ops::ACCEPT
    }

    fn wait_send(self: &Arc<Self>, fd: &Arc<FdWaiter>) -> Ops {
        if !fd.ready().intersects(ReadyMask::OUT | ReadyMask::ERR) {
            return Ops::empty();
        }
        let (data, len) = {
            let s = self.send.lock();
            (s.data, s.len)
        };
        let r = unsafe { libc::send(fd.fd(), data.cast(), len, 0) };
        let mut s = self.send.lock();
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ops::empty();
            }
            s.error = SysError::from(err);
            s.size = 0;
        } else {
            s.size = r as usize;
            s.error = SysError::NONE;
        }
        Ops::SEND
    }

    fn wait_recv(self: &Arc<Self>, fd: &Arc<FdWaiter>) -> Ops {
        if fd.ready().contains(ReadyMask::HUP) {
            let mut r = self.recv.lock();
            r.size = 0;
            r.error = SysError::NONE;
            return Ops::RECV;
        }
        if !fd.ready().intersects(ReadyMask::IN | ReadyMask::HUP) {
            return Ops::empty();
        }
        let (data, len) = {
            let r = self.recv.lock();
            (r.data, r.len)
        };
        let got = unsafe { libc::recv(fd.fd(), data.cast(), len, 0) };
        let mut r = self.recv.lock();
        if got < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ops::empty();
            }
            r.error = SysError::from(err);
            r.size = 0;
        } else {
            r.size = got as usize;
            r.error = SysError::NONE;
        }
        Ops::RECV
    }

    fn dispatch_push(self: &Arc<Self>, ops: Ops) {
        let was_empty = {
            let mut q = self.dispatch_queue.lock();
            let was_empty = q.is_empty();
            *q |= ops;
            was_empty
        };
        if was_empty {
            let socket = self.clone();
            self.dispatch_task.exec(move || socket.dispatch_run());
        }
    }

    fn dispatch_run(self: Arc<Self>) {
        let ops = {
            let mut q = self.dispatch_queue.lock();
            std::mem::replace(&mut *q, Ops::empty())
        };
        tracing::trace!(?ops, "socket dispatch pass");

        // Connect/accept, then send, then recv: a fixed order so a single
        // dispatch pass can never observe send/recv complete ahead of the
        // handshake that made the socket usable.
        if ops.intersects(Ops::CONNECT | Ops::ACCEPT) {
            if let Some(cb) = self.ca.lock().func.take() {
                cb(&self);
            }
        }
        if ops.contains(Ops::SEND) {
            if let Some(cb) = self.send.lock().func.take() {
                cb(&self);
            }
        }
        if ops.contains(Ops::RECV) {
            if let Some(cb) = self.recv.lock().func.take() {
                cb(&self);
            }
        }
    }
}

fn wait_mask(ops: Ops) -> ReadyMask {
    let mut m = ReadyMask::empty();
    if ops.intersects(Ops::CONNECT | Ops::SEND) {
        m |= ReadyMask::OUT;
    }
    if ops.intersects(Ops::CONNECT | Ops::ACCEPT | Ops::RECV) {
        m |= ReadyMask::IN | ReadyMask::ERR | ReadyMask::HUP;
    }
    m
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn sockaddr_from(addr: SocketAddr) -> Result<(libc::sockaddr_in, libc::socklen_t), SysError> {
    let SocketAddr::V4(v4) = addr else {
        return Err(SysError::from_errno(libc::EAFNOSUPPORT));
    };
    Ok((sockaddr_in_from_v4(v4), std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
}

fn sockaddr_in_from_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A single accept/connect/send/recv exchange exercises the wait and
    /// dispatch subsystems without the full byte-pattern scenario (covered
    /// as an integration test).
    #[test]
    fn single_send_then_recv_round_trips() {
        crate::test_util::init_tracing();
        let ioq = IoQueue::new(0).unwrap();

        let server = AsyncSocket::new(ioq.clone());
        let addr: SocketAddr = "127.0.0.1:51000".parse().unwrap();
        server.listen(addr).unwrap();

        let accepted = AsyncSocket::new(ioq.clone());
        let accept_done = Arc::new(AtomicBool::new(false));
        let accept_done2 = accept_done.clone();
        server.accept(accepted.clone(), move |s| {
            assert!(s.ca_error().is_none());
            accept_done2.store(true, Ordering::SeqCst);
        });

        let client = AsyncSocket::new(ioq.clone());
        let connect_done = Arc::new(AtomicBool::new(false));
        let connect_done2 = connect_done.clone();
        client.connect(addr, move |s| {
            assert!(s.ca_error().is_none());
            connect_done2.store(true, Ordering::SeqCst);
        });

        for _ in 0..20_000 {
            if accept_done.load(Ordering::SeqCst) && connect_done.load(Ordering::SeqCst) {
                break;
            }
            ioq.iterate().unwrap();
        }
        assert!(accept_done.load(Ordering::SeqCst));
        assert!(connect_done.load(Ordering::SeqCst));

        let sent = Arc::new(AtomicBool::new(false));
        let sent2 = sent.clone();
        client.send(b"hello", move |s| {
            let (size, error) = s.send_result();
            assert!(error.is_none());
            assert_eq!(size, 5);
            sent2.store(true, Ordering::SeqCst);
        });

        let mut buf = [0u8; 16];
        let recv_done = Arc::new(AtomicBool::new(false));
        let recv_size = Arc::new(AtomicUsize::new(0));
        let recv_done2 = recv_done.clone();
        let recv_size2 = recv_size.clone();
        accepted.recv(&mut buf, move |s| {
            let (size, error) = s.recv_result();
            assert!(error.is_none());
            recv_size2.store(size, Ordering::SeqCst);
            recv_done2.store(true, Ordering::SeqCst);
        });

        for _ in 0..20_000 {
            if sent.load(Ordering::SeqCst) && recv_done.load(Ordering::SeqCst) {
                break;
            }
            ioq.iterate().unwrap();
        }
        assert!(sent.load(Ordering::SeqCst));
        assert!(recv_done.load(Ordering::SeqCst));
        let size = recv_size.load(Ordering::SeqCst);
        assert_eq!(&buf[..size], b"hello");

        server.close();
        ioq.shutdown();
    }
}
