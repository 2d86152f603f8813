// Copyright (c) 2026 the ioq authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A pipe round-trip of a seeded 64KiB pattern, driven entirely through one
//! `IoQueue`: the writer arms a 50ms timer, then on expiry pushes up to
//! 8192-byte chunks into the write end while a reader drains the read end
//! until EOF, and the reassembled bytes must match the pattern exactly.

use ioq::{AsyncFile, IoQueue, Timer};
use rand::RngCore;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn pipe_round_trip_matches_seeded_pattern() {
    let ioq = IoQueue::new(0).unwrap();

    let mut pipe_fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);
    let (r, w) = (pipe_fds[0], pipe_fds[1]);
    for fd in [r, w] {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::fcntl(fd, libc::F_GETFL) | libc::O_NONBLOCK);
        }
    }

    let writer = AsyncFile::new(ioq.clone(), w);
    let reader = AsyncFile::new(ioq.clone(), r);

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
    let mut pattern = vec![0u8; 65536];
    rng.fill_bytes(&mut pattern);

    let out = Arc::new(Mutex::new(Vec::<u8>::with_capacity(65536)));
    let write_done = Arc::new(AtomicBool::new(false));
    let read_done = Arc::new(AtomicBool::new(false));

    let timer = Timer::new(ioq.wait_queue().clone());
    let pattern_for_timer = pattern.clone();
    let write_done_for_timer = write_done.clone();
    timer.wait(50, move || {
        write_chunks(writer, pattern_for_timer, 0, write_done_for_timer);
    });
    read_until_eof(reader, out.clone(), read_done.clone());

    for _ in 0..50_000 {
        if write_done.load(Ordering::SeqCst) && read_done.load(Ordering::SeqCst) {
            break;
        }
        ioq.iterate().unwrap();
    }
    assert!(write_done.load(Ordering::SeqCst));
    assert!(read_done.load(Ordering::SeqCst));
    assert_eq!(*out.lock().unwrap(), pattern);

    unsafe {
        libc::close(w);
    }
    ioq.shutdown();
}

struct SendConstPtr(*const [u8]);
unsafe impl Send for SendConstPtr {}

struct SendMutPtr(*mut [u8]);
unsafe impl Send for SendMutPtr {}

fn write_chunks(file: Arc<AsyncFile>, data: Vec<u8>, offset: usize, done: Arc<AtomicBool>) {
    if offset >= data.len() {
        done.store(true, Ordering::SeqCst);
        return;
    }
    let end = (offset + 8192).min(data.len());
    let chunk: Box<[u8]> = data[offset..end].to_vec().into_boxed_slice();
    let chunk_ptr: *const [u8] = Box::into_raw(chunk);
    let chunk_ptr = SendConstPtr(chunk_ptr);
    let file2 = file.clone();
    let data2 = data.clone();
    file.write(unsafe { &*chunk_ptr.0 }, move |f| {
        let chunk_ptr = chunk_ptr;
        let (size, error) = f.write_result();
        let _ = unsafe { Box::from_raw(chunk_ptr.0 as *mut [u8]) };
        assert!(error.is_none());
        write_chunks(file2, data2, offset + size.max(1).min(end - offset), done);
    });
}

fn read_until_eof(file: Arc<AsyncFile>, out: Arc<Mutex<Vec<u8>>>, done: Arc<AtomicBool>) {
    let buf: Box<[u8]> = vec![0u8; 3172].into_boxed_slice();
    let buf_ptr: *mut [u8] = Box::into_raw(buf);
    let buf_ptr = SendMutPtr(buf_ptr);
    let file2 = file.clone();
    file.read(unsafe { &mut *buf_ptr.0 }, move |f| {
        let buf_ptr = buf_ptr;
        let (size, error) = f.read_result();
        let slice = unsafe { Box::from_raw(buf_ptr.0) };
        assert!(error.is_none());
        if size == 0 {
            done.store(true, Ordering::SeqCst);
            unsafe {
                libc::close(f.fd());
            }
            return;
        }
        out.lock().unwrap().extend_from_slice(&slice[..size]);
        read_until_eof(file2, out, done);
    });
}
