// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O readiness bridge.
//!
//! One process-wide `epoll` descriptor carries every registration. A
//! registration is **one-shot**: a heap record whose address rides in the
//! event's data word, consumed when the kernel reports the descriptor
//! ready. Suspended tasks are reachable from exactly one such record (or
//! one run queue), never both.
//!
//! The reactor doubles as worker 0's [`Park`] implementation: parking is
//! `epoll_wait`, unparking is a write to an `eventfd` that is permanently
//! registered. I/O is therefore polled exactly when worker 0 runs out of
//! tasks, and a spawn aimed at worker 0 interrupts the wait.
//!
//! At most one registration may be outstanding per descriptor at a time
//! (matching the one-record-per-fd protocol of the event word).

use std::io;
use std::os::fd::RawFd;
use std::task::Waker;

use crate::park::Park;
use crate::task::TaskRef;

/// The readiness kind a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

/// What to do when the descriptor becomes ready.
pub(crate) enum Pending {
    /// Wake the waker; the woken task re-attempts its syscall itself.
    Waker(Waker),
    /// Perform the read into the buffer, store the result on the I/O
    /// continuation task and spawn it (fork/join callback mode).
    ReadInto {
        task: TaskRef,
        buf: *mut u8,
        len: usize,
    },
}

// Safety: the raw buffer pointer is only dereferenced by the reactor
// after the owning task suspended against this registration.
unsafe impl Send for Pending {}

struct Registration {
    fd: RawFd,
    pending: Pending,
}

pub(crate) struct Reactor {
    epfd: RawFd,
    wakefd: RawFd,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        // Safety: plain syscalls, results checked below.
        unsafe {
            let epfd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }

            let wakefd = libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK);
            if wakefd < 0 {
                let err = io::Error::last_os_error();
                libc::close(epfd);
                return Err(err);
            }

            // The wake descriptor stays registered forever; data word 0
            // is reserved for it.
            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: 0,
            };
            if libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wakefd, &mut ev) < 0 {
                let err = io::Error::last_os_error();
                libc::close(epfd);
                libc::close(wakefd);
                return Err(err);
            }

            Ok(Self { epfd, wakefd })
        }
    }

    /// Registers a one-shot readiness record for `fd`.
    ///
    /// Level-triggered: if the descriptor is already ready the event
    /// fires on the next poll, so there is no lost-wakeup window between
    /// a failed syscall and the registration.
    pub(crate) fn register(&self, fd: RawFd, interest: Interest, pending: Pending) -> io::Result<()> {
        let record = Box::into_raw(Box::new(Registration { fd, pending }));

        let events = match interest {
            Interest::Readable => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Writable => libc::EPOLLOUT,
        } | libc::EPOLLONESHOT;

        let mut ev = libc::epoll_event {
            events: events as u32,
            u64: record as u64,
        };

        // Safety: fd is a live descriptor owned by the caller; the record
        // pointer is reclaimed either by the poller or on error below.
        unsafe {
            if libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) == 0 {
                return Ok(());
            }

            // The descriptor is still in the interest list from an
            // earlier one-shot; re-arm it.
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST)
                && libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) == 0
            {
                return Ok(());
            }

            drop(Box::from_raw(record));
            Err(io::Error::last_os_error())
        }
    }

    /// Polls for readiness, dispatching every fired registration.
    /// Blocks up to `timeout_ms` (`-1` for indefinitely). Returns the
    /// number of events handled.
    pub(crate) fn turn(&self, timeout_ms: i32) -> usize {
        const MAX_EVENTS: usize = 256;

        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        // Safety: the buffer outlives the call; EINTR is retried.
        let n = unsafe {
            loop {
                let n = libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout_ms,
                );
                if n >= 0 {
                    break n as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    panic!("epoll_wait failed: {err}");
                }
            }
        };

        for ev in &events[..n] {
            if ev.u64 == 0 {
                self.drain_wake();
                continue;
            }

            // Safety: non-zero data words are exactly the records
            // register() leaked, and EPOLLONESHOT means each fires once.
            let record = unsafe { Box::from_raw(ev.u64 as *mut Registration) };
            self.complete(*record);
        }

        n
    }

    fn complete(&self, record: Registration) {
        match record.pending {
            Pending::Waker(waker) => waker.wake(),
            Pending::ReadInto { task, buf, len } => {
                let n = raw_read(record.fd, buf, len);

                if n < 0 && last_errno() == libc::EAGAIN {
                    // Spurious readiness; re-arm the same record.
                    let _ = self.register(
                        record.fd,
                        Interest::Readable,
                        Pending::ReadInto { task, buf, len },
                    );
                    return;
                }

                crate::io::fill_read_result(&task, n);
                task.schedule();
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = 0u64;
        // Safety: reading our own eventfd into an 8-byte buffer; EAGAIN
        // just means already drained.
        unsafe {
            libc::read(
                self.wakefd,
                std::ptr::from_mut(&mut buf).cast(),
                size_of::<u64>(),
            );
        }
    }

    /// Interrupts a concurrent or future [`turn`](Self::turn).
    pub(crate) fn notify(&self) {
        let buf = 1u64;
        // Safety: writing 8 bytes to our own eventfd. A full counter
        // (EAGAIN) already guarantees the wakeup.
        unsafe {
            libc::write(
                self.wakefd,
                std::ptr::from_ref(&buf).cast(),
                size_of::<u64>(),
            );
        }
    }
}

impl Park for Reactor {
    fn park(&self) {
        self.turn(-1);
    }

    fn unpark(&self) {
        self.notify();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Registrations still outstanding at this point are leaked along
        // with their task references; shutdown is implicit on process
        // exit.
        // Safety: we own both descriptors.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wakefd);
        }
    }
}

// Safety: epoll and eventfd are thread-safe by the kernel's contract.
unsafe impl Send for Reactor {}
// Safety: see above.
unsafe impl Sync for Reactor {}

/// Non-blocking read with EINTR retry, returning the raw syscall result
/// (`-1` leaves the error in errno).
pub(crate) fn raw_read(fd: RawFd, buf: *mut u8, len: usize) -> isize {
    loop {
        // Safety: caller vouches for the buffer.
        let n = unsafe { libc::read(fd, buf.cast(), len) };
        if n >= 0 || last_errno() != libc::EINTR {
            return n;
        }
    }
}

pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
