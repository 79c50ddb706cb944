// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber tasks: suspendable computations on private machine stacks.
//!
//! A fiber spawned with [`Executor::spawn_fiber`] runs ordinary
//! synchronous code; the blocking-style I/O calls in this module suspend
//! the fiber on a not-ready descriptor and the reactor resumes it once
//! data arrives — possibly on a different worker. The saved machine state
//! lives entirely on the fiber's stack, so resumption anywhere is safe;
//! the per-thread bookkeeping below is re-established by the resuming
//! worker on every switch, never cached across a suspension point.
//!
//! Stacks come from a bounded per-worker free pool (64 KiB each, guard
//! page at the bottom) and return to the pool of whichever worker
//! observes the fiber finish.
//!
//! [`Executor::spawn_fiber`]: crate::executor::Executor::spawn_fiber

use std::cell::Cell;
use std::cell::UnsafeCell;
use std::io;
use std::mem::ManuallyDrop;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::task::Waker;

use weft_fiber::stack::DefaultFiberStack;
use weft_fiber::{Fiber, FiberResult, Suspend};

use crate::executor::{Core, Worker};
use crate::io::{sys_read, sys_write};
use crate::reactor::{Interest, Pending};
use crate::task::state::StartPoll;
use crate::task::{Header, TaskRef, VTable, raw_waker};

/// Default size of a fiber stack, excluding the guard page.
pub(crate) const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// How many spare stacks a worker keeps around.
pub(crate) const MAX_POOLED_STACKS: usize = 8;

type FiberImpl = Fiber<(), (), (), DefaultFiberStack>;

std::thread_local! {
    /// The fiber cell currently executing on this thread, while one is.
    ///
    /// Set by the resuming worker immediately before each switch into the
    /// fiber, so lookups made from fiber code always see the state of the
    /// worker actually running it.
    static CURRENT_FIBER: Cell<Option<NonNull<FiberCell>>> = const { Cell::new(None) };
}

#[repr(C)]
struct FiberCell {
    header: Header,

    /// The fiber itself; taken out on completion to recover the stack.
    ///
    /// Guarded by the `RUNNING` bit like a future cell's stage.
    fiber: UnsafeCell<Option<FiberImpl>>,

    /// Address of the fiber's suspend handle, written by the entry
    /// trampoline on first resume. Lives on the fiber stack.
    suspend: Cell<Option<NonNull<Suspend<(), ()>>>>,
}

impl FiberCell {
    const VTABLE: VTable = VTable {
        run: Self::run,
        read_output: Self::no_output,
        deallocate: Self::deallocate,
    };

    /// One dispatch step: resume the fiber until it suspends or finishes.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a `FiberCell`; the caller transfers its queue
    /// reference into the call.
    unsafe fn run(ptr: NonNull<Header>, worker: &mut Worker) {
        // Safety: contract above.
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            let task = TaskRef::from_raw(ptr);

            match this.header.state.start_poll() {
                // Cancellation of a suspended fiber cannot unwind its
                // stack; per the cooperative model it simply gets its
                // final resume.
                StartPoll::Poll | StartPoll::Cancelled => {}
                StartPoll::Skip => return,
            }

            let result = {
                let _span = this.header.span.enter();

                // Refresh the per-thread slot for the duration of the
                // switch; fiber-side lookups go through it.
                CURRENT_FIBER.set(Some(ptr.cast()));
                // Safety: RUNNING grants exclusive access to the fiber.
                let fiber = (*this.fiber.get())
                    .as_mut()
                    .expect("fiber resumed after completion");
                let result = fiber.resume(());
                CURRENT_FIBER.set(None);
                result
            };

            match result {
                FiberResult::Yield(()) => {
                    // Suspended on the reactor. Unless a wake raced us
                    // mid-resume, the registration now owns the fiber.
                    if this.header.state.end_poll_pending() {
                        worker.push_local(task);
                    } else {
                        drop(task);
                    }
                }
                FiberResult::Return(()) => {
                    // Safety: still exclusive; the fiber is done.
                    let fiber = (*this.fiber.get())
                        .take()
                        .expect("fiber completed twice");
                    worker.release_stack(fiber.into_stack());

                    this.header.state.complete();
                    drop(task);
                }
            }
        }
    }

    unsafe fn no_output(_: NonNull<Header>, _: *mut ()) {
        unreachable!("fiber tasks have no join output");
    }

    /// # Safety
    ///
    /// Reference count must be zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: last reference gone.
        unsafe {
            debug_assert_eq!(ptr.as_ref().state.refcount(), 0);
            let mut cell = Box::from_raw(ptr.cast::<Self>().as_ptr());

            // A fiber drained at shutdown before it ever ran has nothing
            // live on its stack; reset it so the drop assertion holds
            // (the entry closure is leaked).
            if let Some(fiber) = cell.fiber.get_mut().as_mut() {
                assert!(!fiber.started(), "suspended fiber reached refcount zero");
                fiber.force_reset();
            }

            drop(cell);
        }
    }
}

/// Allocates a fiber cell running `f` and returns its initial queue
/// reference.
pub(crate) fn allocate<F>(f: F, stack: DefaultFiberStack, core: Arc<Core>) -> TaskRef
where
    F: FnOnce() + Send + 'static,
{
    let header = Header::new(&FiberCell::VTABLE, core, tracing::Span::none());
    let span = tracing::trace_span!("fiber", task.id = %header.id);

    let cell = Box::new(FiberCell {
        header: Header { span, ..header },
        fiber: UnsafeCell::new(None),
        suspend: Cell::new(None),
    });
    let ptr = NonNull::from(Box::leak(cell));

    let cell_ptr = ptr.as_ptr();
    let fiber = Fiber::with_stack(stack, move |(), suspend: &Suspend<(), ()>| {
        // Publish the suspend handle's address so the blocking-style I/O
        // calls below can reach it.
        // Safety: the cell outlives the fiber; only this fiber writes the
        // slot.
        unsafe {
            (*cell_ptr).suspend.set(Some(NonNull::from(suspend)));
        }
        f();
    });

    // Safety: the cell is not yet shared.
    unsafe {
        *ptr.as_ref().fiber.get() = Some(fiber);
        TaskRef::from_raw(ptr.cast())
    }
}

/// The fiber cell running on this thread right now.
fn current_cell() -> NonNull<FiberCell> {
    CURRENT_FIBER
        .get()
        .expect("weft::fiber I/O used outside of a fiber")
}

/// A waker that re-enqueues the current fiber when invoked.
fn current_waker() -> Waker {
    let ptr = current_cell().cast::<Header>();
    // Safety: the cell is alive (we are running on it); the waker takes
    // its own counted reference.
    unsafe {
        let task = ManuallyDrop::new(TaskRef::from_raw(ptr));
        let _ = (*task).clone().into_raw();
        Waker::from_raw(raw_waker(ptr))
    }
}

/// Registers the current fiber for readiness on `fd` and suspends it.
/// Returns once the reactor has resumed the fiber.
fn suspend_on(fd: RawFd, interest: Interest) -> io::Result<()> {
    let cell = current_cell();

    // Safety: the cell is alive; reading the header for its core handle.
    let core = unsafe { Arc::clone(&cell.as_ref().header.core) };
    core.reactor()
        .register(fd, interest, Pending::Waker(current_waker()))?;

    // Safety: the entry trampoline published the handle before any user
    // code could run.
    let suspend = unsafe {
        cell.as_ref()
            .suspend
            .get()
            .expect("fiber suspend handle not published")
            .as_ref()
    };
    suspend.suspend(());
    Ok(())
}

/// Reads from `fd` into `buf`, suspending the calling fiber until the
/// descriptor is readable. `Ok(0)` signals end of stream.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match sys_read(fd, buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                suspend_on(fd, Interest::Readable)?;
            }
            ready => return ready,
        }
    }
}

/// Writes `buf` to `fd`, suspending the calling fiber until the
/// descriptor accepts data. A single short write is possible.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        match sys_write(fd, buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                suspend_on(fd, Interest::Writable)?;
            }
            ready => return ready,
        }
    }
}

/// Accepts a connection on the listening descriptor `fd`, suspending the
/// calling fiber until one is pending.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, std::net::SocketAddr)> {
    loop {
        match crate::io::sys_accept(fd) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                suspend_on(fd, Interest::Readable)?;
            }
            ready => return ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::executor::Executor;
    use crate::io::sys_write;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        // Safety: out array sized for pipe2.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0, "pipe2 failed");
        (fds[0], fds[1])
    }

    #[test]
    fn fiber_runs_to_completion() {
        let exec = Executor::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        exec.spawn_fiber({
            let exec = exec.clone();
            let ran = Arc::clone(&ran);
            move || {
                ran.fetch_add(1, Ordering::AcqRel);
                exec.stop();
            }
        });

        exec.join();
        assert_eq!(ran.load(Ordering::Acquire), 1);
    }

    #[test]
    fn fiber_read_suspends_and_keeps_local_state() {
        let exec = Executor::new(2).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let (rd, wr) = pipe();

        exec.spawn_fiber({
            let exec = exec.clone();
            let total = Arc::clone(&total);
            move || {
                // Stack state that must survive both suspensions
                // bit-exact.
                let mut acc: usize = 0;
                let mut buf = [0u8; 16];

                loop {
                    let n = read(rd, &mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    acc += n;
                }

                total.store(acc, Ordering::Release);
                exec.stop();
            }
        });

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            sys_write(wr, b"abc").unwrap();
            thread::sleep(Duration::from_millis(30));
            sys_write(wr, b"defgh").unwrap();
            // Safety: closing our own write end signals EOF.
            unsafe { libc::close(wr) };
        });

        exec.join();
        writer.join().unwrap();
        // Safety: closing our own read end.
        unsafe { libc::close(rd) };

        assert_eq!(total.load(Ordering::Acquire), 8);
    }

    #[test]
    fn many_fibers_share_the_stack_pool() {
        const FIBERS: usize = 32;

        let exec = Executor::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..FIBERS {
            exec.spawn_fiber({
                let exec = exec.clone();
                let done = Arc::clone(&done);
                move || {
                    if done.fetch_add(1, Ordering::AcqRel) == FIBERS - 1 {
                        exec.stop();
                    }
                }
            });
        }

        exec.join();
        assert_eq!(done.load(Ordering::Acquire), FIBERS);
    }

    #[test]
    fn fiber_write_suspends_on_full_pipe() {
        let exec = Executor::new(1).unwrap();
        let (rd, wr) = pipe();
        let written = Arc::new(AtomicUsize::new(0));

        // Fill the pipe so the fiber's write has to wait.
        let filler = [0u8; 4096];
        let mut filled = 0usize;
        loop {
            match sys_write(wr, &filler) {
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("fill failed: {err}"),
            }
        }

        exec.spawn_fiber({
            let exec = exec.clone();
            let written = Arc::clone(&written);
            move || {
                let n = write(wr, b"squeezed in").unwrap();
                written.store(n, Ordering::Release);
                exec.stop();
            }
        });

        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut buf = vec![0u8; filled];
            let mut drained = 0;
            while drained < filled {
                match crate::io::sys_read(rd, &mut buf) {
                    Ok(n) => drained += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(err) => panic!("drain failed: {err}"),
                }
            }
        });

        exec.join();
        drainer.join().unwrap();
        // Safety: closing our own descriptors.
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }

        assert!(written.load(Ordering::Acquire) > 0);
    }
}
