// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackless coroutine tasks.
//!
//! A spawned [`Future`] lives in a [`FutureCell`]: the shared [`Header`]
//! followed by the join-waker slot and the future's stage. The `RUNNING`
//! bit of the state word is the lock on the stage — only the worker that
//! set it may poll the future or, on completion, store the output.
//!
//! Awaiting the matching [`JoinHandle`] is the continuation link between
//! frames: the awaiter parks its waker here and completion wakes it,
//! which re-spawns the awaiter on some worker. Dropping the handle
//! detaches the task; the scheduler's last reference then destroys the
//! frame on completion.
//!
//! [`JoinHandle`]: crate::task::JoinHandle

use std::any::type_name;
use std::cell::UnsafeCell;
use std::mem::{self, ManuallyDrop};
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::JoinError;
use crate::executor::{Core, Worker};
use crate::task::state::StartPoll;
use crate::task::{Header, JoinHandle, TaskRef, VTable, raw_waker};

/// Layout prefix shared by every `FutureCell<F>`, so the non-generic
/// [`JoinHandle`] can reach the join waker without knowing `F`.
#[repr(C)]
pub(crate) struct CellPrefix {
    pub(crate) header: Header,
    join_waker: Mutex<Option<Waker>>,
}

#[repr(C)]
pub(crate) struct FutureCell<F: Future> {
    prefix: CellPrefix,

    /// The future, or its output once complete.
    ///
    /// Guarded by the `RUNNING` bit while pending; after `COMPLETE` is
    /// observed (acquire), exclusive to the join handle.
    stage: UnsafeCell<Stage<F>>,
}

enum Stage<F: Future> {
    /// The future is still pending.
    Pending(F),
    /// The future finished (or was cancelled) and its output waits for
    /// the join handle.
    Ready(Result<F::Output, JoinError>),
    /// The output has been taken or will never be needed.
    Consumed,
}

impl<F> FutureCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    const VTABLE: VTable = VTable {
        run: Self::run,
        read_output: Self::read_output,
        deallocate: Self::deallocate,
    };

    /// Allocates a cell for `future`, returning the initial queue
    /// reference and the join handle.
    pub(crate) fn allocate(future: F, core: Arc<Core>) -> (TaskRef, JoinHandle<F::Output>) {
        let header = Header::new(&Self::VTABLE, core, tracing::Span::none());
        let span = tracing::trace_span!(
            "task",
            task.id = %header.id,
            task.output = %type_name::<F::Output>(),
        );

        let cell = Box::new(Self {
            prefix: CellPrefix {
                header: Header { span, ..header },
                join_waker: Mutex::new(None),
            },
            stage: UnsafeCell::new(Stage::Pending(future)),
        });

        let ptr = NonNull::from(Box::leak(cell)).cast::<Header>();
        // Safety: the fresh cell starts with exactly one counted
        // reference, which we take here.
        let task = unsafe { TaskRef::from_raw(ptr) };
        let join = JoinHandle::new(task.clone());
        (task, join)
    }

    /// One dispatch step: poll the future once.
    ///
    /// # Safety
    ///
    /// `ptr` must point at a `FutureCell<F>` and the caller must own a
    /// queue reference, which this call consumes.
    unsafe fn run(ptr: NonNull<Header>, worker: &mut Worker) {
        // Safety: per the contract, ptr is a live cell of our type.
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            let task = TaskRef::from_raw(ptr);

            match this.prefix.header.state.start_poll() {
                StartPoll::Poll => {}
                StartPoll::Skip => return,
                StartPoll::Cancelled => {
                    // RUNNING is held, so the stage is ours: drop the
                    // future and publish the cancellation.
                    *this.stage.get() = Stage::Ready(Err(JoinError::Cancelled));
                    this.prefix.header.state.complete();
                    this.wake_join_waker();
                    return;
                }
            }

            // The waker borrows the queue reference we already own; wrap
            // it in ManuallyDrop so the borrow is not double-counted.
            let waker = ManuallyDrop::new(Waker::from_raw(raw_waker(ptr)));
            let mut cx = Context::from_waker(&waker);

            let poll = {
                let _span = this.prefix.header.span.enter();
                // Safety: RUNNING grants exclusive stage access; the cell
                // is heap-pinned so the future never moves.
                let Stage::Pending(future) = &mut *this.stage.get() else {
                    unreachable!("pending task without a future");
                };
                Pin::new_unchecked(future).poll(&mut cx)
            };

            match poll {
                Poll::Ready(output) => {
                    *this.stage.get() = Stage::Ready(Ok(output));
                    this.prefix.header.state.complete();
                    this.wake_join_waker();
                    drop(task);
                }
                Poll::Pending => {
                    if this.prefix.header.state.end_poll_pending() {
                        // Woken mid-poll: keep the queue reference and go
                        // straight back to the local queue.
                        worker.push_local(task);
                    } else {
                        // Whoever wakes the task later holds a waker
                        // clone; release the queue reference.
                        drop(task);
                    }
                }
            }
        }
    }

    /// Moves the output into `out` (a `*mut Result<F::Output, JoinError>`).
    ///
    /// # Safety
    ///
    /// Must only be called once, after `COMPLETE` has been observed with
    /// acquire ordering, with `out` pointing at a properly typed slot.
    unsafe fn read_output(ptr: NonNull<Header>, out: *mut ()) {
        // Safety: per the contract, the stage is exclusively ours now.
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            match mem::replace(&mut *this.stage.get(), Stage::Consumed) {
                Stage::Ready(output) => {
                    out.cast::<Result<F::Output, JoinError>>().write(output);
                }
                _ => unreachable!("join handle polled after completion"),
            }
        }
    }

    /// # Safety
    ///
    /// Reference count must be zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: last reference gone, the allocation is ours to free.
        unsafe {
            debug_assert_eq!(ptr.as_ref().state.refcount(), 0);
            drop(Box::from_raw(ptr.cast::<Self>().as_ptr()));
        }
    }

    fn wake_join_waker(&self) {
        if let Some(waker) = self.prefix.join_waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// Stores `waker` as the join waker of the task behind `ptr`.
///
/// # Safety
///
/// `ptr` must point at a `FutureCell` (any `F`).
pub(crate) unsafe fn register_join_waker(ptr: NonNull<Header>, waker: &Waker) {
    // Safety: all future cells start with CellPrefix, so the cast is
    // layout-correct for any F.
    let prefix = unsafe { ptr.cast::<CellPrefix>().as_ref() };
    let mut slot = prefix.join_waker.lock().unwrap();
    match &mut *slot {
        Some(existing) if existing.will_wake(waker) => {}
        other => *other = Some(waker.clone()),
    }
}
