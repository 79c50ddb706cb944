// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::JoinError;
use crate::task::{Id, TaskRef, future};

/// Owned permission to await (and cancel) a spawned task.
///
/// Awaiting the handle is the parent link between coroutine frames: the
/// awaiter suspends until the task completes and then resumes with its
/// output. Dropping the handle *detaches* the task — it keeps running to
/// completion as an independent task and the scheduler destroys its frame
/// afterwards.
pub struct JoinHandle<T> {
    task: TaskRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self {
            task,
            _marker: PhantomData,
        }
    }

    /// Returns the id of the task this handle refers to.
    pub fn id(&self) -> Id {
        self.task.id()
    }

    /// Whether the task has run to completion (or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.state().is_complete()
    }

    /// Requests cancellation.
    ///
    /// Cancellation is cooperative: the task is woken once more and
    /// completes as cancelled at its next dispatch without polling the
    /// user future again. Awaiting the handle afterwards yields
    /// [`JoinError::Cancelled`].
    pub fn cancel(&self) {
        if self.task.state().cancel() {
            self.task.wake_by_ref();
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.task.state().is_complete() {
            // Park our waker first, then re-check: completion after the
            // check but before the store would otherwise be lost.
            // Safety: join handles are only created for future cells.
            unsafe {
                future::register_join_waker(this.task.raw(), cx.waker());
            }

            if !this.task.state().is_complete() {
                return Poll::Pending;
            }
        }

        let mut out = MaybeUninit::<Result<T, JoinError>>::uninit();
        // Safety: COMPLETE was observed with acquire ordering, the output
        // slot matches the task's output type by construction, and the
        // future contract means we are polled at most once more after
        // returning Ready.
        unsafe {
            let read_output = this.task.header().vtable.read_output;
            read_output(this.task.raw(), out.as_mut_ptr().cast());
            Poll::Ready(out.assume_init())
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .field("finished", &self.is_finished())
            .finish()
    }
}
