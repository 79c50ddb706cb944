// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub(crate) mod future;
mod id;
mod join;
pub(crate) mod state;
mod yield_now;

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::task::{RawWaker, RawWakerVTable};

use static_assertions::assert_impl_all;

use crate::executor::Core;
use crate::task::state::State;

pub use id::Id;
pub use join::JoinHandle;
pub use yield_now::{YieldNow, yield_now};

/// A type-erased, reference-counted pointer to a spawned task.
///
/// Tasks are pinned in memory once allocated, so the scheduler moves
/// `TaskRef`s around instead: plain pointers to the task's [`Header`],
/// interacting with the concrete allocation through the header's vtable.
/// The type erasure keeps the scheduler monomorphic — every future, fork
/// body or fiber spawned onto the runtime is driven through the same four
/// function pointers instead of specialising the whole scheduler per
/// spawn site.
///
/// The task is deallocated when the last `TaskRef` (including the ones
/// hidden inside wakers and join handles) is dropped.
#[derive(Eq, PartialEq)]
pub struct TaskRef(NonNull<Header>);

pub(crate) struct Header {
    /// Lifecycle word: reference count plus run-state flags.
    pub(crate) state: State,
    pub(crate) vtable: &'static VTable,
    pub(crate) id: Id,
    /// The executor this task schedules onto when woken.
    pub(crate) core: Arc<Core>,
    /// The worker that last ran this task; wakes prefer it for cache
    /// locality.
    pub(crate) last_worker: AtomicUsize,
    /// Span every run of this task is recorded under.
    pub(crate) span: tracing::Span,
}

pub(crate) struct VTable {
    /// Runs one dispatch step of the task, consuming a queue reference.
    pub(crate) run: unsafe fn(NonNull<Header>, &mut crate::executor::Worker),

    /// Moves the completed output into the provided slot; only meaningful
    /// for tasks that have a [`JoinHandle`].
    pub(crate) read_output: unsafe fn(NonNull<Header>, *mut ()),

    /// Drops the concrete allocation. Called when the reference count
    /// hits zero.
    pub(crate) deallocate: unsafe fn(NonNull<Header>),
}

impl Header {
    pub(crate) fn new(vtable: &'static VTable, core: Arc<Core>, span: tracing::Span) -> Self {
        Self {
            state: State::new(),
            vtable,
            id: Id::next(),
            core,
            last_worker: AtomicUsize::new(usize::MAX),
            span,
        }
    }
}

// === impl TaskRef ===

impl TaskRef {
    /// Takes ownership of one reference counted in the pointee's state.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the [`Header`] of a live task allocation, and
    /// the caller must own one of its counted references.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Header>) -> Self {
        Self(ptr)
    }

    /// Releases the pointer without dropping the reference; the caller
    /// becomes responsible for it again (queues store tasks this way).
    pub(crate) fn into_raw(self) -> NonNull<Header> {
        let ptr = self.0;
        std::mem::forget(self);
        ptr
    }

    pub(crate) fn raw(&self) -> NonNull<Header> {
        self.0
    }

    pub(crate) fn header(&self) -> &Header {
        // Safety: the reference we hold keeps the allocation alive.
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn state(&self) -> &State {
        &self.header().state
    }

    /// Returns the task's unique identifier.
    pub fn id(&self) -> Id {
        self.header().id
    }

    /// Runs one dispatch step, consuming this queue reference.
    pub(crate) fn run(self, worker: &mut crate::executor::Worker) {
        let ptr = self.into_raw();
        // Safety: ptr is a live task and we just transferred our
        // reference into the call.
        unsafe {
            let run = ptr.as_ref().vtable.run;
            run(ptr, worker);
        }
    }

    /// Hands this reference to the task's executor for execution.
    pub(crate) fn schedule(self) {
        let core = Arc::clone(&self.header().core);
        core.schedule(self);
    }

    /// Wakes the task as a waker would: marks it scheduled and enqueues
    /// it unless it already is.
    pub(crate) fn wake_by_ref(&self) {
        if self.state().wake() {
            self.clone().schedule();
        }
    }
}

impl Clone for TaskRef {
    #[inline]
    fn clone(&self) -> Self {
        self.state().clone_ref();
        Self(self.0)
    }
}

impl Drop for TaskRef {
    #[inline]
    fn drop(&mut self) {
        if !self.state().drop_ref() {
            return;
        }

        tracing::trace!(task.id = %self.id(), "deallocating task");
        // Safety: the count reached zero, nobody else can reach the
        // allocation anymore.
        unsafe {
            let deallocate = self.header().vtable.deallocate;
            deallocate(self.0);
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("addr", &self.0)
            .finish()
    }
}

// Safety: the state protocol (RUNNING as a stage lock, atomic refcount)
// synchronises all access to the pointee.
unsafe impl Send for TaskRef {}
// Safety: see above.
unsafe impl Sync for TaskRef {}

assert_impl_all!(TaskRef: Send, Sync);

// === task wakers ===

/// Builds a [`RawWaker`] over a task header. The waker owns one counted
/// reference.
///
/// `Waker::will_wake` compares data and vtable pointers; keeping this
/// out-of-line keeps one vtable address across clones so redundant waker
/// updates stay cheap.
#[inline(never)]
pub(crate) fn raw_waker(ptr: NonNull<Header>) -> RawWaker {
    RawWaker::new(ptr.as_ptr().cast(), &WAKER_VTABLE)
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    // Safety: waker data pointers always come from raw_waker.
    unsafe {
        let header = &*ptr.cast::<Header>();
        header.state.clone_ref();
        raw_waker(NonNull::new_unchecked(ptr.cast_mut().cast()))
    }
}

unsafe fn wake_by_val(ptr: *const ()) {
    // Safety: waker data pointers always come from raw_waker.
    unsafe {
        let header = &*ptr.cast::<Header>();
        tracing::trace!(task.id = %header.id, "wake");

        let ptr = NonNull::new_unchecked(ptr.cast_mut().cast::<Header>());
        if header.state.wake() {
            // The waker's reference transfers to the run queue.
            TaskRef::from_raw(ptr).schedule();
        } else {
            drop(TaskRef::from_raw(ptr));
        }
    }
}

unsafe fn wake_by_ref(ptr: *const ()) {
    // Safety: waker data pointers always come from raw_waker.
    unsafe {
        let header = &*ptr.cast::<Header>();
        tracing::trace!(task.id = %header.id, "wake_by_ref");

        if header.state.wake() {
            let ptr = NonNull::new_unchecked(ptr.cast_mut().cast::<Header>());
            let task = TaskRef::from_raw(ptr);
            // The queue needs its own reference; ours stays with the
            // waker.
            let queued = task.clone();
            let _ = task.into_raw();
            queued.schedule();
        }
    }
}

unsafe fn drop_waker(ptr: *const ()) {
    // Safety: waker data pointers always come from raw_waker.
    unsafe {
        let ptr = NonNull::new_unchecked(ptr.cast_mut().cast::<Header>());
        drop(TaskRef::from_raw(ptr));
    }
}
