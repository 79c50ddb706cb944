// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-worker run queue plumbing.
//!
//! Each worker owns a bounded [`Deque`]: LIFO on the owner end for
//! locality and recursion-depth control, FIFO on the stealing end so
//! thieves pick up the coarsest work units first. Orderings follow
//! Lê et al., "Correct and Efficient Work-Stealing for Weak Memory
//! Models" (2013).
//!
//! Cross-worker and off-pool submission goes through the worker's
//! [`Inbox`], a Vyukov-style MPSC queue, so a foreign thread never has to
//! touch the owner end of a deque.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering, fence};

use crossbeam_utils::CachePadded;

use crate::task::{Header, TaskRef};

/// Fixed capacity of a worker's run queue. Exceeding it is a fatal
/// overflow; workloads must bound their fan-out.
pub(crate) const CAPACITY: usize = 4096;
const MASK: isize = CAPACITY as isize - 1;

/// Outcome of a steal attempt.
pub(crate) enum Steal {
    Task(TaskRef),
    Empty,
    /// Lost a race against the owner or another thief; retrying may
    /// succeed.
    Retry,
}

/// A bounded Chase-Lev work-stealing deque of task handles.
///
/// `push` and `pop` may only be called by the owning worker; `steal` may
/// be called from anywhere.
pub(crate) struct Deque {
    /// Owner cursor. Only the owner writes it.
    bottom: CachePadded<AtomicIsize>,
    /// Thief cursor, advanced by CAS.
    top: CachePadded<AtomicIsize>,
    buffer: Box<[AtomicPtr<Header>]>,
}

impl Deque {
    pub(crate) fn new() -> Self {
        const { assert!(CAPACITY.is_power_of_two()) };

        let buffer = (0..CAPACITY)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Self {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer,
        }
    }

    #[inline]
    fn slot(&self, index: isize) -> &AtomicPtr<Header> {
        // The mask keeps the index in bounds for any cursor value.
        &self.buffer[(index & MASK) as usize]
    }

    /// Pushes a task onto the owner end.
    ///
    /// Owner-only. Fails (returning the task) when the queue is full.
    pub(crate) fn push(&self, task: TaskRef) -> Result<(), TaskRef> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);

        if bottom - top >= CAPACITY as isize {
            return Err(task);
        }

        self.slot(bottom)
            .store(task.into_raw().as_ptr(), Ordering::Relaxed);

        // The release store publishes the slot write to stealers that
        // observe the advanced bottom.
        self.bottom.store(bottom + 1, Ordering::Release);
        Ok(())
    }

    /// Pops a task from the owner end (most recently pushed first).
    ///
    /// Owner-only.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::Relaxed);

        // The fence orders the speculative bottom decrement before the top
        // load; a concurrent stealer is guaranteed to see one or the
        // other.
        fence(Ordering::SeqCst);

        let top = self.top.load(Ordering::Relaxed);

        if top > bottom {
            // Queue was empty; undo the decrement.
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        let raw = self.slot(bottom).load(Ordering::Relaxed);

        if top == bottom {
            // Last element: race any stealers for it by advancing top.
            let won = self
                .top
                .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(bottom + 1, Ordering::Relaxed);

            // Safety: on a won race the slot value is ours exclusively;
            // the pointer was produced by push.
            return won.then(|| unsafe { TaskRef::from_raw(NonNull::new_unchecked(raw)) });
        }

        // Safety: more than one element, no stealer can reach this slot.
        Some(unsafe { TaskRef::from_raw(NonNull::new_unchecked(raw)) })
    }

    /// Steals the oldest task. Callable from any thread.
    pub(crate) fn steal(&self) -> Steal {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if top >= bottom {
            return Steal::Empty;
        }

        // Read the slot before claiming it; the claim CAS below validates
        // the read.
        let raw = self.slot(top).load(Ordering::Relaxed);

        if self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Steal::Retry;
        }

        // Safety: the CAS succeeded, so the slot at `top` was ours to
        // take and held a pointer produced by push.
        Steal::Task(unsafe { TaskRef::from_raw(NonNull::new_unchecked(raw)) })
    }

    /// Whether the queue looks empty. Exact for the owner; a racy hint for
    /// everyone else.
    pub(crate) fn is_empty(&self) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        bottom - top <= 0
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        // By the time the queue is dropped no other thread can reach it;
        // release whatever tasks are left.
        while let Some(task) = self.pop() {
            drop(task);
        }
    }
}

// Safety: cursor protocol above; slots hold plain pointers.
unsafe impl Send for Deque {}
// Safety: see above.
unsafe impl Sync for Deque {}

/// A node of the [`Inbox`] list. The list always contains one "stub" node
/// whose value has already been taken.
struct Node {
    next: AtomicPtr<Node>,
    value: Option<TaskRef>,
}

/// A Vyukov MPSC queue: lock-free multi-producer push, owner-only pop.
pub(crate) struct Inbox {
    /// Producer end.
    head: CachePadded<AtomicPtr<Node>>,
    /// Consumer end; only the owning worker touches it.
    tail: UnsafeCell<*mut Node>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }));

        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: UnsafeCell::new(stub),
        }
    }

    /// Enqueues a task. Callable from any thread.
    pub(crate) fn push(&self, task: TaskRef) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(task),
        }));

        let prev = self.head.swap(node, Ordering::AcqRel);
        // Between the swap and this store the queue is "inconsistent":
        // pop cannot reach `node` yet. is_empty still reports non-empty,
        // which is all the worker loop needs to keep retrying.
        // Safety: prev was a valid node and only this producer links it.
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Dequeues the oldest task, if any is linked in. Owner-only.
    ///
    /// May return `None` while a push is mid-flight even though
    /// [`is_empty`](Self::is_empty) reports non-empty; the caller just
    /// tries again later.
    pub(crate) fn pop(&self) -> Option<TaskRef> {
        // Safety: owner-only access to the consumer end.
        unsafe {
            let tail = *self.tail.get();
            let next = (*tail).next.load(Ordering::Acquire);

            if next.is_null() {
                return None;
            }

            // Advance the consumer end; `next` becomes the new stub.
            let value = (*next).value.take();
            *self.tail.get() = next;
            drop(Box::from_raw(tail));

            debug_assert!(value.is_some(), "non-stub inbox node without a value");
            value
        }
    }

    /// Whether the inbox is empty, counting mid-flight pushes as present.
    pub(crate) fn is_empty(&self) -> bool {
        // Safety: reading the consumer pointer is fine from the owner;
        // foreign callers only use this as a hint.
        let tail = unsafe { *self.tail.get() };
        self.head.load(Ordering::Acquire) == tail
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        // Safety: exclusive access during drop.
        unsafe {
            let mut node = *self.tail.get();
            while !node.is_null() {
                let mut boxed = Box::from_raw(node);
                drop(boxed.value.take());
                node = *boxed.next.get_mut();
            }
        }
    }
}

// Safety: producers synchronise through `head`, the consumer end is
// owner-only by contract.
unsafe impl Send for Inbox {}
// Safety: see above.
unsafe impl Sync for Inbox {}
