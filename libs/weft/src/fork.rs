// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fork/join continuation-passing tasks.
//!
//! An [`Execute`] body runs once per dispatch and may return another task
//! to run *immediately on the same worker, bypassing the run queue* — the
//! key latency lever for recursive decomposition. Each task carries
//!
//! - a **ref count**: the number of children still in flight. When a
//!   child (or cancelled task) finishes, it decrements its continuation's
//!   count; whoever reaches zero runs the continuation inline.
//! - a **continuation link** to its parent task. Links form a reverse
//!   tree, so there are no cycles by construction; the link holds a
//!   counted [`TaskRef`], which is what makes parents outlive their
//!   children.
//! - an optional [`CancellationToken`] shared across a subtree. Cancelled
//!   tasks are not executed, but their continuation accounting still runs
//!   so joins complete.
//!
//! Instead of taking a parent argument on an allocation call, new tasks
//! are built *from* their parent: [`TypedRef::child`] records the parent
//! as the child's continuation, [`ForkCx::make_continuation`] steals the
//! running task's continuation for a newly interposed parent, and
//! [`ForkCx::recycle_as_child_of`] re-enlists the running task itself
//! instead of freeing it.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::executor::{Core, Executor, Worker};
use crate::task::{Header, TaskRef, VTable};

/// A shared flag cancelling a subtree of fork/join tasks.
///
/// Checked by the dispatcher before each execution; tasks observed
/// cancelled are skipped (their join accounting still runs). Cancellation
/// is cooperative — a task already executing finishes its current step.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A fork/join task body.
pub trait Execute: Send + 'static {
    /// Runs one step of this task.
    ///
    /// Returning `Some(task)` bypasses the run queue: the returned task
    /// executes next on this worker.
    fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef>;
}

/// Layout prefix shared by every `ForkCell<T>`; the dispatcher works on
/// this, the typed body is only reached through `execute_fn`.
#[repr(C)]
pub(crate) struct ForkPrefix {
    header: Header,
    /// Children still in flight. The continuation runs when a decrement
    /// observes zero.
    ref_count: AtomicI32,
    /// The task to run when this one and all its children are done.
    ///
    /// Touched only by the single owner the protocol designates: the
    /// builder before the task is spawned, or the worker currently
    /// dispatching it.
    continuation: UnsafeCell<Option<TaskRef>>,
    /// Shared with the rest of the subtree, if cancellation is in play.
    token: UnsafeCell<Option<CancellationToken>>,
    /// Monomorphic entry into the typed body.
    execute_fn: unsafe fn(NonNull<Header>, &mut ForkCx<'_>) -> Option<TaskRef>,
}

impl ForkPrefix {
    fn is_cancelled(&self) -> bool {
        // Safety: the token is written before the task is spawned and
        // only read afterwards.
        unsafe { (*self.token.get()).as_ref().is_some_and(CancellationToken::is_cancelled) }
    }

    /// Takes the continuation link out of the cell.
    ///
    /// # Safety
    ///
    /// Caller must be the protocol-designated owner of the cell (its
    /// dispatcher, or the builder before spawn).
    unsafe fn take_continuation(&self) -> Option<TaskRef> {
        // Safety: ensured by caller.
        unsafe { (*self.continuation.get()).take() }
    }
}

#[repr(C)]
struct ForkCell<T: Execute> {
    prefix: ForkPrefix,
    body: UnsafeCell<T>,
}

impl<T: Execute> ForkCell<T> {
    const VTABLE: VTable = VTable {
        run: dispatch,
        read_output: no_output,
        deallocate: Self::deallocate,
    };

    fn allocate(body: T, continuation: Option<TaskRef>, core: Arc<Core>) -> TypedRef<T> {
        let header = Header::new(&Self::VTABLE, core, tracing::Span::none());
        let span = tracing::trace_span!(
            "fork",
            task.id = %header.id,
            task.body = %std::any::type_name::<T>(),
        );

        let cell = Box::new(Self {
            prefix: ForkPrefix {
                header: Header { span, ..header },
                ref_count: AtomicI32::new(0),
                continuation: UnsafeCell::new(continuation),
                token: UnsafeCell::new(None),
                execute_fn: Self::execute_body,
            },
            body: UnsafeCell::new(body),
        });

        let ptr = NonNull::from(Box::leak(cell));
        TypedRef {
            // Safety: the fresh cell starts with one counted reference.
            task: unsafe { TaskRef::from_raw(ptr.cast()) },
            typed: ptr,
        }
    }

    /// # Safety
    ///
    /// `ptr` must point at a `ForkCell<T>` whose dispatcher the caller
    /// is (exclusive body access).
    unsafe fn execute_body(ptr: NonNull<Header>, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
        // Safety: ensured by caller.
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            let _span = this.prefix.header.span.enter();
            (*this.body.get()).execute(cx)
        }
    }

    /// # Safety
    ///
    /// Reference count must be zero.
    unsafe fn deallocate(ptr: NonNull<Header>) {
        // Safety: last reference gone.
        unsafe {
            debug_assert_eq!(ptr.as_ref().state.refcount(), 0);
            drop(Box::from_raw(ptr.cast::<Self>().as_ptr()));
        }
    }
}

unsafe fn no_output(_: NonNull<Header>, _: *mut ()) {
    unreachable!("fork/join tasks have no join output");
}

/// Views a fork cell through its type-erased prefix.
///
/// # Safety
///
/// `ptr` must point at a fork cell (`run == dispatch`); continuation
/// links and bypass returns uphold this by construction.
unsafe fn prefix_of<'a>(ptr: NonNull<Header>) -> &'a ForkPrefix {
    // Safety: ensured by caller.
    unsafe { ptr.cast::<ForkPrefix>().as_ref() }
}

/// Allocates a root fork task with no continuation.
pub(crate) fn allocate_root<T: Execute>(body: T, core: Arc<Core>) -> TypedRef<T> {
    ForkCell::allocate(body, None, core)
}

/// Runs `f` against the typed body of a quiescent fork task.
///
/// # Safety
///
/// `task` must point at a `ForkCell<T>`, and the task must not be
/// executing concurrently (the caller is the actor that parked it).
pub(crate) unsafe fn with_body<T: Execute, R>(task: &TaskRef, f: impl FnOnce(&mut T) -> R) -> R {
    // Safety: ensured by caller.
    unsafe {
        let cell = task.raw().cast::<ForkCell<T>>();
        f(&mut *cell.as_ref().body.get())
    }
}

/// The fork/join dispatch loop, entered from the worker with a queue
/// reference to one task and run until its continuation chain is
/// exhausted.
///
/// # Safety
///
/// `ptr` must point at a fork cell; the caller transfers its queue
/// reference into the call.
pub(crate) unsafe fn dispatch(ptr: NonNull<Header>, worker: &mut Worker) {
    // Safety: contract above.
    let mut task = unsafe { TaskRef::from_raw(ptr) };

    loop {
        // Safety: only fork cells enter this loop.
        let prefix = unsafe { prefix_of(task.raw()) };

        // Cancelled tasks skip execution, but their continuation still
        // gets its decrement so the join completes.
        if prefix.is_cancelled() {
            tracing::trace!(task.id = %task.id(), "skipping cancelled task");
            // Safety: we are this task's dispatcher.
            let next = unsafe { prefix.take_continuation() };
            drop(task);
            match maybe_next(next) {
                Some(next) => {
                    task = next;
                    continue;
                }
                None => return,
            }
        }

        worker.current_fork = Some(task.raw());
        worker.recyclable = false;

        let bypass = {
            let mut cx = ForkCx {
                worker: &mut *worker,
            };
            // Safety: dispatcher exclusivity over the body.
            unsafe { (prefix.execute_fn)(task.raw(), &mut cx) }
        };

        worker.current_fork = None;

        if !worker.recyclable && prefix.ref_count.load(Ordering::Acquire) <= 0 {
            // Safety: we are this task's dispatcher.
            let next = unsafe { prefix.take_continuation() };
            drop(task);

            if let Some(bypass) = bypass {
                // The bypass takes the inline slot, but the finished
                // task's continuation still gets its decrement — it must
                // run exactly once, so if we were the last child it goes
                // to the queue instead.
                if let Some(next) = maybe_next(next) {
                    worker.push_local(next);
                }
                task = bypass;
                continue;
            }

            match maybe_next(next) {
                Some(next) => {
                    task = next;
                    continue;
                }
                None => return,
            }
        } else if let Some(bypass) = bypass {
            task = bypass;
            continue;
        } else {
            // Recycled for later (e.g. re-armed on the I/O bridge) or
            // still waiting for children; either way someone else holds a
            // reference and will run it.
            drop(task);
            return;
        }
    }
}

/// Decrements `c`'s child count, returning it when this was the last
/// outstanding child so the caller runs the continuation inline.
fn maybe_next(c: Option<TaskRef>) -> Option<TaskRef> {
    let c = c?;
    // Safety: continuations are always fork cells.
    let prefix = unsafe { prefix_of(c.raw()) };
    if prefix.ref_count.fetch_sub(1, Ordering::AcqRel) - 1 <= 0 {
        Some(c)
    } else {
        // Other children still running; the last of them picks the
        // continuation up. Dropping `c` here only releases our counted
        // reference, the children hold their own.
        None
    }
}

/// A typed handle to a not-yet-completed fork task.
///
/// The handle is unique (not `Clone`), which is what makes the `&mut`
/// accessors safe: until the task is spawned, nobody else touches the
/// cell. Pointers obtained through [`data_ptr`](Self::data_ptr) are the
/// workload's own responsibility — the runtime only guarantees the cell
/// outlives its children.
pub struct TypedRef<T: Execute> {
    task: TaskRef,
    typed: NonNull<ForkCell<T>>,
}

// Safety: the cell is heap-allocated and the body is T: Send.
unsafe impl<T: Execute> Send for TypedRef<T> {}

impl<T: Execute> TypedRef<T> {
    /// Creates a new task with `self` recorded as its continuation:
    /// `self` will not run (nor be freed) before the child and every
    /// other outstanding child has finished.
    ///
    /// A ref-count slot for the child must have been reserved via
    /// [`set_ref_count`](Self::set_ref_count) before the child runs.
    pub fn child<U: Execute>(&self, body: U) -> TypedRef<U> {
        ForkCell::allocate(
            body,
            Some(self.task.clone()),
            Arc::clone(&self.task.header().core),
        )
    }

    /// Sets the number of children that must finish before this task
    /// runs. Must cover every child spawned (or recycled) against this
    /// task.
    pub fn set_ref_count(&self, count: i32) {
        self.prefix().ref_count.store(count, Ordering::Release);
    }

    pub fn ref_count(&self) -> i32 {
        self.prefix().ref_count.load(Ordering::Acquire)
    }

    /// Attaches a cancellation token. Call before spawning.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        // Safety: unique handle, task not yet spawned.
        unsafe {
            *self.prefix().token.get() = Some(token);
        }
    }

    /// Access to the task body; valid while the handle is the only actor
    /// on the cell (i.e. before the task is spawned or children run
    /// against it).
    pub fn data_mut(&mut self) -> &mut T {
        // Safety: unique handle, exclusive by the fork protocol.
        unsafe { &mut *self.typed.as_ref().body.get() }
    }

    /// A raw pointer to the task body, e.g. for result slots the
    /// children write into. The cell stays alive until its ref count has
    /// drained and it has executed.
    pub fn data_ptr(&self) -> NonNull<T> {
        // Safety: body is a field of the live cell.
        unsafe { NonNull::new_unchecked(self.typed.as_ref().body.get()) }
    }

    /// The task's id.
    pub fn id(&self) -> crate::task::Id {
        self.task.id()
    }

    /// Degrades this handle into a spawnable task reference.
    pub fn into_task(self) -> TaskRef {
        self.task
    }

    fn prefix(&self) -> &ForkPrefix {
        // Safety: self.task points at a fork cell by construction.
        unsafe { prefix_of(self.task.raw()) }
    }
}

/// The dispatcher-side context handed to [`Execute::execute`].
///
/// Scheduler state travels through this explicit parameter rather than
/// thread-locals, so it stays correct no matter which worker picks a task
/// up.
pub struct ForkCx<'a> {
    pub(crate) worker: &'a mut Worker,
}

impl ForkCx<'_> {
    /// The id of the worker executing this task.
    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    /// A handle to the executor this task runs on.
    pub fn executor(&self) -> Executor {
        self.worker.executor()
    }

    /// Enqueues `task` on this worker's queue (LIFO end).
    pub fn spawn(&mut self, task: TaskRef) {
        self.worker.push_local(task);
    }

    /// A reference to the currently executing task.
    pub fn current(&self) -> TaskRef {
        let ptr = self
            .worker
            .current_fork
            .expect("ForkCx::current outside of a fork task");
        // Safety: the dispatcher's queue reference keeps the cell alive
        // for the duration of execute; cloning takes our own.
        let task = std::mem::ManuallyDrop::new(unsafe { TaskRef::from_raw(ptr) });
        (*task).clone()
    }

    /// Creates a new task *between* the current task and its parent: the
    /// current task's continuation moves onto the new task, which becomes
    /// the current task's parent for joining purposes.
    pub fn make_continuation<T: Execute>(&mut self, body: T) -> TypedRef<T> {
        let ptr = self
            .worker
            .current_fork
            .expect("ForkCx::make_continuation outside of a fork task");
        // Safety: current_fork is a fork cell and we are its dispatcher.
        let stolen = unsafe { prefix_of(ptr).take_continuation() };

        ForkCell::allocate(body, stolen, self.worker.core_arc())
    }

    /// Marks the current task as recyclable: the dispatcher will not free
    /// it after this execution, because it has been re-armed elsewhere
    /// (typically on the I/O bridge).
    pub fn recycle(&mut self) {
        self.worker.recyclable = true;
    }

    /// Reuses the current task as a child of `parent` instead of freeing
    /// it: its continuation is pointed at `parent` and it is marked
    /// recyclable. The caller is responsible for arranging its next run
    /// (usually by returning it as the bypass task) and for having
    /// reserved a ref-count slot on `parent`.
    pub fn recycle_as_child_of<P: Execute>(&mut self, parent: &TypedRef<P>) {
        let ptr = self
            .worker
            .current_fork
            .expect("ForkCx::recycle_as_child_of outside of a fork task");
        // Safety: current_fork is a fork cell and we are its dispatcher.
        unsafe {
            *prefix_of(ptr).continuation.get() = Some(parent.task.clone());
        }
        self.worker.recyclable = true;
    }

    pub(crate) fn current_io(&mut self) -> Option<&mut crate::io::ReadState> {
        // Safety: set by the I/O continuation task for the duration of
        // its callback; no other reference into the state is live then.
        self.worker.current_io.map(|mut ptr| unsafe { ptr.as_mut() })
    }

    pub(crate) fn core_arc(&self) -> Arc<Core> {
        self.worker.core_arc()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::executor::Executor;

    const CUTOFF: u64 = 10;

    fn serial_fib(n: u64) -> u64 {
        if n < 2 { n } else { serial_fib(n - 1) + serial_fib(n - 2) }
    }

    /// Writes `x + y` into the result slot once both children finished.
    struct FibJoin {
        sum: NonNull<u64>,
        x: u64,
        y: u64,
    }

    // Safety: the raw slots follow the fork protocol (parent outlives
    // children; one writer per slot).
    unsafe impl Send for FibJoin {}

    impl Execute for FibJoin {
        fn execute(&mut self, _cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            // Safety: both children have finished writing, we are the
            // only remaining writer.
            unsafe {
                *self.sum.as_ptr() = self.x + self.y;
            }
            None
        }
    }

    struct FibTask {
        n: u64,
        sum: NonNull<u64>,
    }

    // Safety: as for FibJoin.
    unsafe impl Send for FibTask {}

    impl Execute for FibTask {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            if self.n < CUTOFF {
                // Safety: exclusive slot per the protocol.
                unsafe {
                    *self.sum.as_ptr() = serial_fib(self.n);
                }
                return None;
            }

            let join = cx.make_continuation(FibJoin {
                sum: self.sum,
                x: 0,
                y: 0,
            });
            let join_body = join.data_ptr().as_ptr();
            // Safety: the join cell outlives both children by the
            // ref-count protocol.
            let (x, y) = unsafe {
                (
                    NonNull::new_unchecked(&raw mut (*join_body).x),
                    NonNull::new_unchecked(&raw mut (*join_body).y),
                )
            };

            let a = join.child(FibTask {
                n: self.n - 2,
                sum: x,
            });

            // Reuse ourselves as the second child instead of allocating.
            self.n -= 1;
            self.sum = y;
            cx.recycle_as_child_of(&join);
            join.set_ref_count(2);

            cx.spawn(a.into_task());
            Some(cx.current())
        }
    }

    /// Root continuation: publishes the result and shuts the pool down.
    struct Finish {
        sum: NonNull<u64>,
        out: Arc<AtomicU64>,
        runs: Arc<AtomicUsize>,
    }

    // Safety: as for FibJoin.
    unsafe impl Send for Finish {}

    impl Execute for Finish {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            // Safety: every child is done, the slot is quiescent.
            unsafe {
                self.out.store(*self.sum.as_ptr(), Ordering::Release);
            }
            self.runs.fetch_add(1, Ordering::AcqRel);
            cx.executor().stop();
            None
        }
    }

    fn run_fib(workers: usize, n: u64) -> u64 {
        let exec = Executor::new(workers).unwrap();

        let slot = Box::into_raw(Box::new(0u64));
        // Safety: freshly allocated, non-null.
        let sum = unsafe { NonNull::new_unchecked(slot) };
        let out = Arc::new(AtomicU64::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let finish = exec.fork(Finish {
            sum,
            out: Arc::clone(&out),
            runs: Arc::clone(&runs),
        });
        finish.set_ref_count(1);
        let root = finish.child(FibTask { n, sum });
        drop(finish);

        exec.spawn_task(root.into_task());
        exec.join();

        // Safety: the pool is quiet, reclaim the slot.
        drop(unsafe { Box::from_raw(slot) });

        assert_eq!(runs.load(Ordering::Acquire), 1);
        out.load(Ordering::Acquire)
    }

    #[test]
    fn fib_single_worker() {
        assert_eq!(run_fib(1, 20), serial_fib(20));
    }

    #[test]
    fn fib_matches_serial_regardless_of_workers() {
        let expected = serial_fib(25);
        for workers in [1, 2, 4] {
            assert_eq!(run_fib(workers, 25), expected);
        }
    }

    // Scenario pinned by the original demo: fib(45) with 8 workers.
    // Slow in debug builds, so opt in with --ignored.
    #[test]
    #[ignore = "long-running"]
    fn fib_45() {
        assert_eq!(run_fib(8, 45), 1_134_903_170);
    }

    struct Increment {
        counter: Arc<AtomicUsize>,
    }

    impl Execute for Increment {
        fn execute(&mut self, _cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            self.counter.fetch_add(1, Ordering::AcqRel);
            None
        }
    }

    struct FanIn {
        counter: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
    }

    impl Execute for FanIn {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            assert_eq!(self.counter.load(Ordering::Acquire), 1000);
            self.runs.fetch_add(1, Ordering::AcqRel);
            cx.executor().stop();
            None
        }
    }

    #[test]
    fn fan_out_fan_in_runs_continuation_exactly_once() {
        let exec = Executor::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let parent = exec.fork(FanIn {
            counter: Arc::clone(&counter),
            runs: Arc::clone(&runs),
        });
        parent.set_ref_count(1000);

        for i in 0..1000 {
            let child = parent.child(Increment {
                counter: Arc::clone(&counter),
            });
            exec.spawn_task_to(i % exec.num_workers(), child.into_task());
        }
        drop(parent);

        exec.join();

        assert_eq!(counter.load(Ordering::Acquire), 1000);
        assert_eq!(runs.load(Ordering::Acquire), 1);
    }

    struct MustNotRun {
        ran: Arc<AtomicBool>,
    }

    impl Execute for MustNotRun {
        fn execute(&mut self, _cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            self.ran.store(true, Ordering::Release);
            None
        }
    }

    struct StopTask;

    impl Execute for StopTask {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            cx.executor().stop();
            None
        }
    }

    #[test]
    fn cancelled_task_skips_execution_but_joins() {
        let exec = Executor::new(2).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        // The parent must still run even though its only child is
        // cancelled before it ever executes.
        let parent = exec.fork(StopTask);
        parent.set_ref_count(1);
        let mut child = parent.child(MustNotRun {
            ran: Arc::clone(&ran),
        });
        child.set_cancellation_token(token.clone());
        drop(parent);

        token.cancel();
        exec.spawn_task(child.into_task());
        exec.join();

        assert!(!ran.load(Ordering::Acquire));
    }

    struct CountPerWorker {
        counts: Arc<Vec<AtomicUsize>>,
    }

    impl Execute for CountPerWorker {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            // Enough busywork that thieves get a chance to pitch in.
            for i in 0..2_000u64 {
                std::hint::black_box(i);
            }
            self.counts[cx.worker_id()].fetch_add(1, Ordering::AcqRel);
            None
        }
    }

    struct Tally {
        counts: Arc<Vec<AtomicUsize>>,
        total: usize,
    }

    impl Execute for Tally {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            let per_worker: Vec<_> = self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Acquire))
                .collect();
            assert_eq!(per_worker.iter().sum::<usize>(), self.total);
            // Worker 0 produced everything; the others must have stolen
            // at least part of it.
            assert!(per_worker[0] < self.total, "no task was ever stolen");
            cx.executor().stop();
            None
        }
    }

    /// Emits children in queue-sized waves: pushes the next wave task
    /// first so the LIFO owner end drains the children before producing
    /// more.
    struct Wave {
        parent: Option<TypedRef<Tally>>,
        remaining: usize,
        counts: Arc<Vec<AtomicUsize>>,
    }

    impl Execute for Wave {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            const WAVE: usize = 1024;

            let parent = self.parent.take().expect("wave without a parent");
            let batch = self.remaining.min(WAVE);
            let rest = self.remaining - batch;

            let children: Vec<_> = (0..batch)
                .map(|_| {
                    parent
                        .child(CountPerWorker {
                            counts: Arc::clone(&self.counts),
                        })
                        .into_task()
                })
                .collect();

            // The next wave goes in first: the LIFO owner end then drains
            // all children before producing more, bounding queue depth.
            if rest > 0 {
                let next = cx.executor().fork(Wave {
                    parent: Some(parent),
                    remaining: rest,
                    counts: Arc::clone(&self.counts),
                });
                cx.spawn(next.into_task());
            }

            for child in children {
                cx.spawn(child);
            }

            None
        }
    }

    #[test]
    fn worker_zero_floods_and_the_pool_steals() {
        const TOTAL: usize = 10_000;

        let exec = Executor::new(4).unwrap();
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

        let parent = exec.fork(Tally {
            counts: Arc::clone(&counts),
            total: TOTAL,
        });
        parent.set_ref_count(TOTAL as i32);

        let wave = exec.fork(Wave {
            parent: Some(parent),
            remaining: TOTAL,
            counts: Arc::clone(&counts),
        });
        // Target worker 0 explicitly: it is the sole producer.
        exec.spawn_task_to(0, wave.into_task());

        exec.join();
    }

    struct Pulse {
        remaining: usize,
        pulses: Arc<AtomicUsize>,
        worker: Arc<AtomicUsize>,
    }

    impl Execute for Pulse {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            self.pulses.fetch_add(1, Ordering::AcqRel);
            self.worker.store(cx.worker_id(), Ordering::Release);

            if self.remaining == 0 {
                cx.executor().stop();
                return None;
            }
            self.remaining -= 1;

            // Stay alive and run again immediately, on this worker,
            // without touching the queue.
            cx.recycle();
            Some(cx.current())
        }
    }

    #[test]
    fn recycled_bypass_reruns_inline() {
        let exec = Executor::new(1).unwrap();
        let pulses = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(AtomicUsize::new(usize::MAX));

        let task = exec.fork(Pulse {
            remaining: 4,
            pulses: Arc::clone(&pulses),
            worker: Arc::clone(&worker),
        });
        exec.spawn_task(task.into_task());
        exec.join();

        assert_eq!(pulses.load(Ordering::Acquire), 5);
        assert_eq!(worker.load(Ordering::Acquire), 0);
    }
}
