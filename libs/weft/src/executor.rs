// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker pool.
//!
//! [`Executor::new(n)`] builds shared state for `n` workers and starts
//! threads for workers `1..n`; the launching thread joins as **worker 0**
//! through [`join`] or [`block_on`] instead of spinning separately.
//! Worker 0's parker is the [reactor](crate::reactor), so I/O readiness
//! is polled exactly while it is out of tasks.
//!
//! Each worker loops: pop its own deque (LIFO), drain its inbox, steal
//! from a randomly-started round-robin victim (FIFO), and park after
//! coming up empty. Spawns targeting another worker go through that
//! worker's inbox and always unpark it; local spawns wake one sleeper so
//! stealing can begin.
//!
//! [`Executor::new(n)`]: Executor::new
//! [`join`]: Executor::join
//! [`block_on`]: Executor::block_on

use std::cell::RefCell;
use std::io;
use std::pin::pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread;

use crossbeam_utils::Backoff;
use weft_fiber::stack::DefaultFiberStack;

use crate::error::SpawnError;
use crate::fork::{Execute, TypedRef};
use crate::park::{AutoResetEvent, Park, Parker};
use crate::queue::{Deque, Inbox, Steal};
use crate::reactor::Reactor;
use crate::task::future::FutureCell;
use crate::task::{Header, JoinHandle, TaskRef};
use crate::{fiber, fork, io::ReadState};

/// Empty steal sweeps over all victims before a worker parks.
const STEAL_ROUNDS: usize = 4;

std::thread_local! {
    /// Which worker (of which pool) this thread currently is.
    static CONTEXT: RefCell<Option<(usize, Arc<Core>)>> = const { RefCell::new(None) };
}

/// Returns the index of the worker the calling thread is running as, if
/// any (`0` for the main thread after it joined a pool).
pub fn current_worker_id() -> Option<usize> {
    CONTEXT.with_borrow(|cx| cx.as_ref().map(|(id, _)| *id))
}

/// The executor of the calling worker thread.
pub(crate) fn current_core() -> Option<Arc<Core>> {
    CONTEXT.with_borrow(|cx| cx.as_ref().map(|(_, core)| Arc::clone(core)))
}

/// The calling thread's worker id, if it belongs to `core`'s pool.
fn context_for(core: &Arc<Core>) -> Option<usize> {
    CONTEXT.with_borrow(|cx| {
        cx.as_ref()
            .and_then(|(id, c)| Arc::ptr_eq(c, core).then_some(*id))
    })
}

/// Restores the previous thread context on drop.
struct ContextGuard;

impl ContextGuard {
    fn set(id: usize, core: &Arc<Core>) -> Self {
        CONTEXT.with_borrow_mut(|cx| {
            assert!(cx.is_none(), "thread is already driving a worker");
            *cx = Some((id, Arc::clone(core)));
        });
        Self
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with_borrow_mut(|cx| *cx = None);
    }
}

/// Shared per-worker state, reachable from every thread.
struct Remote {
    /// The worker's run queue; owner end for the worker itself, steal end
    /// for everyone else.
    deque: Deque,
    /// Mailbox for tasks pushed by other threads.
    inbox: Inbox,
    parker: Parker,
    /// Whether the worker is (about to go) sleeping; wake heuristics scan
    /// this.
    parked: AtomicBool,
    /// Free fiber stacks, bounded by [`fiber::MAX_POOLED_STACKS`].
    stacks: Mutex<Vec<DefaultFiberStack>>,
}

pub(crate) struct Core {
    remotes: Box<[Remote]>,
    reactor: Arc<Reactor>,
    stop: AtomicBool,
    /// Round-robin cursor for placing tasks from outside the pool.
    next_rr: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Core {
    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Hands `task` to some worker, preferring the one that last ran it.
    pub(crate) fn schedule(self: &Arc<Self>, task: TaskRef) {
        let hint = task.header().last_worker.load(Ordering::Relaxed);

        if let Some(id) = context_for(self) {
            if hint == id || hint >= self.remotes.len() {
                self.push_local_from(id, task);
                return;
            }
            // Route the task back to the worker whose cache still knows
            // it.
            self.remotes[hint].inbox.push(task);
            self.unpark(hint);
        } else {
            let target = if hint < self.remotes.len() {
                hint
            } else {
                self.next_rr.fetch_add(1, Ordering::Relaxed) % self.remotes.len()
            };
            self.remotes[target].inbox.push(task);
            self.unpark(target);
        }
    }

    /// Hands `task` to the given worker specifically.
    pub(crate) fn schedule_to(self: &Arc<Self>, worker: usize, task: TaskRef) {
        if context_for(self) == Some(worker) {
            self.push_local_from(worker, task);
        } else {
            self.remotes[worker].inbox.push(task);
            self.unpark(worker);
        }
    }

    /// Pushes onto `id`'s own deque. Must be called from worker `id`.
    fn push_local_from(&self, id: usize, task: TaskRef) {
        if let Err(task) = self.remotes[id].deque.push(task) {
            // Deque overflow is fatal by design; the workload must bound
            // its fan-out.
            panic!(
                "{} on worker {id} (task {:?}); bound the task fan-out",
                SpawnError::QueueFull,
                task.id()
            );
        }
        self.notify_sleeper();
    }

    fn unpark(&self, worker: usize) {
        self.remotes[worker].parker.unpark();
    }

    /// Wakes one parked worker, if any, so new work gets stolen.
    fn notify_sleeper(&self) {
        // Pairs with the fence in Worker::park: either this scan sees the
        // sleeper's flag, or the sleeper's queue re-check sees the task
        // pushed just before the scan.
        std::sync::atomic::fence(Ordering::SeqCst);

        for remote in &self.remotes {
            if remote.parked.load(Ordering::SeqCst) {
                remote.parker.unpark();
                return;
            }
        }
    }

    fn take_stack(self: &Arc<Self>) -> DefaultFiberStack {
        let pooled = context_for(self)
            .and_then(|id| self.remotes[id].stacks.lock().unwrap().pop());

        pooled.unwrap_or_else(|| {
            DefaultFiberStack::new(fiber::DEFAULT_STACK_SIZE)
                .expect("failed to allocate fiber stack")
        })
    }

    fn release_stack(&self, id: usize, stack: DefaultFiberStack) {
        let mut stacks = self.remotes[id].stacks.lock().unwrap();
        if stacks.len() < fiber::MAX_POOLED_STACKS {
            stacks.push(stack);
        }
    }
}

/// A handle to a pool of worker threads executing tasks.
///
/// Handles are cheap to clone and all refer to the same pool.
#[derive(Clone)]
pub struct Executor {
    core: Arc<Core>,
}

impl Executor {
    /// Creates a pool with `workers` workers and starts threads for all
    /// of them but worker 0, which is reserved for the thread that later
    /// calls [`join`](Self::join) or [`block_on`](Self::block_on).
    pub fn new(workers: usize) -> io::Result<Self> {
        assert!(workers >= 1, "a pool needs at least one worker");

        let reactor = Arc::new(Reactor::new()?);

        let remotes = (0..workers)
            .map(|id| Remote {
                deque: Deque::new(),
                inbox: Inbox::new(),
                // Worker 0 parks inside the reactor so that I/O gets
                // polled exactly while it is idle; everyone else parks on
                // an auto-reset event.
                parker: if id == 0 {
                    Parker::new(Arc::clone(&reactor) as Arc<dyn Park>)
                } else {
                    Parker::new(Arc::new(AutoResetEvent::new()))
                },
                parked: AtomicBool::new(false),
                stacks: Mutex::new(Vec::new()),
            })
            .collect();

        let core = Arc::new(Core {
            remotes,
            reactor,
            stop: AtomicBool::new(false),
            next_rr: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = Vec::with_capacity(workers.saturating_sub(1));
        for id in 1..workers {
            let core = Arc::clone(&core);
            let thread = thread::Builder::new()
                .name(format!("weft-worker-{id}"))
                .spawn(move || Worker::new(core, id).run())
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        *core.threads.lock().unwrap() = threads;

        Ok(Self { core })
    }

    pub fn num_workers(&self) -> usize {
        self.core.remotes.len()
    }

    /// Spawns a future onto the pool, returning a [`JoinHandle`] to
    /// await its output or cancel it. Dropping the handle detaches the
    /// task.
    ///
    /// # Panics
    ///
    /// Panics if the executor was stopped.
    #[track_caller]
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.try_spawn(future) {
            Ok(join) => join,
            Err(err) => panic!("spawn failed: {err}"),
        }
    }

    /// Fallible [`spawn`](Self::spawn).
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Closed`] when the executor was stopped.
    pub fn try_spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, SpawnError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.core.is_stopped() {
            return Err(SpawnError::Closed);
        }

        let (task, join) = FutureCell::allocate(future, Arc::clone(&self.core));
        tracing::trace!(task.id = %task.id(), "spawning task");
        self.core.schedule(task);
        Ok(join)
    }

    /// Spawns a fiber: `f` runs on a private machine stack and may use
    /// the blocking-style I/O in [`crate::fiber`], suspending mid-call
    /// and resuming on any worker.
    pub fn spawn_fiber<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = self.core.take_stack();
        let task = fiber::allocate(f, stack, Arc::clone(&self.core));
        tracing::trace!(task.id = %task.id(), "spawning fiber");
        self.core.schedule(task);
    }

    /// Allocates a root fork/join task. Spawn it (or children built from
    /// it) with [`spawn_task`](Self::spawn_task).
    pub fn fork<T: Execute>(&self, body: T) -> TypedRef<T> {
        fork::allocate_root(body, Arc::clone(&self.core))
    }

    /// Enqueues a task on the current worker (or, from outside the pool,
    /// on some worker).
    pub fn spawn_task(&self, task: TaskRef) {
        self.core.schedule(task);
    }

    /// Enqueues a task for a specific worker; used by resumption paths
    /// that know where the task's state is still cached.
    pub fn spawn_task_to(&self, worker: usize, task: TaskRef) {
        assert!(worker < self.num_workers(), "no such worker: {worker}");
        self.core.schedule_to(worker, task);
    }

    /// Turns the calling thread into worker 0 until [`stop`](Self::stop)
    /// is called, then tears the pool down and joins the worker threads.
    pub fn join(&self) {
        Worker::new(Arc::clone(&self.core), 0).run();

        let threads = std::mem::take(&mut *self.core.threads.lock().unwrap());
        for thread in threads {
            thread.join().expect("worker thread panicked");
        }
    }

    /// Drives `future` as worker 0 until it resolves, executing pool
    /// tasks in the meantime. The pool keeps running afterwards.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        Worker::new(Arc::clone(&self.core), 0).block_on(future)
    }

    /// Signals every worker to finish its queued work and shut down.
    pub fn stop(&self) {
        tracing::debug!("stop requested");
        self.core.stop.store(true, Ordering::Release);
        for remote in &self.core.remotes {
            remote.parker.unpark();
        }
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        self.core.reactor()
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("workers", &self.num_workers())
            .field("stopped", &self.core.is_stopped())
            .finish()
    }
}

/// A worker's thread-private state, threaded by `&mut` through every
/// dispatch instead of living in thread-locals.
pub(crate) struct Worker {
    id: usize,
    core: Arc<Core>,
    rng: fastrand::Rng,
    /// The fork/join task currently executing, if any.
    pub(crate) current_fork: Option<NonNull<Header>>,
    /// Set by a fork task wishing to be reused instead of freed.
    pub(crate) recyclable: bool,
    /// The I/O continuation state currently delivering a chunk, if any.
    pub(crate) current_io: Option<NonNull<ReadState>>,
}

impl Worker {
    fn new(core: Arc<Core>, id: usize) -> Self {
        Self {
            id,
            core,
            rng: fastrand::Rng::new(),
            current_fork: None,
            recyclable: false,
            current_io: None,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn executor(&self) -> Executor {
        Executor {
            core: Arc::clone(&self.core),
        }
    }

    pub(crate) fn core_arc(&self) -> Arc<Core> {
        Arc::clone(&self.core)
    }

    /// Enqueues on this worker's own queue and wakes a sleeper to steal.
    pub(crate) fn push_local(&mut self, task: TaskRef) {
        self.core.push_local_from(self.id, task);
    }

    pub(crate) fn release_stack(&self, stack: DefaultFiberStack) {
        self.core.release_stack(self.id, stack);
    }

    /// The work-stealing loop.
    fn run(&mut self) {
        let _span = tracing::debug_span!("worker", worker = self.id).entered();
        let _cx = ContextGuard::set(self.id, &self.core);

        loop {
            if self.tick() {
                continue;
            }

            if self.core.is_stopped() {
                tracing::debug!(worker = self.id, "stop observed, shutting down");
                break;
            }

            self.park();
        }

        self.drain();
    }

    /// Drives `future` on this worker until it resolves.
    fn block_on<F: Future>(&mut self, future: F) -> F::Output {
        let _span = tracing::debug_span!("block_on", worker = self.id).entered();
        let _cx = ContextGuard::set(self.id, &self.core);

        let waker = self.core.remotes[self.id].parker.clone().into_waker();
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }

            if self.tick() {
                continue;
            }

            self.park();
        }
    }

    /// Runs one task if any can be found. Returns whether one ran.
    fn tick(&mut self) -> bool {
        let local = {
            let remote = &self.core.remotes[self.id];
            remote.deque.pop().or_else(|| remote.inbox.pop())
        };

        if let Some(task) = local {
            self.dispatch(task);
            return true;
        }

        if let Some(task) = self.steal_task() {
            self.dispatch(task);
            return true;
        }

        false
    }

    fn dispatch(&mut self, task: TaskRef) {
        task.header().last_worker.store(self.id, Ordering::Relaxed);
        task.run(self);
    }

    /// Tries to take one task from a peer, sweeping the victims from a
    /// random starting point so thieves do not convoy.
    fn steal_task(&mut self) -> Option<TaskRef> {
        let n = self.core.remotes.len();
        if n <= 1 {
            return None;
        }

        let backoff = Backoff::new();

        for _ in 0..STEAL_ROUNDS {
            let start = self.rng.usize(..n);
            let mut contended = false;

            for i in 0..n {
                let victim = (start + i) % n;
                if victim == self.id {
                    continue;
                }

                match self.core.remotes[victim].deque.steal() {
                    Steal::Task(task) => {
                        tracing::trace!(worker = self.id, victim, task.id = %task.id(), "stole task");
                        // If the victim still has queued work, let
                        // another sleeper join in.
                        if !self.core.remotes[victim].deque.is_empty() {
                            self.core.notify_sleeper();
                        }
                        return Some(task);
                    }
                    Steal::Retry => contended = true,
                    Steal::Empty => {}
                }
            }

            if !contended {
                return None;
            }
            backoff.spin();
        }

        None
    }

    /// Parks until unparked, guarding against wakeups racing the decision
    /// to sleep: the parked flag goes up first, then the queues are
    /// re-checked, so a producer either sees the flag or we see its task.
    fn park(&mut self) {
        let remote = &self.core.remotes[self.id];

        remote.parked.store(true, Ordering::SeqCst);
        // Pairs with the fence in Core::notify_sleeper.
        std::sync::atomic::fence(Ordering::SeqCst);

        if !remote.inbox.is_empty() || !remote.deque.is_empty() || self.core.is_stopped() {
            remote.parked.store(false, Ordering::SeqCst);
            return;
        }

        tracing::trace!(worker = self.id, "parking");
        remote.parker.park();
        remote.parked.store(false, Ordering::SeqCst);
        tracing::trace!(worker = self.id, "unparked");
    }

    /// Releases whatever tasks remain after shutdown so no queue keeps
    /// references alive.
    fn drain(&mut self) {
        let remote = &self.core.remotes[self.id];
        while let Some(task) = remote.deque.pop() {
            drop(task);
        }
        while let Some(task) = remote.inbox.pop() {
            drop(task);
        }
    }
}
