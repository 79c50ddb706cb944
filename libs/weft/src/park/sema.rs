// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cross-thread wake primitive.
//!
//! [`Semaphore`] keeps its count in userspace and only falls back to the
//! OS (a `Mutex`/`Condvar` pair here) once a waiter actually has to go to
//! sleep, so uncontended signal/wait pairs never enter the kernel.
//! [`AutoResetEvent`] layers the classic signalled/reset/N-waiters
//! protocol on top, which is what workers park on.

use std::sync::atomic::{AtomicI32, AtomicIsize, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_utils::Backoff;

use crate::park::Park;

/// The portable "OS semaphore" the userspace fast path falls back to.
struct OsSemaphore {
    count: Mutex<isize>,
    cond: Condvar,
}

impl OsSemaphore {
    const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn signal(&self, n: isize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }
}

/// A counting semaphore with a bounded userspace spin before sleeping.
///
/// A negative count records the number of threads gone (or going) to
/// sleep on the OS semaphore.
pub(crate) struct Semaphore {
    count: AtomicIsize,
    sema: OsSemaphore,
}

impl Semaphore {
    pub(crate) const fn new(initial: isize) -> Self {
        Self {
            count: AtomicIsize::new(initial),
            sema: OsSemaphore::new(),
        }
    }

    /// Attempts to take one unit without blocking.
    pub(crate) fn try_wait(&self) -> bool {
        let count = self.count.load(Ordering::Relaxed);
        count > 0
            && self
                .count
                .compare_exchange(count, count - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Takes one unit, blocking until one is available.
    pub(crate) fn wait(&self) {
        if !self.try_wait() {
            self.wait_with_spin();
        }
    }

    #[cold]
    fn wait_with_spin(&self) {
        // Spin for a while before committing to a kernel sleep; under load
        // a signal usually arrives within the spin window.
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.try_wait() {
                return;
            }
            backoff.spin();
        }

        let old = self.count.fetch_sub(1, Ordering::Acquire);
        if old <= 0 {
            self.sema.wait();
        }
    }

    /// Adds `n` units, waking up to `n` sleepers.
    pub(crate) fn signal(&self, n: isize) {
        let old = self.count.fetch_add(n, Ordering::Release);
        // Only threads recorded as sleeping (negative count) consume an OS
        // signal.
        let to_release = (-old).min(n);
        if to_release > 0 {
            self.sema.signal(to_release);
        }
    }
}

/// An auto-reset event: at most one signal is remembered.
///
/// `status == 1` signalled, `status == 0` reset with no waiters,
/// `status == -N` reset with N waiters.
pub(crate) struct AutoResetEvent {
    status: AtomicI32,
    sema: Semaphore,
}

impl AutoResetEvent {
    pub(crate) const fn new() -> Self {
        Self {
            status: AtomicI32::new(0),
            sema: Semaphore::new(0),
        }
    }

    /// Signals the event, waking one waiter if any. Signalling an already
    /// signalled event is a no-op, so wakeups never accumulate.
    pub(crate) fn signal(&self) {
        let mut old = self.status.load(Ordering::Relaxed);
        loop {
            let new = if old < 1 { old + 1 } else { 1 };
            match self.status.compare_exchange_weak(
                old,
                new,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }

        if old < 0 {
            self.sema.signal(1);
        }
    }

    /// Waits for the event to be signalled, consuming the signal.
    pub(crate) fn wait(&self) {
        let old = self.status.fetch_sub(1, Ordering::Acquire);
        if old < 1 {
            self.sema.wait();
        }
    }
}

impl Park for AutoResetEvent {
    fn park(&self) {
        self.wait();
    }

    fn unpark(&self) {
        self.signal();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn semaphore_passes_units_across_threads() {
        let sema = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..4)
            .map(|_| {
                let sema = Arc::clone(&sema);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    sema.wait();
                    woken.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        sema.signal(4);
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Acquire), 4);
    }

    #[test]
    fn semaphore_signal_before_wait_is_not_lost() {
        let sema = Semaphore::new(0);
        sema.signal(1);
        // Must return immediately.
        sema.wait();
    }

    #[test]
    fn event_remembers_at_most_one_signal() {
        let event = Arc::new(AutoResetEvent::new());

        // Two signals, one waiter: the first wait consumes the single
        // remembered signal...
        event.signal();
        event.signal();
        event.wait();

        // ...and a second wait must block until signalled again.
        let blocked = Arc::new(AtomicUsize::new(0));
        let join = thread::spawn({
            let event = Arc::clone(&event);
            let blocked = Arc::clone(&blocked);
            move || {
                event.wait();
                blocked.fetch_add(1, Ordering::Release);
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(blocked.load(Ordering::Acquire), 0);

        event.signal();
        join.join().unwrap();
        assert_eq!(blocked.load(Ordering::Acquire), 1);
    }

    #[test]
    fn event_wakes_one_of_many() {
        let event = Arc::new(AutoResetEvent::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..3)
            .map(|_| {
                let event = Arc::clone(&event);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    event.wait();
                    woken.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        // Give the waiters a chance to actually park.
        thread::sleep(Duration::from_millis(50));

        for _ in 0..3 {
            event.signal();
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Acquire), 3);
    }
}
